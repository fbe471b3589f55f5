use std::fmt;

use bytes::Bytes;

use crate::error::StreamError;

/// Label attached to text chunks, and the conversion used when text becomes bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
    Hex,
    /// The chunk already is raw bytes.
    Buffer,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Latin1 => "latin1",
            Encoding::Hex => "hex",
            Encoding::Buffer => "buffer",
        }
    }

    /// Converts text labelled with this encoding into bytes.
    pub fn encode(self, text: &str) -> Result<Bytes, StreamError> {
        match self {
            Encoding::Utf8 | Encoding::Buffer => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Latin1 => Ok(text.chars().map(|c| c as u32 as u8).collect()),
            Encoding::Hex => hex::decode(text)
                .map(Bytes::from)
                .map_err(|e| StreamError::InvalidEncoding {
                    encoding: self.name(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Renders bytes as text in this encoding. Invalid UTF-8 is replaced, not rejected.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 | Encoding::Buffer => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Hex => hex::encode(bytes),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One unit of data moving through a stream.
///
/// Byte streams carry `Bytes` and `Text`; object-mode streams may carry any of the three,
/// each counting as a single unit.
#[derive(Clone, PartialEq)]
pub enum Chunk<T> {
    Bytes(Bytes),
    Text { text: String, encoding: Encoding },
    Value(T),
}

impl<T> Chunk<T> {
    pub fn text(text: impl Into<String>) -> Self {
        Chunk::Text {
            text: text.into(),
            encoding: Encoding::Utf8,
        }
    }

    pub fn encoded(text: impl Into<String>, encoding: Encoding) -> Self {
        Chunk::Text {
            text: text.into(),
            encoding,
        }
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Chunk::Bytes(bytes.into())
    }

    /// Length in stream units: bytes, chars, or 1 for a value.
    pub fn units(&self) -> usize {
        match self {
            Chunk::Bytes(bytes) => bytes.len(),
            Chunk::Text { text, .. } => text.chars().count(),
            Chunk::Value(_) => 1,
        }
    }

    /// [`Chunk::units`] capped at `limit`. Text is scanned for at most `limit` chars.
    pub(crate) fn units_up_to(&self, limit: usize) -> usize {
        match self {
            Chunk::Text { text, .. } => text.chars().take(limit).count(),
            other => other.units().min(limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Bytes(bytes) => bytes.is_empty(),
            Chunk::Text { text, .. } => text.is_empty(),
            Chunk::Value(_) => false,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Chunk::Text { .. })
    }

    /// The label a dispatch hook sees next to this chunk.
    pub fn encoding(&self) -> Encoding {
        match self {
            Chunk::Text { encoding, .. } => *encoding,
            _ => Encoding::Buffer,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Chunk::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Converts a text chunk into bytes using its own label. Other chunks pass through.
    pub fn into_bytes_chunk(self) -> Result<Self, StreamError> {
        match self {
            Chunk::Text { text, encoding } => encoding.encode(&text).map(Chunk::Bytes),
            other => Ok(other),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Chunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Bytes(bytes) => write!(f, "Bytes({bytes:?})"),
            Chunk::Text { text, encoding } => write!(f, "Text({text:?}, {encoding})"),
            Chunk::Value(value) => write!(f, "Value({value:?})"),
        }
    }
}

impl<T> From<&'static [u8]> for Chunk<T> {
    fn from(bytes: &'static [u8]) -> Self {
        Chunk::Bytes(Bytes::from_static(bytes))
    }
}

impl<T> From<Bytes> for Chunk<T> {
    fn from(bytes: Bytes) -> Self {
        Chunk::Bytes(bytes)
    }
}

impl<T> From<Vec<u8>> for Chunk<T> {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(bytes))
    }
}

impl<T> From<&str> for Chunk<T> {
    fn from(text: &str) -> Self {
        Chunk::text(text)
    }
}

impl<T> From<String> for Chunk<T> {
    fn from(text: String) -> Self {
        Chunk::text(text)
    }
}

/// Incremental bytes-to-text conversion. UTF-8 sequences split across chunks are held back
/// until the rest arrives.
#[derive(Debug, Clone)]
pub(crate) struct TextDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl TextDecoder {
    pub(crate) fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 | Encoding::Buffer => {
                self.pending.extend_from_slice(bytes);
                let keep = incomplete_utf8_tail(&self.pending);
                let tail = self.pending.split_off(self.pending.len() - keep);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = tail;
                text
            }
            other => other.decode(bytes),
        }
    }

    /// Flushes whatever is held back. Incomplete sequences become replacement chars.
    pub(crate) fn end(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Number of trailing bytes that start a UTF-8 sequence the slice does not complete.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Splits `text` after `n` chars, returning the front part.
pub(crate) fn split_text_front(text: &mut String, n: usize) -> String {
    let at = text
        .char_indices()
        .nth(n)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let rest = text.split_off(at);
    std::mem::replace(text, rest)
}
