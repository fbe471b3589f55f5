use std::collections::{vec_deque, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::chunk::{split_text_front, Chunk};

/// Ordered queue of pending chunks.
///
/// Knows nothing about thresholds or notifications; the owning state machine keeps the
/// running unit count and never asks `consume` for more units than it holds.
pub struct ChunkStore<T> {
    chunks: VecDeque<Chunk<T>>,
}

impl<T> Default for ChunkStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChunkStore<T> {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    /// Number of chunks held (not units).
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn push(&mut self, chunk: Chunk<T>) {
        self.chunks.push_back(chunk);
    }

    pub fn unshift(&mut self, chunk: Chunk<T>) {
        self.chunks.push_front(chunk);
    }

    pub fn shift(&mut self) -> Option<Chunk<T>> {
        self.chunks.pop_front()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn first(&self) -> Option<&Chunk<T>> {
        self.chunks.front()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Chunk<T>> {
        self.chunks.iter()
    }

    /// Sum of the units of every held chunk.
    pub fn units(&self) -> usize {
        self.chunks.iter().map(Chunk::units).sum()
    }

    /// Concatenates every chunk as text, placing `separator` between them.
    pub fn join(&self, separator: &str) -> String {
        let mut out = String::new();
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if idx > 0 {
                out.push_str(separator);
            }
            append_text(&mut out, chunk);
        }
        out
    }

    /// Copies every chunk into one allocation of `total` bytes.
    pub fn concat(&self, total: usize) -> Bytes {
        if self.chunks.len() == 1 {
            if let Some(Chunk::Bytes(bytes)) = self.chunks.front() {
                return bytes.clone();
            }
        }

        let mut out = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            append_bytes(&mut out, chunk);
        }
        debug_assert_eq!(out.len(), total, "concat length mismatch");
        out.freeze()
    }

    /// Removes exactly `n` units from the front, slicing or spanning chunks as needed.
    pub fn consume(&mut self, n: usize, has_strings: bool) -> Option<Chunk<T>> {
        if n == 0 {
            return None;
        }

        let first_units = self.chunks.front()?.units_up_to(n.saturating_add(1));
        if n < first_units {
            let head = self.chunks.front_mut()?;
            return split_front(head, n);
        }

        if n == first_units {
            return self.shift();
        }

        if has_strings {
            Some(Chunk::text(self.consume_text(n)))
        } else {
            Some(Chunk::Bytes(self.consume_bytes(n)))
        }
    }

    fn consume_text(&mut self, n: usize) -> String {
        let mut out = String::new();
        let mut left = n;

        while left > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };

            let units = head.units_up_to(left.saturating_add(1));
            if left < units {
                if let Some(front) = split_front(head, left) {
                    append_text(&mut out, &front);
                }
                break;
            }

            if let Some(chunk) = self.chunks.pop_front() {
                append_text(&mut out, &chunk);
            }
            left -= units;
        }

        out
    }

    fn consume_bytes(&mut self, n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n);
        let mut left = n;

        while left > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };

            let units = head.units();
            if left < units {
                if let Some(front) = split_front(head, left) {
                    append_bytes(&mut out, &front);
                }
                break;
            }

            if let Some(chunk) = self.chunks.pop_front() {
                append_bytes(&mut out, &chunk);
            }
            left -= units;
        }

        out.freeze()
    }
}

/// Takes `n` units off the front of `chunk`, leaving the remainder in place.
fn split_front<T>(chunk: &mut Chunk<T>, n: usize) -> Option<Chunk<T>> {
    match chunk {
        Chunk::Bytes(bytes) => Some(Chunk::Bytes(bytes.split_to(n))),
        Chunk::Text { text, encoding } => Some(Chunk::Text {
            text: split_text_front(text, n),
            encoding: *encoding,
        }),
        Chunk::Value(_) => None,
    }
}

fn append_text<T>(out: &mut String, chunk: &Chunk<T>) {
    match chunk {
        Chunk::Text { text, .. } => out.push_str(text),
        Chunk::Bytes(bytes) => out.push_str(&String::from_utf8_lossy(bytes)),
        Chunk::Value(_) => {}
    }
}

fn append_bytes<T>(out: &mut BytesMut, chunk: &Chunk<T>) {
    match chunk {
        Chunk::Bytes(bytes) => out.extend_from_slice(bytes),
        Chunk::Text { text, .. } => out.extend_from_slice(text.as_bytes()),
        Chunk::Value(_) => {}
    }
}
