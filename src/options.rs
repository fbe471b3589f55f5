use tokio_util::sync::CancellationToken;

use crate::{chunk::Encoding, error::StreamError};

/// Threshold used for byte streams when none is configured.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
/// Threshold used for object-mode streams when none is configured.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Configuration shared by readable and writable streams
///
/// Example:
///
/// ```rust
/// use sluice::StreamOptions;
///
/// // an object-mode stream that never pre-fetches
/// let options = StreamOptions::object().high_water_mark(0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// How many units may be buffered before the stream reports backpressure.
    /// Defaults to 64 KiB for byte streams and 16 for object streams.
    pub high_water_mark: Option<usize>,
    /// Every chunk counts as one unit and values are accepted
    pub object_mode: bool,
    /// Convert text to bytes before it reaches the dispatch hooks (writable side)
    pub decode_strings: bool,
    /// Readable side: hand out text in this encoding instead of bytes
    pub encoding: Option<Encoding>,
    /// Writable side: label for text written without an explicit encoding
    pub default_encoding: Encoding,
    /// Destroy the stream automatically after it ends or finishes
    pub auto_destroy: bool,
    /// Emit `Close` once teardown completes
    pub emit_close: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            decode_strings: true,
            encoding: None,
            default_encoding: Encoding::Utf8,
            auto_destroy: true,
            emit_close: true,
        }
    }
}

impl StreamOptions {
    /// Options for an object-mode stream
    pub fn object() -> Self {
        Self {
            object_mode: true,
            ..Self::default()
        }
    }

    pub fn high_water_mark(self, high_water_mark: usize) -> Self {
        Self {
            high_water_mark: Some(high_water_mark),
            ..self
        }
    }

    pub fn object_mode(self, object_mode: bool) -> Self {
        Self {
            object_mode,
            ..self
        }
    }

    pub fn decode_strings(self, decode_strings: bool) -> Self {
        Self {
            decode_strings,
            ..self
        }
    }

    pub fn encoding(self, encoding: Encoding) -> Self {
        Self {
            encoding: Some(encoding),
            ..self
        }
    }

    pub fn default_encoding(self, default_encoding: Encoding) -> Self {
        Self {
            default_encoding,
            ..self
        }
    }

    pub fn auto_destroy(self, auto_destroy: bool) -> Self {
        Self {
            auto_destroy,
            ..self
        }
    }

    pub fn emit_close(self, emit_close: bool) -> Self {
        Self { emit_close, ..self }
    }

    /// The configured threshold, or the default for the stream's mode
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(if self.object_mode {
            DEFAULT_OBJECT_HIGH_WATER_MARK
        } else {
            DEFAULT_HIGH_WATER_MARK
        })
    }
}

/// Options for the two halves of a transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformOptions {
    pub readable: StreamOptions,
    pub writable: StreamOptions,
}

impl TransformOptions {
    /// Both halves in object mode
    pub fn object() -> Self {
        Self {
            readable: StreamOptions::object(),
            writable: StreamOptions::object(),
        }
    }

    pub fn readable(self, readable: StreamOptions) -> Self {
        Self { readable, ..self }
    }

    pub fn writable(self, writable: StreamOptions) -> Self {
        Self { writable, ..self }
    }
}

/// Controls concurrency characteristics of the `map` / `flat_map` operators
///
/// Example:
///
/// ```rust
/// use sluice::FlatMapOptions;
///
/// // up to 4 mapper calls in flight, output buffers up to 8 results
/// let options = FlatMapOptions::concurrent(4).backpressure(8);
/// ```
#[derive(Debug, Clone)]
pub struct FlatMapOptions {
    /// How many mapper futures may run at once
    pub concurrency: usize,
    /// How many results the output stream buffers before the operator stops pulling
    /// upstream. Defaults to the concurrency number
    pub backpressure: usize,
    /// External cancellation
    pub signal: Option<CancellationToken>,
}

impl FlatMapOptions {
    /// Only one mapper invocation at a time
    pub fn serial() -> Self {
        Self::concurrent(1)
    }

    pub fn concurrent(concurrency: usize) -> Self {
        Self {
            concurrency,
            backpressure: concurrency,
            signal: None,
        }
    }

    pub fn backpressure(self, backpressure: usize) -> Self {
        Self {
            backpressure,
            ..self
        }
    }

    pub fn signal(self, signal: CancellationToken) -> Self {
        Self {
            signal: Some(signal),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        if self.concurrency == 0 {
            return Err(StreamError::InvalidArg {
                name: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for FlatMapOptions {
    fn default() -> Self {
        Self::serial()
    }
}
