use std::{error::Error as StdError, fmt, sync::Arc};

/// Every failure a stream can report.
///
/// Errors are cloned freely: the same destroy error reaches every pending write
/// callback, every `end` callback, and the `Error` notification.
#[derive(Clone, thiserror::Error)]
pub enum StreamError {
    /// An operation was attempted on a stream that has already been destroyed.
    #[error("cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    #[error("write after end")]
    WriteAfterEnd,

    #[error("stream.push() after EOF")]
    PushAfterEof,

    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    #[error("cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    /// A value chunk reached a stream that only carries bytes and text.
    #[error("the chunk argument must be bytes or text when object mode is off")]
    InvalidChunk,

    #[error("invalid {encoding} data: {reason}")]
    InvalidEncoding {
        encoding: &'static str,
        reason: String,
    },

    #[error("invalid argument {name}: {reason}")]
    InvalidArg { name: &'static str, reason: String },

    #[error("the value of {name} is out of range, must be {range}, received {received}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        received: usize,
    },

    #[error("premature close")]
    PrematureClose,

    /// Cancellation. Callers usually treat this as a normal outcome rather than a failure.
    #[error("the operation was aborted")]
    Aborted,

    #[error(transparent)]
    Custom(Arc<dyn StdError + Send + Sync>),
}

impl StreamError {
    /// Wraps an arbitrary backend error.
    pub fn custom<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StreamError::Custom(Arc::new(err))
    }

    /// Convenience for hooks that fail with a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        StreamError::Custom(Arc::new(Message(message.into())))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Aborted)
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Custom(inner) => f.debug_tuple("Custom").field(inner).finish(),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StreamError::Custom(a), StreamError::Custom(b)) => Arc::ptr_eq(a, b),
            _ => self.to_string() == other.to_string(),
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguished() {
        assert!(StreamError::Aborted.is_cancellation());
        assert!(!StreamError::msg("boom").is_cancellation());
        assert!(!StreamError::Destroyed("write").is_cancellation());
    }

    #[test]
    fn custom_errors_compare_by_identity() {
        let a = StreamError::msg("boom");
        let b = StreamError::msg("boom");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn messages() {
        assert_eq!(
            StreamError::Destroyed("write").to_string(),
            "cannot call write after a stream was destroyed"
        );
        assert_eq!(StreamError::WriteAfterEnd.to_string(), "write after end");
    }
}
