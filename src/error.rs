//! Error taxonomy for the core.
//!
//! Each [`FutatabiError`] variant is
//! one of the seven named error kinds, plus `Catalog`/`Io` for the
//! persistence layer. Variants carry an [`ErrorContext`] so log lines and
//! metrics can be produced uniformly without matching on the variant.
//!
//! Uses the same context-with-builder shape and `Retryable`/`Fatal`
//! classification traits as a screen-capture pipeline's error hierarchy,
//! narrowed down to the handful of kinds this server actually raises.

use std::time::SystemTime;
use thiserror::Error;

/// Metadata attached to every error: when it happened and what was being
/// attempted. Kept deliberately small — the core logs and counts errors,
/// it does not unwind across threads.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub timestamp: SystemTime,
    pub operation: Option<String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// The core's error taxonomy.
#[derive(Debug, Error)]
pub enum FutatabiError {
    /// Catalog open, OpenGL context, or VA display failure. Unrecoverable;
    /// the caller should abort with a message.
    #[error("fatal init error: {reason}")]
    FatalInit {
        reason: String,
        context: ErrorContext,
    },
    /// EOF or connection reset on ingest. The caller should log, sleep
    /// 1s, and reopen.
    #[error("transient I/O error: {source}")]
    TransientIo {
        source: std::io::Error,
        context: ErrorContext,
    },
    /// Bad magic, short read, or truncated frame in a `.frames` file.
    #[error("corrupted frame file {filename}: {reason}")]
    CorruptedFrameFile {
        filename: String,
        reason: String,
        context: ErrorContext,
    },
    /// JPEG hardware path failed and the software fallback also failed
    /// uncorrectably (a 1x1 black frame was substituted).
    #[error("decode error: {reason}")]
    DecodeError {
        reason: String,
        context: ErrorContext,
    },
    /// The IFR pool was empty at schedule time; the caller dropped one
    /// interpolated frame.
    #[error("dropped frame: IFR pool exhausted")]
    BackpressureDrop { context: ErrorContext },
    /// An HTTP client's backlog exceeded the 1 GiB cap.
    #[error("client {client_id} exceeded backlog cap")]
    ClientOverflow {
        client_id: u64,
        context: ErrorContext,
    },
    /// `clear_queue`/`play`/`splice_play` interrupted in-flight work.
    #[error("cancelled by user action")]
    UserCancel { context: ErrorContext },
    /// Catalog (sqlite) or protobuf decode/encode failure outside of
    /// startup (startup failures are `FatalInit`).
    #[error("catalog error: {reason}")]
    Catalog {
        reason: String,
        context: ErrorContext,
    },
    /// Generic I/O failure not covered by `TransientIo`.
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        source: std::io::Error,
        context: ErrorContext,
    },
}

impl FutatabiError {
    pub fn fatal_init(reason: impl Into<String>) -> Self {
        Self::FatalInit {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn transient_io(source: std::io::Error) -> Self {
        Self::TransientIo {
            source,
            context: ErrorContext::new(),
        }
    }

    pub fn corrupted_frame_file(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptedFrameFile {
            filename: filename.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::DecodeError {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn backpressure_drop() -> Self {
        Self::BackpressureDrop {
            context: ErrorContext::new(),
        }
    }

    pub fn client_overflow(client_id: u64) -> Self {
        Self::ClientOverflow {
            client_id,
            context: ErrorContext::new(),
        }
    }

    pub fn user_cancel() -> Self {
        Self::UserCancel {
            context: ErrorContext::new(),
        }
    }

    pub fn catalog(reason: impl Into<String>) -> Self {
        Self::Catalog {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
            context: ErrorContext::new(),
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::FatalInit { context, .. }
            | Self::TransientIo { context, .. }
            | Self::CorruptedFrameFile { context, .. }
            | Self::DecodeError { context, .. }
            | Self::BackpressureDrop { context }
            | Self::ClientOverflow { context, .. }
            | Self::UserCancel { context }
            | Self::Catalog { context, .. }
            | Self::Io { context, .. } => context,
        }
    }

    /// A short, stable tag used as a metrics label and log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FatalInit { .. } => "fatal_init",
            Self::TransientIo { .. } => "transient_io",
            Self::CorruptedFrameFile { .. } => "corrupted_frame_file",
            Self::DecodeError { .. } => "decode_error",
            Self::BackpressureDrop { .. } => "backpressure_drop",
            Self::ClientOverflow { .. } => "client_overflow",
            Self::UserCancel { .. } => "user_cancel",
            Self::Catalog { .. } => "catalog",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for FutatabiError {
    fn from(source: std::io::Error) -> Self {
        Self::io("unknown", source)
    }
}

impl From<rusqlite::Error> for FutatabiError {
    fn from(source: rusqlite::Error) -> Self {
        Self::catalog(source.to_string())
    }
}

/// Errors the ingest/player loops should retry after a short sleep rather
/// than propagate.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FutatabiError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

/// Errors that mean the process cannot continue and should abort with a
/// message (catalog open, GL context, VA display failures and the like).
pub trait Fatal {
    fn is_fatal(&self) -> bool;
}

impl Fatal for FutatabiError {
    fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalInit { .. })
    }
}

pub type FutatabiResult<T> = Result<T, FutatabiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_fatal_classification_are_disjoint() {
        let io_err = FutatabiError::transient_io(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert!(io_err.is_retryable());
        assert!(!io_err.is_fatal());

        let fatal = FutatabiError::fatal_init("no catalog");
        assert!(fatal.is_fatal());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(FutatabiError::backpressure_drop().kind(), "backpressure_drop");
        assert_eq!(FutatabiError::client_overflow(3).kind(), "client_overflow");
    }
}
