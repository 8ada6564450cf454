//! Error categorization for retry and abort decisions.
//!
//! Every transfer failure carries an [`ErrorKind`] naming what went wrong and an
//! [`ErrorCategory`] the transfer flows consult before handing the failure to the
//! retry policy:
//! - Retryable: transient failures that may succeed on a fresh attempt (network, finalize)
//! - Fatal: permanent failures that will never succeed (bad endpoint, missing input file)
//! - NoRetry: not a failure of the transfer itself (end of stream, cache miss, soft checksum)

use std::fmt;
use std::io;

use tonic::{Code, Status};

/// Category of transfer error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - a fresh attempt may succeed
    Retryable,
    /// Permanent error - retrying will never succeed
    Fatal,
    /// Not an error, but the operation should not be retried
    NoRetry,
}

/// What kind of failure a [`TransferError`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or incomplete `grpc[s]://host:port` URL.
    InvalidEndpoint,
    /// Identity or request settings that cannot be expressed on the wire.
    InvalidConfig,
    /// Sending or receiving a chunk failed.
    Transport,
    /// The transport ended normally while the caller still had data to send.
    StreamClosed,
    /// The remote has no entry for the requested resource.
    CacheMiss,
    /// The write-side shutdown handshake failed.
    Finalize,
    /// The content digest could not be computed.
    Checksum,
    /// Spill file I/O failed or the producer process exited unsuccessfully.
    Pipeline,
    /// A local file or subprocess pipe failed outside the pipeline.
    LocalIo,
}

impl ErrorKind {
    pub fn default_category(self) -> ErrorCategory {
        match self {
            ErrorKind::Transport | ErrorKind::Finalize | ErrorKind::Pipeline => {
                ErrorCategory::Retryable
            }
            ErrorKind::InvalidEndpoint | ErrorKind::InvalidConfig | ErrorKind::LocalIo => {
                ErrorCategory::Fatal
            }
            ErrorKind::StreamClosed | ErrorKind::CacheMiss | ErrorKind::Checksum => {
                ErrorCategory::NoRetry
            }
        }
    }

    fn label(self) -> &'static str {
        match self {
            ErrorKind::InvalidEndpoint => "invalid endpoint",
            ErrorKind::InvalidConfig => "invalid configuration",
            ErrorKind::Transport => "transport error",
            ErrorKind::StreamClosed => "stream closed",
            ErrorKind::CacheMiss => "cache miss",
            ErrorKind::Finalize => "finalize error",
            ErrorKind::Checksum => "checksum error",
            ErrorKind::Pipeline => "pipeline error",
            ErrorKind::LocalIo => "local I/O error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A transfer error with its kind and retry category.
#[derive(Debug)]
pub struct TransferError {
    pub kind: ErrorKind,
    /// The underlying error message.
    pub message: String,
    /// The local path or remote resource involved (if applicable).
    pub path: Option<String>,
    /// The error category for retry decisions.
    pub category: ErrorCategory,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            category: kind.default_category(),
            source: None,
        }
    }

    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidEndpoint, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn stream_closed() -> Self {
        Self::new(ErrorKind::StreamClosed, "remote closed the stream")
    }

    pub fn cache_miss(resource_name: impl Into<String>) -> Self {
        Self::new(ErrorKind::CacheMiss, "no cache entry found").with_path(resource_name)
    }

    pub fn finalize(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Finalize, message)
    }

    pub fn checksum(path: impl Into<String>, err: io::Error) -> Self {
        Self::new(ErrorKind::Checksum, "computing sha256")
            .with_path(path)
            .with_source(err)
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pipeline, message)
    }

    pub fn local_io(message: impl Into<String>, err: io::Error) -> Self {
        let category = categorize_io_error(&err);
        let mut error = Self::new(ErrorKind::LocalIo, message).with_source(err);
        error.category = category;
        error
    }

    /// Maps a gRPC status to a transport failure, or to a cache miss when the
    /// remote reports `NOT_FOUND`.
    pub fn from_status(context: &str, resource_name: &str, status: Status) -> Self {
        if status.code() == Code::NotFound {
            return Self::cache_miss(resource_name).with_source(status);
        }
        Self::transport(format!("{context}: {}", status.message())).with_source(status)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Marks the error as permanent so the retry policy stops immediately.
    pub fn fatal(mut self) -> Self {
        self.category = ErrorCategory::Fatal;
        self
    }

    pub fn is_cache_miss(&self) -> bool {
        self.kind == ErrorKind::CacheMiss
    }

    /// Whether a retry wrapper should stop instead of spending another attempt.
    pub fn should_abort(&self) -> bool {
        self.category != ErrorCategory::Retryable
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref path) = self.path {
            write!(f, "{}: {}: {}", self.kind, path, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Categorize an IO error for retry decisions.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::AlreadyExists => ErrorCategory::Fatal,

        // Unknown errors - default to fatal to avoid burning attempts
        _ => ErrorCategory::Fatal,
    }
}

/// Finds the typed transfer error underneath any context added with `wrap_err`.
pub fn find_transfer_error(report: &eyre::Report) -> Option<&TransferError> {
    report
        .chain()
        .find_map(|err| err.downcast_ref::<TransferError>())
}

/// Result type for transfer operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;
