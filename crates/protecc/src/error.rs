use std::fmt;
use std::io;
use thiserror::Error;

/// Errors produced while parsing patterns, compiling profiles and decoding blobs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory while {0}")]
    OutOfMemory(&'static str),
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid blob: {0}")]
    InvalidBlob(String),
    #[error("compile failed: {0}")]
    CompileFailed(String),
}

impl Error {
    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn blob(reason: impl Into<String>) -> Self {
        Self::InvalidBlob(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::InvalidBlob(_) => ErrorKind::InvalidBlob,
            Self::CompileFailed(_) => ErrorKind::CompileFailed,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error classification shared by every component of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    InvalidPattern,
    InvalidBlob,
    CompileFailed,
    NotSupported,
    PermissionDenied,
    NotFound,
    IoError,
    Busy,
}

impl ErrorKind {
    /// Classifies a raw `errno` value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc_errno::EPERM | libc_errno::EACCES => Self::PermissionDenied,
            libc_errno::ENOENT | libc_errno::ESRCH => Self::NotFound,
            libc_errno::ENOMEM => Self::OutOfMemory,
            libc_errno::EBUSY | libc_errno::EAGAIN => Self::Busy,
            libc_errno::EINVAL => Self::InvalidArgument,
            libc_errno::ENOSYS | libc_errno::EOPNOTSUPP => Self::NotSupported,
            _ => Self::IoError,
        }
    }

    /// Classifies an [`io::Error`], preferring the raw OS code when present.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Self::from_errno(code);
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            io::ErrorKind::Unsupported => Self::NotSupported,
            io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock => Self::Busy,
            _ => Self::IoError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::OutOfMemory => "out-of-memory",
            Self::InvalidPattern => "invalid-pattern",
            Self::InvalidBlob => "invalid-blob",
            Self::CompileFailed => "compile-failed",
            Self::NotSupported => "not-supported",
            Self::PermissionDenied => "permission-denied",
            Self::NotFound => "not-found",
            Self::IoError => "io-error",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Linux errno values; protecc stays free of a libc dependency.
mod libc_errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const EOPNOTSUPP: i32 = 95;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_common_codes() {
        assert_eq!(ErrorKind::from_errno(1), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_errno(13), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_errno(2), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_errno(16), ErrorKind::Busy);
        assert_eq!(ErrorKind::from_errno(95), ErrorKind::NotSupported);
        assert_eq!(ErrorKind::from_errno(5), ErrorKind::IoError);
    }

    #[test]
    fn io_errors_prefer_raw_codes() {
        let err = io::Error::from_raw_os_error(13);
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::PermissionDenied);
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::NotFound);
    }

    #[test]
    fn pattern_error_names_pattern() {
        let err = Error::pattern("/a/[b", "unterminated bracket expression");
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
        assert!(err.to_string().contains("/a/[b"));
    }
}
