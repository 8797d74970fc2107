use nix::errno::Errno;
use policy_core::{ErrorKind, PolicyError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Sys {
        context: String,
        #[source]
        source: Errno,
    },
    #[error("control protocol: {0}")]
    Protocol(String),
    #[error("{op} failed inside the container: {}", Errno::from_raw(*.errno))]
    Remote { op: &'static str, errno: i32 },
    #[error("container setup failed at {stage}: {}", Errno::from_raw(*.status))]
    ChildFailed { stage: &'static str, status: i32 },
    #[error("seccomp: {0}")]
    Seccomp(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Enforcement(#[from] cvd::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn sys(context: impl Into<String>, source: Errno) -> Self {
        Error::Sys {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io { source, .. } => ErrorKind::from_io(source),
            Error::Sys { source, .. } => ErrorKind::from_errno(*source as i32),
            Error::Protocol(_) => ErrorKind::IoError,
            Error::Remote { errno, .. } => ErrorKind::from_errno(*errno),
            Error::ChildFailed { status, .. } => ErrorKind::from_errno(*status),
            Error::Seccomp(_) => ErrorKind::NotSupported,
            Error::Policy(err) => err.kind(),
            Error::Enforcement(err) => err.kind(),
        }
    }

    /// Errno reported across the sync pipe or the control socket.
    pub(crate) fn errno(&self) -> i32 {
        match self {
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys { source, .. } => *source as i32,
            Error::Remote { errno, .. } => *errno,
            Error::ChildFailed { status, .. } => *status,
            Error::InvalidArgument(_) | Error::Protocol(_) => libc::EINVAL,
            Error::Seccomp(_) => libc::ENOSYS,
            Error::Policy(_) | Error::Enforcement(_) => libc::EIO,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_errno() {
        let err = Error::sys("unshare", Errno::EPERM);
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.errno(), libc::EPERM);

        let err = Error::ChildFailed {
            stage: "cgroups",
            status: libc::ENOENT,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::io("read", io::Error::other("boom"));
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn remote_errors_name_the_operation() {
        let err = Error::Remote {
            op: "kill",
            errno: libc::ESRCH,
        };
        assert!(err.to_string().starts_with("kill failed inside the container"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
