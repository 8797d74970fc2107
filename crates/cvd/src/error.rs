use protecc::ErrorKind;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),
    #[error("container '{0}' has no enforcement context")]
    UnknownContainer(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("map {map}: {source}")]
    Map {
        map: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("enforcement manager is already initialized")]
    AlreadyInitialized,
    #[error("bpf: {0}")]
    Bpf(String),
    #[error("{0} is not supported")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Protecc(#[from] protecc::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidHostname(_) | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::UnknownContainer(_) => ErrorKind::NotFound,
            Error::Io { source, .. } | Error::Map { source, .. } => ErrorKind::from_io(source),
            Error::AlreadyInitialized => ErrorKind::Busy,
            Error::Bpf(_) => ErrorKind::IoError,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Protecc(err) => err.kind(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
