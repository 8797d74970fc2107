use protecc::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Protecc(#[from] protecc::Error),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("unsupported rule: {0}")]
    Unsupported(String),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PolicyError::Io { source, .. } => ErrorKind::from_io(source),
            PolicyError::Toml(_) | PolicyError::InvalidRule(_) => ErrorKind::InvalidArgument,
            PolicyError::Protecc(err) => err.kind(),
            PolicyError::Unsupported(_) => ErrorKind::NotSupported,
        }
    }
}

pub type Result<T, E = PolicyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let err = PolicyError::Io {
            path: "/nope".into(),
            source: std::io::Error::from_raw_os_error(2),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            PolicyError::InvalidRule("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        let err: PolicyError = protecc::Error::InvalidBlob("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidBlob);
    }
}
