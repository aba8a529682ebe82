use crate::oci;
use crate::upstream;
use std::fmt;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidReference(String),
    NotFound,
    UpstreamFailed(String),
    Timeout,
    MissingBlob(String),
    CorruptHolder(String),
    Fatal(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidReference(reference) => write!(f, "Invalid reference: {reference}"),
            Error::NotFound => write!(f, "Not found"),
            Error::UpstreamFailed(err) => write!(f, "Upstream failure: {err}"),
            Error::Timeout => write!(f, "Timed out waiting for upstream pull"),
            Error::MissingBlob(digest) => write!(f, "Missing blob: {digest}"),
            Error::CorruptHolder(err) => write!(f, "Corrupt manifest holder: {err}"),
            Error::Fatal(err) => write!(f, "Fatal: {err}"),
            Error::Internal(err) => write!(f, "Internal error: {err}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            return Error::NotFound;
        }

        let error = format!("I/O error: {error}");
        debug!("{error}");
        Error::Internal(error)
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(error: tempfile::PersistError) -> Self {
        let error = format!("Failed to persist file: {error}");
        debug!("{error}");
        Error::Internal(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        let error = format!("Serialization error: {error}");
        debug!("{error}");
        Error::CorruptHolder(error)
    }
}

impl From<oci::Error> for Error {
    fn from(error: oci::Error) -> Self {
        debug!("OCI error: {error}");
        Error::CorruptHolder(error.to_string())
    }
}

impl From<upstream::Error> for Error {
    fn from(error: upstream::Error) -> Self {
        debug!("Upstream error: {error}");
        match error {
            upstream::Error::Status(hyper::StatusCode::NOT_FOUND, _) => Error::NotFound,
            error => Error::UpstreamFailed(error.to_string()),
        }
    }
}
