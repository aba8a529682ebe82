use crate::oci::Digest;
use hyper::StatusCode;
use std::fmt;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Transport(String),
    Status(StatusCode, String),
    Authentication(String),
    DigestMismatch { expected: Digest, actual: Digest },
    InvalidManifest(String),
    Configuration(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "Transport error: {err}"),
            Error::Status(status, uri) => write!(f, "Unexpected status {status} from {uri}"),
            Error::Authentication(err) => write!(f, "Authentication failed: {err}"),
            Error::DigestMismatch { expected, actual } => {
                write!(f, "Digest mismatch: expected {expected}, got {actual}")
            }
            Error::InvalidManifest(err) => write!(f, "Invalid manifest: {err}"),
            Error::Configuration(err) => write!(f, "Invalid registry configuration: {err}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        debug!("I/O error: {error}");
        Error::Io(error.to_string())
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(error: tempfile::PersistError) -> Self {
        debug!("Persist error: {error}");
        Error::Io(error.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        debug!("HTTP error: {error}");
        Error::Transport(error.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(error: hyper::http::Error) -> Self {
        debug!("HTTP error: {error}");
        Error::Transport(error.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(error: hyper_util::client::legacy::Error) -> Self {
        debug!("HTTP client error: {error}");
        Error::Transport(error.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for Error {
    fn from(error: hyper::header::InvalidHeaderValue) -> Self {
        Error::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        debug!("JSON error: {error}");
        Error::Authentication(format!("Invalid token response: {error}"))
    }
}

impl From<rustls::Error> for Error {
    fn from(error: rustls::Error) -> Self {
        Error::Configuration(error.to_string())
    }
}

impl From<rustls_pki_types::pem::Error> for Error {
    fn from(error: rustls_pki_types::pem::Error) -> Self {
        Error::Configuration(error.to_string())
    }
}
