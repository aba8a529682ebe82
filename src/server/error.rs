use std::fmt;

use hyper::StatusCode;
use serde_json::json;

use crate::cache;

#[derive(Debug, PartialEq)]
pub enum Error {
    Initialization(String),
    Execution(String),
    // mappable to classical HTTP responses
    BadRequest(String),
    RangeNotSatisfiable(String),
    NotFound(String),
    Unsupported(String),
    Internal(String),
    Custom {
        status_code: StatusCode,
        code: String,
        msg: Option<String>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Initialization(err) | Error::Execution(err) => write!(f, "{err}"),
            Error::BadRequest(err) => write!(f, "Bad Request: {err}"),
            Error::RangeNotSatisfiable(err) => write!(f, "Range Not Satisfiable: {err}"),
            Error::NotFound(err) => write!(f, "Not Found: {err}"),
            Error::Unsupported(err) => write!(f, "Unsupported: {err}"),
            Error::Internal(err) => write!(f, "Internal Server Error: {err}"),
            Error::Custom {
                status_code,
                code: message,
                msg: details,
            } => {
                if let Some(details) = details {
                    write!(f, "Error {status_code}: {message} - {details}")
                } else {
                    write!(f, "Error {status_code}: {message}")
                }
            }
        }
    }
}

impl From<cache::Error> for Error {
    fn from(error: cache::Error) -> Self {
        let (status_code, code, msg) = match error {
            cache::Error::InvalidReference(msg) => {
                (StatusCode::BAD_REQUEST, "NAME_INVALID", Some(msg))
            }
            cache::Error::NotFound => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", None),
            cache::Error::MissingBlob(digest) => {
                (StatusCode::NOT_FOUND, "BLOB_UNKNOWN", Some(digest))
            }
            cache::Error::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
                Some("Timed out waiting for upstream pull".to_string()),
            ),
            cache::Error::UpstreamFailed(msg) => {
                (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_FAILED", Some(msg))
            }
            cache::Error::CorruptHolder(msg)
            | cache::Error::Fatal(msg)
            | cache::Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                Some(msg),
            ),
        };

        Error::Custom {
            status_code,
            code: code.to_string(),
            msg,
        }
    }
}

impl From<hyper::http::Error> for Error {
    fn from(error: hyper::http::Error) -> Self {
        Error::Internal(format!("Failed to build response: {error}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Internal(error.to_string())
    }
}

impl Error {
    pub fn blob_unknown() -> Self {
        Error::Custom {
            status_code: StatusCode::NOT_FOUND,
            code: "BLOB_UNKNOWN".to_string(),
            msg: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Initialization(_) | Error::Execution(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Custom { status_code, .. } => *status_code,
        }
    }

    pub fn as_json(&self, request_id: Option<&String>) -> serde_json::Value {
        let (code, message) = match self {
            Error::BadRequest(msg) => ("BAD_REQUEST", Some(msg.as_str())),
            Error::RangeNotSatisfiable(msg) => ("RANGE_NOT_SATISFIABLE", Some(msg.as_str())),
            Error::NotFound(msg) => ("NOT_FOUND", Some(msg.as_str())),
            Error::Unsupported(msg) => ("UNSUPPORTED", Some(msg.as_str())),
            Error::Initialization(msg) | Error::Execution(msg) | Error::Internal(msg) => {
                ("INTERNAL_SERVER_ERROR", Some(msg.as_str()))
            }
            Error::Custom { code, msg, .. } => (code.as_str(), msg.as_deref()),
        };

        if let Some(request_id) = request_id {
            json!({
                "errors": [{
                    "code": code,
                    "message": message,
                    "detail": { "request_id": request_id }
                }]
            })
        } else {
            json!({
                "errors": [{
                    "code": code,
                    "message": message,
                }]
            })
        }
    }
}
