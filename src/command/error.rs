use crate::{cache, configuration, server, upstream};
use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    Watcher(String),
    InvalidArguments(String),
    Configuration(configuration::Error),
    Cache(cache::Error),
    Upstream(upstream::Error),
    Server(server::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IO(err) => write!(f, "IO error: {err}"),
            Error::Watcher(err) => write!(f, "Watcher error: {err}"),
            Error::InvalidArguments(err) => write!(f, "Invalid arguments: {err}"),
            Error::Configuration(err) => write!(f, "Configuration error: {err}"),
            Error::Cache(err) => write!(f, "Cache error: {err}"),
            Error::Upstream(err) => write!(f, "Upstream error: {err}"),
            Error::Server(err) => write!(f, "Server error: {err}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err)
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watcher(err.to_string())
    }
}

impl From<configuration::Error> for Error {
    fn from(err: configuration::Error) -> Self {
        Error::Configuration(err)
    }
}

impl From<cache::Error> for Error {
    fn from(err: cache::Error) -> Self {
        Error::Cache(err)
    }
}

impl From<upstream::Error> for Error {
    fn from(err: upstream::Error) -> Self {
        Error::Upstream(err)
    }
}

impl From<server::Error> for Error {
    fn from(err: server::Error) -> Self {
        Error::Server(err)
    }
}
