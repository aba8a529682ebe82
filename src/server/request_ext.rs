use crate::server::error::Error;
use hyper::header::{AsHeaderName, HeaderName, HOST};
use hyper::http::request::Parts;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:bytes=)?(?P<start>\d+)-(?P<end>\d+)?$").unwrap());

pub static X_REGISTRY: HeaderName = HeaderName::from_static("x-registry");

#[derive(Deserialize, Default)]
struct NamespaceQuery {
    ns: Option<String>,
}

pub trait HeaderExt {
    fn get_header<K: AsHeaderName>(&self, header: K) -> Option<String>;
    fn range(&self, header: HeaderName) -> Result<Option<(u64, Option<u64>)>, Error>;
    fn host(&self) -> Option<String>;
    fn namespace_query(&self) -> Option<String>;
}

fn invalid_range_header(header: &str) -> Error {
    let msg = format!("Invalid Range header format: '{header}'");
    Error::RangeNotSatisfiable(msg)
}

impl HeaderExt for Parts {
    fn get_header<K>(&self, header: K) -> Option<String>
    where
        K: AsHeaderName,
    {
        self.headers
            .get(header)
            .and_then(|header| header.to_str().ok())
            .map(ToString::to_string)
    }

    fn range(&self, header: HeaderName) -> Result<Option<(u64, Option<u64>)>, Error> {
        let Some(range_header) = self.get_header(header) else {
            return Ok(None);
        };

        let captures = RANGE_RE
            .captures(&range_header)
            .ok_or_else(|| invalid_range_header(&range_header))?;

        let (Some(start), end) = (captures.name("start"), captures.name("end")) else {
            return Err(invalid_range_header(&range_header));
        };

        let start = start.as_str().parse::<u64>().map_err(|error| {
            let msg = format!("Error parsing 'start' in Range header: {error}");
            Error::RangeNotSatisfiable(msg)
        })?;

        if let Some(end) = end {
            let end = end.as_str().parse::<u64>().map_err(|error| {
                let msg = format!("Error parsing 'end' in Range header: {error}");
                Error::RangeNotSatisfiable(msg)
            })?;

            if start > end {
                let msg = format!("Invalid Range header: start ({start}) > end ({end})");
                return Err(Error::RangeNotSatisfiable(msg));
            }

            Ok(Some((start, Some(end))))
        } else {
            Ok(Some((start, None)))
        }
    }

    fn host(&self) -> Option<String> {
        self.get_header(HOST)
            .or_else(|| self.uri.authority().map(ToString::to_string))
    }

    /// The `ns` query parameter some runtimes add when mirroring.
    fn namespace_query(&self) -> Option<String> {
        let query = self.uri.query()?;
        serde_urlencoded::from_str::<NamespaceQuery>(query)
            .unwrap_or_default()
            .ns
            .filter(|ns| !ns.is_empty())
    }
}
