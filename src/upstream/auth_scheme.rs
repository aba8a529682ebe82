use crate::upstream::Error;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static WWW_AUTHENTICATE_HEADER_PARAMETER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());

#[derive(Debug, PartialEq)]
pub enum AuthenticationScheme {
    Bearer(String, HashMap<String, String>),
    Basic,
}

impl AuthenticationScheme {
    pub fn from_www_authenticate_header(header: &str) -> Result<Self, Error> {
        let (scheme, header_parameters) = header
            .trim()
            .split_once(' ')
            .unwrap_or((header.trim(), ""));

        if scheme.eq_ignore_ascii_case("Bearer") {
            let mut parameters = HashMap::new();

            for (_, [key, value]) in WWW_AUTHENTICATE_HEADER_PARAMETER
                .captures_iter(header_parameters)
                .map(|c| c.extract())
            {
                parameters.insert(key.to_string(), value.to_string());
            }

            let realm = parameters.remove("realm").ok_or_else(|| {
                Error::Authentication(
                    "Missing realm parameter in WWW-Authenticate header".to_string(),
                )
            })?;

            Ok(Self::Bearer(realm, parameters))
        } else if scheme.eq_ignore_ascii_case("Basic") {
            Ok(Self::Basic)
        } else {
            Err(Error::Authentication(
                "Unsupported authentication scheme in WWW-Authenticate header".to_string(),
            ))
        }
    }
}
