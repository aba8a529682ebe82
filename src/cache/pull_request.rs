use crate::cache::Error;
use crate::oci::Digest;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._:-]*$").unwrap());

pub const LATEST_TAG: &str = "latest";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PullType {
    ByTag,
    ByDigest,
}

/// Canonical form of an image reference such as `host/org/image:tag` or
/// `host/org/image@sha256:<hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PullRequest {
    pub remote: String,
    pub org: Option<String>,
    pub image: String,
    pub reference: String,
    pub pull_type: PullType,
}

impl PullRequest {
    pub fn parse(url: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidReference(url.to_string());

        let (name, reference, pull_type) = if let Some((name, digest)) = url.split_once('@') {
            let digest = Digest::from_str(digest).map_err(|_| invalid())?;
            (name, digest.to_string(), PullType::ByDigest)
        } else {
            let last_segment_start = url.rfind('/').map_or(0, |i| i + 1);
            let tag_separator = url[last_segment_start..]
                .rfind(':')
                .map(|i| last_segment_start + i)
                .ok_or_else(invalid)?;

            let tag = &url[tag_separator + 1..];
            if !TAG_RE.is_match(tag) {
                return Err(invalid());
            }
            (&url[..tag_separator], tag.to_string(), PullType::ByTag)
        };

        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() < 2 || !segments.iter().all(|s| SEGMENT_RE.is_match(s)) {
            return Err(invalid());
        }

        let remote = segments[0].to_string();
        let image = segments[segments.len() - 1].to_string();
        let org = if segments.len() > 2 {
            Some(segments[1..segments.len() - 1].join("/"))
        } else {
            None
        };

        Ok(Self {
            remote,
            org,
            image,
            reference,
            pull_type,
        })
    }

    /// Repository path as seen by the upstream registry, e.g. `org/image`.
    pub fn repository(&self) -> String {
        match &self.org {
            Some(org) => format!("{org}/{}", self.image),
            None => self.image.clone(),
        }
    }

    pub fn url(&self) -> String {
        let separator = match self.pull_type {
            PullType::ByTag => ':',
            PullType::ByDigest => '@',
        };
        format!(
            "{}/{}{separator}{}",
            self.remote,
            self.repository(),
            self.reference
        )
    }

    pub fn is_latest(&self) -> bool {
        self.pull_type == PullType::ByTag && self.reference == LATEST_TAG
    }

    pub fn digest(&self) -> Option<Digest> {
        match self.pull_type {
            PullType::ByDigest => Digest::from_str(&self.reference).ok(),
            PullType::ByTag => None,
        }
    }

    /// The same image addressed by digest instead of by tag.
    pub fn alt_by_digest(&self, digest: &Digest) -> Self {
        Self {
            reference: digest.to_string(),
            pull_type: PullType::ByDigest,
            ..self.clone()
        }
    }
}

impl FromStr for PullRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}
