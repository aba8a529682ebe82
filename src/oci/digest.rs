use crate::oci::Error;
use regex::Regex;
use serde::de::Visitor;
use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<algorithm>[a-z0-9]+):(?P<hash>[a-f0-9]{64})$").unwrap());

static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").unwrap());

#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Digest {
    Sha256(String),
}

impl Digest {
    /// Computes the sha256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Digest::Sha256(hex::encode(Sha256::digest(data).as_slice()))
    }

    /// Builds a digest from the bare hex form used for file names on disk.
    pub fn from_hex(hash: &str) -> Result<Self, Error> {
        if HEX_RE.is_match(hash) {
            Ok(Digest::Sha256(hash.to_string()))
        } else {
            Err(Error::InvalidFormat(format!("Invalid digest hash: '{hash}'")))
        }
    }

    pub fn algorithm(&self) -> &str {
        match self {
            Digest::Sha256(_) => "sha256",
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Digest::Sha256(hash) => hash,
        }
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = DIGEST_RE
            .captures(s)
            .ok_or_else(|| Error::InvalidFormat(format!("Invalid digest: '{s}'")))?;

        match &captures["algorithm"] {
            "sha256" => Ok(Digest::Sha256(captures["hash"].to_string())),
            algorithm => Err(Error::InvalidFormat(format!(
                "Unsupported digest algorithm: '{algorithm}'"
            ))),
        }
    }
}

impl TryFrom<&str> for Digest {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.hash())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a valid digest string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Digest, E>
            where
                E: de::Error,
            {
                Digest::from_str(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_from_str() {
        let digest: Digest =
            "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .parse()
                .unwrap();

        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(
            digest.hash(),
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn test_digest_invalid() {
        assert!(Digest::from_str("sha256:abc").is_err());
        assert!(Digest::from_str("0123456789abcdef").is_err());
        assert!(Digest::from_str(
            "md5:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        )
        .is_err());
    }

    #[test]
    fn test_sha256_of() {
        let digest = Digest::sha256_of(b"hello world");
        assert_eq!(
            digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_from_hex() {
        let digest =
            Digest::from_hex("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                .unwrap();
        assert_eq!(digest, Digest::sha256_of(b"hello world"));

        assert!(Digest::from_hex("not-a-digest").is_err());
        assert!(Digest::from_hex(".tmpA1b2C3").is_err());
    }

    #[test]
    fn test_digest_serde() {
        let digest = Digest::sha256_of(b"hello world");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(
            json,
            r#""sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9""#
        );

        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, digest);
    }
}
