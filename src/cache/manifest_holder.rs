use crate::cache::{Error, PullRequest};
use crate::oci::{Digest, Manifest, ManifestKind};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cached manifest: the raw payload as served to clients, its parsed
/// form and the cache bookkeeping timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestHolder {
    pub image_url: String,
    pub kind: ManifestKind,
    pub digest: Digest,
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub manifest: Manifest,
    pub created: DateTime<Utc>,
    pub pulled: DateTime<Utc>,
}

/// On-disk representation. The typed payload is rebuilt from `bytes` on load
/// so the record cannot drift from the served content.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HolderRecord {
    image_url: String,
    kind: ManifestKind,
    digest: Digest,
    media_type: String,
    bytes: String,
    created: DateTime<Utc>,
    pulled: DateTime<Utc>,
}

impl ManifestHolder {
    /// Builds a holder from manifest bytes received from an upstream. The
    /// timestamps are set to now; the coordinator adjusts them on insert.
    pub fn new(image_url: &str, media_type: Option<&str>, bytes: Vec<u8>) -> Result<Self, Error> {
        let manifest = Manifest::from_slice(&bytes)?;
        let kind = manifest.kind(media_type)?;
        let digest = Digest::sha256_of(&bytes);
        let now = Utc::now();

        Ok(Self {
            image_url: image_url.to_string(),
            kind,
            digest,
            bytes,
            media_type: kind.media_type().to_string(),
            manifest,
            created: now,
            pulled: now,
        })
    }

    pub fn is_image_manifest(&self) -> bool {
        self.kind.is_image_manifest()
    }

    /// Config blob plus layer digests. Empty for list manifests.
    pub fn layers(&self) -> Vec<Digest> {
        if self.is_image_manifest() {
            self.manifest.blob_digests()
        } else {
            Vec::new()
        }
    }

    pub fn member_digests(&self) -> Vec<Digest> {
        if self.is_image_manifest() {
            Vec::new()
        } else {
            self.manifest.member_digests()
        }
    }

    /// Whether the holder was first pulled through the `latest` tag, which
    /// decides its on-disk and in-memory partition.
    pub fn is_latest(&self) -> bool {
        PullRequest::parse(&self.image_url).is_ok_and(|pr| pr.is_latest())
    }

    /// URL under which the same manifest is addressed by digest.
    pub fn digest_url(&self) -> Option<String> {
        PullRequest::parse(&self.image_url)
            .ok()
            .map(|pr| pr.alt_by_digest(&self.digest).url())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        let record = HolderRecord {
            image_url: self.image_url.clone(),
            kind: self.kind,
            digest: self.digest.clone(),
            media_type: self.media_type.clone(),
            bytes: BASE64_STANDARD.encode(&self.bytes),
            created: self.created,
            pulled: self.pulled,
        };

        Ok(serde_json::to_vec(&record)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let record: HolderRecord = serde_json::from_slice(data)?;
        let bytes = BASE64_STANDARD
            .decode(record.bytes.as_bytes())
            .map_err(|e| Error::CorruptHolder(format!("Invalid manifest payload: {e}")))?;

        let digest = Digest::sha256_of(&bytes);
        if digest != record.digest {
            return Err(Error::CorruptHolder(format!(
                "Digest mismatch: recorded {}, computed {digest}",
                record.digest
            )));
        }

        let manifest = Manifest::from_slice(&bytes)?;

        Ok(Self {
            image_url: record.image_url,
            kind: record.kind,
            digest,
            bytes,
            media_type: record.media_type,
            manifest,
            created: record.created,
            pulled: record.pulled,
        })
    }
}
