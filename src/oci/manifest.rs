use crate::oci::{Descriptor, Digest, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_IMAGE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

pub const ACCEPTED_MANIFEST_TYPES: [&str; 4] = [
    DOCKER_MANIFEST_LIST,
    DOCKER_IMAGE_MANIFEST,
    OCI_INDEX,
    OCI_IMAGE_MANIFEST,
];

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    DockerManifestList,
    DockerImageManifest,
    OciIndex,
    OciImageManifest,
}

impl ManifestKind {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        // Registries may append parameters, e.g. "; charset=utf-8"
        let media_type = media_type.split(';').next().unwrap_or_default().trim();
        match media_type {
            DOCKER_MANIFEST_LIST => Some(ManifestKind::DockerManifestList),
            DOCKER_IMAGE_MANIFEST => Some(ManifestKind::DockerImageManifest),
            OCI_INDEX => Some(ManifestKind::OciIndex),
            OCI_IMAGE_MANIFEST => Some(ManifestKind::OciImageManifest),
            _ => None,
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            ManifestKind::DockerManifestList => DOCKER_MANIFEST_LIST,
            ManifestKind::DockerImageManifest => DOCKER_IMAGE_MANIFEST,
            ManifestKind::OciIndex => OCI_INDEX,
            ManifestKind::OciImageManifest => OCI_IMAGE_MANIFEST,
        }
    }

    pub fn is_image_manifest(self) -> bool {
        matches!(
            self,
            ManifestKind::DockerImageManifest | ManifestKind::OciImageManifest
        )
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifestKind::DockerManifestList => "docker-manifest-list",
            ManifestKind::DockerImageManifest => "docker-image-manifest",
            ManifestKind::OciIndex => "oci-index",
            ManifestKind::OciImageManifest => "oci-image-manifest",
        };
        write!(f, "{name}")
    }
}

/// Union of the image manifest and image index documents. Fields that do not
/// apply to a given kind are simply left empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Manifest {
    pub fn from_slice(s: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(s)?)
    }

    /// Resolves the manifest kind, preferring the transport media type, then the
    /// embedded `mediaType` field, then the document shape.
    pub fn kind(&self, media_type: Option<&str>) -> Result<ManifestKind, Error> {
        if let Some(kind) = media_type.and_then(ManifestKind::from_media_type) {
            return Ok(kind);
        }

        if let Some(embedded) = &self.media_type {
            return ManifestKind::from_media_type(embedded).ok_or_else(|| {
                Error::InvalidFormat(format!("Unsupported manifest media type: '{embedded}'"))
            });
        }

        if self.schema_version != 2 {
            return Err(Error::InvalidFormat(format!(
                "Unsupported manifest schema version: {}",
                self.schema_version
            )));
        }

        if self.manifests.is_empty() {
            Ok(ManifestKind::OciImageManifest)
        } else {
            Ok(ManifestKind::OciIndex)
        }
    }

    /// Config blob followed by the layer digests.
    pub fn blob_digests(&self) -> Vec<Digest> {
        self.config
            .iter()
            .chain(self.layers.iter())
            .map(|descriptor| descriptor.digest.clone())
            .collect()
    }

    pub fn member_digests(&self) -> Vec<Digest> {
        self.manifests
            .iter()
            .map(|descriptor| descriptor.digest.clone())
            .collect()
    }

    pub fn platform_member(&self, os: &str, architecture: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|descriptor| {
            descriptor
                .platform
                .as_ref()
                .is_some_and(|platform| platform.matches(os, architecture))
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::oci::Platform;

    pub fn demo_image_manifest() -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MANIFEST.to_string()),
            config: Some(Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: Digest::sha256_of(b"config"),
                size: 6,
                annotations: HashMap::new(),
                platform: None,
            }),
            layers: vec![Descriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                digest: Digest::sha256_of(b"layer"),
                size: 5,
                annotations: HashMap::new(),
                platform: None,
            }],
            manifests: Vec::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn demo_index() -> Manifest {
        let member = |os: &str, architecture: &str, content: &[u8]| Descriptor {
            media_type: OCI_IMAGE_MANIFEST.to_string(),
            digest: Digest::sha256_of(content),
            size: content.len() as u64,
            annotations: HashMap::new(),
            platform: Some(Platform {
                os: os.to_string(),
                architecture: architecture.to_string(),
                variant: None,
            }),
        };

        Manifest {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            config: None,
            layers: Vec::new(),
            manifests: vec![
                member("linux", "amd64", b"amd64"),
                member("linux", "arm64", b"arm64"),
            ],
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn test_from_slice() {
        let manifest = demo_image_manifest();
        let raw_manifest = serde_json::to_vec(&manifest).expect("Failed to serialize manifest");

        let parsed_manifest =
            Manifest::from_slice(raw_manifest.as_slice()).expect("Failed to parse manifest");
        assert_eq!(manifest, parsed_manifest);
    }

    #[test]
    fn test_kind_resolution() {
        let manifest = demo_image_manifest();
        assert_eq!(
            manifest.kind(Some(DOCKER_IMAGE_MANIFEST)).unwrap(),
            ManifestKind::DockerImageManifest
        );
        assert_eq!(
            manifest.kind(Some("application/json")).unwrap(),
            ManifestKind::OciImageManifest
        );
        assert_eq!(
            manifest.kind(None).unwrap(),
            ManifestKind::OciImageManifest
        );

        let mut index = demo_index();
        index.media_type = None;
        assert_eq!(index.kind(None).unwrap(), ManifestKind::OciIndex);
    }

    #[test]
    fn test_kind_with_parameters() {
        assert_eq!(
            ManifestKind::from_media_type(
                "application/vnd.docker.distribution.manifest.v2+json; charset=utf-8"
            ),
            Some(ManifestKind::DockerImageManifest)
        );
        assert_eq!(ManifestKind::from_media_type("text/plain"), None);
    }

    #[test]
    fn test_blob_digests() {
        let manifest = demo_image_manifest();
        assert_eq!(
            manifest.blob_digests(),
            vec![Digest::sha256_of(b"config"), Digest::sha256_of(b"layer")]
        );
        assert!(demo_index().blob_digests().is_empty());
    }

    #[test]
    fn test_platform_member() {
        let index = demo_index();
        let member = index.platform_member("linux", "arm64").unwrap();
        assert_eq!(member.digest, Digest::sha256_of(b"arm64"));
        assert!(index.platform_member("windows", "amd64").is_none());
        assert_eq!(index.member_digests().len(), 2);
    }
}
