mod descriptor;
mod digest;
mod error;
mod manifest;

pub use descriptor::{Descriptor, Platform};
pub use digest::Digest;
pub use error::Error;
pub use manifest::{Manifest, ManifestKind, ACCEPTED_MANIFEST_TYPES};
