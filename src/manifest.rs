//! Image manifest layouts and their canonical layer ordering
//!
//! Two legacy/current registry schemas are supported. Nothing else of the
//! image format is interpreted here; blobs are opaque tarballs handed to
//! the backend.
//!
//! Reference: https://docs.docker.com/registry/spec/manifest-v2-2/

use serde::{Deserialize, Serialize};

/// A manifest in either supported layout. Schema 2 is tried first; its
/// required `config`/`layers` fields never appear in schema 1 documents.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    V2(ManifestV2),
    V1(ManifestV1),
}

/// Schema 1 ("signed manifest"). Lists layers newest-first.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ManifestV1 {
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<LayerRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LayerRef {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// Schema 2. Lists layers bottom-to-top already.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ManifestV2 {
    pub config: Link,
    pub layers: Vec<Link>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Link {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: String,
}

pub mod media_types {
    pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
}

impl Manifest {
    /// Blob digests in canonical bottom-to-top import order.
    pub fn ordered_digests(&self) -> Vec<String> {
        match self {
            Manifest::V1(manifest) => manifest
                .fs_layers
                .iter()
                .rev()
                .map(|layer| layer.blob_sum.clone())
                .collect(),
            Manifest::V2(manifest) => manifest
                .layers
                .iter()
                .map(|layer| layer.digest.clone())
                .collect(),
        }
    }
}
