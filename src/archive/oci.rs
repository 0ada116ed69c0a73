//! The OCI image layout: `oci-layout`, `index.json` and nested indexes.

use std::collections::HashMap;

use oci_spec::image::{Descriptor, ImageIndex};
use serde::Deserialize;

use super::ArchiveEntry;
use crate::{
    digest::Digest,
    error::{Error, Result},
    platform::Platform,
};

/// Full reference of an image, as written by containerd and nerdctl.
const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
/// Reference of an image as written by other OCI tools; often only a tag.
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// BuildKit marks attestation manifests in an index with this.
const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";
const REFERENCE_TYPE_ATTESTATION: &str = "attestation-manifest";

const SUPPORTED_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageLayout {
    image_layout_version: String,
}

pub(super) fn check_layout(data: &[u8]) -> Result<()> {
    let layout: ImageLayout = serde_json::from_slice(data)
        .map_err(|e| Error::format(format!("invalid oci-layout: {e}")))?;
    if layout.image_layout_version != SUPPORTED_LAYOUT_VERSION {
        return Err(Error::format(format!(
            "unsupported OCI layout version {:?}",
            layout.image_layout_version
        )));
    }
    Ok(())
}

fn image_name(annotations: Option<&HashMap<String, String>>) -> String {
    let Some(annotations) = annotations else {
        return String::new();
    };
    annotations
        .get(ANNOTATION_IMAGE_NAME)
        .or_else(|| annotations.get(ANNOTATION_REF_NAME))
        .cloned()
        .unwrap_or_default()
}

fn is_attestation(descriptor: &Descriptor) -> bool {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REFERENCE_TYPE))
        .is_some_and(|t| t == REFERENCE_TYPE_ATTESTATION)
}

fn entry(descriptor: &Descriptor, name: String) -> Result<ArchiveEntry> {
    Ok(ArchiveEntry {
        name,
        media_type: descriptor.media_type().to_string(),
        digest: descriptor.digest().to_string().parse()?,
        size: descriptor.size(),
        platform: descriptor.platform().as_ref().map(Platform::from),
    })
}

fn parse_index(data: &[u8], what: &str) -> Result<ImageIndex> {
    ImageIndex::from_reader(data).map_err(|e| Error::format(format!("{what}: {e}")))
}

/// The top-level entries of `index.json`, named from their annotations.
pub(super) fn index_entries(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let index = parse_index(data, "index.json")?;
    index
        .manifests()
        .iter()
        .map(|descriptor| entry(descriptor, image_name(descriptor.annotations().as_ref())))
        .collect()
}

/// The manifests referenced by the index blob `digest`, minus attestations.
pub(super) fn child_entries(digest: &Digest, data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let index = parse_index(data, &format!("index {digest}"))?;
    index
        .manifests()
        .iter()
        .filter(|descriptor| !is_attestation(descriptor))
        .map(|descriptor| entry(descriptor, String::new()))
        .collect()
}
