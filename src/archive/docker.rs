//! The `docker save` layout: a `manifest.json` listing configs and layers by path.
//!
//! Docker archives carry no registry manifests, so one is synthesized per `manifest.json` entry
//! (a Docker schema 2 manifest) and stored alongside the other blobs.  After that, the image is
//! handled exactly like a single-platform OCI image.

use serde::{Deserialize, Serialize};

use super::{ArchiveEntry, Contents, Importer, MEDIA_TYPE_DOCKER_MANIFEST};
use crate::{
    compression::Compression,
    digest::Digest,
    error::{Error, Result},
    platform::Platform,
    store::Descriptor,
};

const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// One element of `manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Schema2Manifest {
    schema_version: u32,
    media_type: &'static str,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// The platform fields of an image config; everything else is ignored here.
#[derive(Debug, Default, Deserialize)]
struct ConfigPlatform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

impl ConfigPlatform {
    fn platform(&self) -> Option<Platform> {
        if self.os.is_empty() || self.architecture.is_empty() {
            None
        } else {
            Some(Platform::new(
                &self.os,
                &self.architecture,
                self.variant.as_deref(),
            ))
        }
    }
}

fn layer_media_type(compression: Compression) -> &'static str {
    match compression {
        Compression::None => MEDIA_TYPE_LAYER,
        Compression::Gzip => MEDIA_TYPE_LAYER_GZIP,
        Compression::Zstd => MEDIA_TYPE_LAYER_ZSTD,
    }
}

impl Importer<'_> {
    /// Turn `manifest.json` into top-level entries, one per repository tag.
    pub(super) fn docker_entries(
        &self,
        manifest_json: &[u8],
        contents: &Contents,
    ) -> Result<Vec<ArchiveEntry>> {
        let manifest: Vec<ManifestEntry> = serde_json::from_slice(manifest_json)
            .map_err(|e| Error::format(format!("manifest.json: {e}")))?;

        let mut entries = vec![];
        for image in manifest {
            let config = contents.file(&image.config)?;
            let raw_config = self.read_blob(&config.digest)?;
            let platform = serde_json::from_slice::<ConfigPlatform>(&raw_config)
                .map_err(|e| Error::format(format!("{}: {e}", image.config)))?
                .platform();

            let layers = image
                .layers
                .iter()
                .map(|path| {
                    let layer = contents.file(path)?;
                    Ok(Descriptor {
                        media_type: layer_media_type(layer.compression).to_string(),
                        digest: layer.digest,
                        size: layer.size,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let synthesized = Schema2Manifest {
                schema_version: 2,
                media_type: MEDIA_TYPE_DOCKER_MANIFEST,
                config: Descriptor {
                    media_type: MEDIA_TYPE_CONFIG.to_string(),
                    digest: config.digest,
                    size: config.size,
                },
                layers,
            };
            let raw = serde_json::to_vec(&synthesized)
                .map_err(|e| Error::format(format!("synthesizing manifest: {e}")))?;
            let digest = Digest::of(&raw);
            self.store.put(&digest, &mut &raw[..])?;
            log::debug!("Synthesized manifest {digest} for {}", image.config);

            let tags = image.repo_tags.unwrap_or_default();
            let names = if tags.is_empty() {
                vec![String::new()]
            } else {
                tags
            };
            for name in names {
                entries.push(ArchiveEntry {
                    name,
                    media_type: MEDIA_TYPE_DOCKER_MANIFEST.to_string(),
                    digest,
                    size: raw.len() as u64,
                    platform: platform.clone(),
                });
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_manifest_entry_fields() {
        let parsed: Vec<ManifestEntry> = serde_json::from_str(
            r#"[{"Config": "abc.json", "RepoTags": ["foo:1", "foo:2"], "Layers": ["l1/layer.tar"]},
                {"Config": "def.json", "RepoTags": null, "Layers": []}]"#,
        )
        .unwrap();
        assert_eq!(parsed[0].repo_tags.as_deref(), Some(&["foo:1".to_string(), "foo:2".into()][..]));
        assert_eq!(parsed[1].repo_tags, None);
        assert_eq!(parsed[0].layers, ["l1/layer.tar"]);
    }

    #[test]
    fn test_config_platform() {
        let config: ConfigPlatform =
            serde_json::from_str(r#"{"os": "linux", "architecture": "arm", "variant": "v6"}"#)
                .unwrap();
        assert_eq!(config.platform(), Some(Platform::new("linux", "arm", Some("v6"))));

        let config: ConfigPlatform = serde_json::from_str(r#"{"config": {}}"#).unwrap();
        assert_eq!(config.platform(), None);
    }

    #[test]
    fn test_synthesized_manifest_parses() {
        let manifest = Schema2Manifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_DOCKER_MANIFEST,
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.into(),
                digest: Digest::of(b"config"),
                size: 6,
            },
            layers: vec![Descriptor {
                media_type: layer_media_type(Compression::Gzip).into(),
                digest: Digest::of(b"layer"),
                size: 5,
            }],
        };
        let raw = serde_json::to_vec(&manifest).unwrap();
        let parsed = oci_spec::image::ImageManifest::from_reader(&raw[..]).unwrap();
        assert_eq!(parsed.layers().len(), 1);
        assert_eq!(
            parsed.config().digest().to_string(),
            Digest::of(b"config").to_string()
        );
    }
}
