//! Building image archives in memory.

#![allow(dead_code)]

use std::{
    io::{Read, Write},
    path::PathBuf,
};

use flate2::{write::GzEncoder, Compression as GzLevel};
use serde_json::{json, Value};
use tempfile::TempDir;

use ociload::{
    load_image,
    snapshot::{chain_ids, NativeSnapshotter, Snapshotters},
    store::MemoryStore,
    CancellationToken, Digest, LoadContext, LoadOptions, LoadSummary,
};

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// An uncompressed layer holding the given regular files.  A `None` content is a directory.
pub fn layer(files: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        match content {
            Some(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, path, *data).unwrap();
            }
            None => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, path, std::io::empty()).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

pub fn descriptor(media_type: &str, data: &[u8]) -> Value {
    json!({
        "mediaType": media_type,
        "digest": Digest::of(data).to_string(),
        "size": data.len(),
    })
}

/// A single-platform image: manifest, config and (possibly compressed) layers.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
    pub diff_ids: Vec<Digest>,
    pub os: String,
    pub architecture: String,
}

impl TestImage {
    pub fn new(os: &str, architecture: &str, layers: &[Vec<u8>], compress: bool) -> Self {
        let diff_ids: Vec<Digest> = layers.iter().map(|l| Digest::of(l)).collect();
        Self::with_diff_ids(os, architecture, layers, compress, diff_ids)
    }

    /// Like [`TestImage::new`], but with made-up diff IDs in the config.
    pub fn with_diff_ids(
        os: &str,
        architecture: &str,
        layers: &[Vec<u8>],
        compress: bool,
        diff_ids: Vec<Digest>,
    ) -> Self {
        let config = serde_json::to_vec(&json!({
            "architecture": architecture,
            "os": os,
            "config": {},
            "rootfs": {
                "type": "layers",
                "diff_ids": diff_ids.iter().map(Digest::to_string).collect::<Vec<_>>(),
            },
        }))
        .unwrap();

        let (media_type, layers): (_, Vec<Vec<u8>>) = if compress {
            (OCI_LAYER_GZIP, layers.iter().map(|l| gzip(l)).collect())
        } else {
            (OCI_LAYER, layers.to_vec())
        };

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": descriptor(OCI_CONFIG, &config),
            "layers": layers.iter().map(|l| descriptor(media_type, l)).collect::<Vec<_>>(),
        }))
        .unwrap();

        Self {
            manifest,
            config,
            layers,
            diff_ids,
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.manifest)
    }

    pub fn top_chain_id(&self) -> Digest {
        *chain_ids(&self.diff_ids).last().unwrap()
    }

    /// A descriptor for an index, optionally named and with a platform.
    pub fn descriptor(&self, name: Option<&str>, platform: bool) -> Value {
        let mut descriptor = descriptor(OCI_MANIFEST, &self.manifest);
        if let Some(name) = name {
            descriptor["annotations"] = json!({ "io.containerd.image.name": name });
        }
        if platform {
            descriptor["platform"] = json!({ "os": self.os, "architecture": self.architecture });
        }
        descriptor
    }

    pub fn blobs(&self) -> Vec<Vec<u8>> {
        let mut blobs = vec![self.manifest.clone(), self.config.clone()];
        blobs.extend(self.layers.iter().cloned());
        blobs
    }
}

pub fn index(manifests: Vec<Value>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": manifests,
    }))
    .unwrap()
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data).unwrap();
}

/// An OCI layout tarball with `index.json` first.
pub fn oci_archive(index_json: &[u8], blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    append_file(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#);
    append_file(&mut builder, "index.json", index_json);
    let mut seen = std::collections::HashSet::new();
    for blob in blobs {
        let digest = Digest::of(blob);
        if seen.insert(digest) {
            append_file(&mut builder, &format!("blobs/sha256/{}", digest.hex()), blob);
        }
    }
    builder.into_inner().unwrap()
}

/// A `docker save` tarball with `manifest.json` last.
pub fn docker_archive(image: &TestImage, tags: &[&str]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    let config_path = format!("{}.json", Digest::of(&image.config).hex());
    append_file(&mut builder, &config_path, &image.config);

    let mut layer_paths = vec![];
    for (n, layer) in image.layers.iter().enumerate() {
        let path = format!("layer{n}/layer.tar");
        append_file(&mut builder, &path, layer);
        layer_paths.push(path);
    }

    let manifest = serde_json::to_vec(&json!([{
        "Config": config_path,
        "RepoTags": tags,
        "Layers": layer_paths,
    }]))
    .unwrap();
    append_file(&mut builder, "manifest.json", &manifest);
    builder.into_inner().unwrap()
}

/// A scratch state directory with an in-memory store and the native snapshotter.
pub struct Fixture {
    pub tmp: TempDir,
    pub store: MemoryStore,
    pub snapshotters: Snapshotters,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let snapshotters = Snapshotters::new().with(NativeSnapshotter::open(tmp.path()).unwrap());
        Self {
            tmp,
            store: MemoryStore::new(),
            snapshotters,
            cancel: CancellationToken::new(),
        }
    }

    /// Run a load, returning its result and everything written to the status output.
    pub fn load(
        &self,
        archive: &[u8],
        options: &LoadOptions,
    ) -> (ociload::Result<LoadSummary>, String) {
        self.load_from(archive, options)
    }

    /// Like [`Fixture::load`], reading the archive from an arbitrary stream.
    pub fn load_from(
        &self,
        input: impl Read,
        options: &LoadOptions,
    ) -> (ociload::Result<LoadSummary>, String) {
        let context = LoadContext {
            store: &self.store,
            images: &self.store,
            snapshotters: &self.snapshotters,
            cancel: self.cancel.clone(),
        };
        let mut out = vec![];
        let result = load_image(input, options, &context, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    pub fn snapshot_path(&self, chain_id: &Digest) -> PathBuf {
        NativeSnapshotter::open(self.tmp.path())
            .unwrap()
            .path(chain_id)
    }
}
