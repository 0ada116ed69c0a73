//! Single-pass decoding of Docker v1.2 and OCI v1.0 image archives.
//!
//! The archive is read exactly once, front to back.  Because the manifest files may appear
//! anywhere in the tar stream (Docker puts `manifest.json` last, OCI tools usually put
//! `index.json` first), every blob is registered with the content store as it passes by, and the
//! manifests are only interpreted once the stream is exhausted:
//!
//!  - `blobs/<algorithm>/<hex>` files are streamed into the store under the digest from their path
//!    and verified on the way.
//!  - `index.json`, `oci-layout` and `manifest.json` are kept in memory.
//!  - any other regular file (Docker's `<id>.json` configs and `<id>/layer.tar` layers) is spooled
//!    to a temporary file while being hashed, then stored under the computed digest.
//!
//! Resolution then turns the top-level manifests into [`ResolvedImage`]s, applying the
//! [`DigestTranslator`] for naming and [`platform::select`] to multi-platform indexes.  Either the
//! whole archive resolves, or nothing is returned; blobs already written stay in the store.

mod docker;
mod oci;
mod reader;

use std::{
    collections::HashMap,
    io::{self, Read, Seek, Write},
};

use log::{debug, info, trace, warn};
use oci_spec::image::ImageManifest;
use tar::EntryType;

use crate::{
    cancel::CancellationToken,
    compression::{auto_decompress, Compression, MagicSniffer},
    digest::{Digest, DigestError, HashingReader},
    error::{Error, Result},
    platform::{self, Platform, PlatformMode, PlatformUnmatched},
    reference::{DigestRefPolicy, DigestTranslator},
    store::{ContentStore, Descriptor, ImageRecord, ImageStore, StoreError},
};

use reader::{ForwardReader, StreamFault, StreamState};

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// `index.json`, `oci-layout` and `manifest.json` larger than this are rejected.
const MAX_JSON_SIZE: u64 = 1 << 20;

/// Symlink chains inside an archive longer than this are rejected.
const MAX_LINK_DEPTH: usize = 16;

pub fn is_index(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST
    )
}

pub fn is_manifest(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST
    )
}

/// One manifest or index record found in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// The reference the archive gives this entry, possibly empty.
    pub name: String,
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub platform: Option<Platform>,
}

impl ArchiveEntry {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest,
            size: self.size,
        }
    }
}

/// An image manifest selected for unpacking, under its canonical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Never empty.
    pub name: String,
    /// Always an image manifest, never an index.
    pub target: Descriptor,
    pub platform: Option<Platform>,
}

impl ResolvedImage {
    pub fn digest(&self) -> &Digest {
        &self.target.digest
    }
}

/// Everything an import produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// In archive order, then index order.
    pub images: Vec<ResolvedImage>,
    /// The image records registered with the image store.
    pub records: Vec<ImageRecord>,
    /// Indexes that were skipped because no manifest matched the requested platform.
    pub warnings: Vec<PlatformUnmatched>,
}

/// A regular file of the archive whose content went to the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StoredFile {
    digest: Digest,
    size: u64,
    compression: Compression,
}

/// What the single pass over the archive learned.
#[derive(Debug, Default)]
struct Contents {
    files: HashMap<String, StoredFile>,
    /// Link path → target.  Hard link targets are made absolute (relative to the archive root).
    links: HashMap<String, String>,
    index_json: Option<Vec<u8>>,
    manifest_json: Option<Vec<u8>>,
    oci_layout: Option<Vec<u8>>,
}

impl Contents {
    /// Look up a stored file by its path in the archive, following links.
    fn file(&self, path: &str) -> Result<StoredFile> {
        let mut path = normalize_path(path);
        for _ in 0..MAX_LINK_DEPTH {
            if let Some(file) = self.files.get(&path) {
                return Ok(*file);
            }
            match self.links.get(&path) {
                Some(target) => path = resolve_link(&path, target),
                None => return Err(Error::format(format!("{path:?} not found in archive"))),
            }
        }
        Err(Error::format(format!(
            "too many levels of links resolving {path:?}"
        )))
    }
}

/// Canonical form of a path inside the archive: relative, no `.` or `..`, no repeated slashes.
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = vec![];
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn resolve_link(path: &str, target: &str) -> String {
    if target.starts_with('/') {
        normalize_path(target)
    } else {
        let parent = path.rsplit_once('/').map_or("", |(parent, _)| parent);
        normalize_path(&format!("{parent}/{target}"))
    }
}

/// The digest encoded in a `blobs/<algorithm>/<hex>` path, if it is one.
fn blob_digest(path: &str) -> std::result::Result<Option<Digest>, DigestError> {
    let Some(rest) = path.strip_prefix("blobs/") else {
        return Ok(None);
    };
    match rest.split_once('/') {
        Some((algorithm, hex)) if !hex.contains('/') => {
            Ok(Some(Digest::from_hex(algorithm, hex)?))
        }
        _ => Ok(None),
    }
}

/// Decodes archives and registers their content.
///
/// Collaborators are passed in explicitly; the importer holds no other state between calls.
pub struct Importer<'a> {
    store: &'a dyn ContentStore,
    images: &'a dyn ImageStore,
    namespace: String,
    translator: DigestTranslator,
    platforms: PlatformMode,
    cancel: CancellationToken,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn ContentStore, images: &'a dyn ImageStore) -> Self {
        Self {
            store,
            images,
            namespace: "default".to_string(),
            translator: DigestTranslator::new("", DigestRefPolicy::KeepIfNamed),
            platforms: PlatformMode::Default,
            cancel: CancellationToken::new(),
        }
    }

    /// The namespace image records are registered in.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn translator(mut self, translator: DigestTranslator) -> Self {
        self.translator = translator;
        self
    }

    pub fn platforms(mut self, platforms: PlatformMode) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Import the archive in `stream`.
    ///
    /// The stream is read once, front to back.  On failure nothing is returned and no image
    /// record is written, but blobs that made it into the content store are left there.
    pub fn import(&self, stream: impl Read) -> Result<ImportOutcome> {
        let reader = ForwardReader::new(stream, self.cancel.clone());
        let state = reader.state();
        let contents = self.read_archive(reader, &state)?;
        info!(
            "Read {} bytes, {} files from archive",
            state.offset(),
            contents.files.len()
        );

        let entries = self.top_level_entries(&contents)?;
        let outcome = self.resolve(&entries)?;

        for record in &outcome.records {
            debug!("Registering {} -> {}", record.name, record.target.digest);
            self.images.put_image(&self.namespace, record)?;
        }
        Ok(outcome)
    }

    /// Classify a failure of the tar stream: cancelled, broken input, or broken archive.
    fn stream_error(&self, state: &StreamState, err: io::Error) -> Error {
        match state.fault() {
            Some(StreamFault::Cancelled) => Error::Cancelled,
            Some(StreamFault::Source(_)) => Error::Io(err),
            None => Error::format(format!("{err} (near byte {})", state.offset())),
        }
    }

    fn store_error(&self, path: &str, state: &StreamState, err: StoreError) -> Error {
        match err {
            StoreError::Source { source, .. } => self.stream_error(state, source),
            StoreError::DigestMismatch { expected, actual } => Error::format(format!(
                "{path}: content does not match {expected} (got {actual})"
            )),
            other => Error::ContentStore(other),
        }
    }

    fn read_archive<R: Read>(
        &self,
        reader: ForwardReader<R>,
        state: &StreamState,
    ) -> Result<Contents> {
        let (compression, stream) =
            auto_decompress(reader).map_err(|e| self.stream_error(state, e))?;
        debug!("Archive compression: {compression:?}");

        let mut archive = tar::Archive::new(stream);
        let mut contents = Contents::default();

        let entries = archive
            .entries()
            .map_err(|e| self.stream_error(state, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| self.stream_error(state, e))?;
            let path = normalize_path(
                &entry
                    .path()
                    .map_err(|e| self.stream_error(state, e))?
                    .to_string_lossy(),
            );

            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {
                    self.read_file(&mut contents, path, &mut entry, state)?;
                }
                kind @ (EntryType::Symlink | EntryType::Link) => {
                    let Some(target) = entry
                        .link_name()
                        .map_err(|e| self.stream_error(state, e))?
                    else {
                        return Err(Error::format(format!("link {path:?} has no target")));
                    };
                    let target = target.to_string_lossy();
                    let target = match kind {
                        EntryType::Link => format!("/{target}"),
                        _ => target.into_owned(),
                    };
                    trace!("Link {path} -> {target}");
                    contents.links.insert(path, target);
                }
                kind => trace!("Skipping {path} ({kind:?})"),
            }
        }

        Ok(contents)
    }

    fn read_file<R: Read>(
        &self,
        contents: &mut Contents,
        path: String,
        entry: &mut tar::Entry<'_, R>,
        state: &StreamState,
    ) -> Result<()> {
        let size = entry.size();
        let complete = |read: u64| {
            if read == size {
                Ok(())
            } else {
                Err(Error::format(format!(
                    "unexpected end of archive in {path} ({read} of {size} bytes)"
                )))
            }
        };

        let slot = match path.as_str() {
            "index.json" => Some(&mut contents.index_json),
            "manifest.json" => Some(&mut contents.manifest_json),
            "oci-layout" => Some(&mut contents.oci_layout),
            _ => None,
        };
        if let Some(slot) = slot {
            if size > MAX_JSON_SIZE {
                return Err(Error::format(format!("{path} is too large ({size} bytes)")));
            }
            let mut data = Vec::with_capacity(size as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| self.stream_error(state, e))?;
            complete(data.len() as u64)?;
            *slot = Some(data);
            return Ok(());
        }

        if path == "repositories" {
            trace!("Ignoring legacy repositories file");
            return Ok(());
        }

        let stored = match blob_digest(&path) {
            Ok(Some(digest)) => self.store_blob(&path, digest, entry, state)?,
            Ok(None) => self.spool_file(&path, entry, state)?,
            Err(DigestError::UnsupportedAlgorithm(algorithm)) => {
                // only fatal if a selected image references it, which fails its blob check
                debug!("Skipping {path}: unsupported digest algorithm {algorithm}");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        complete(stored.size)?;
        contents.files.insert(path, stored);
        Ok(())
    }

    /// Stream a `blobs/` file straight into the store under the digest from its path.
    fn store_blob(
        &self,
        path: &str,
        digest: Digest,
        entry: &mut impl Read,
        state: &StreamState,
    ) -> Result<StoredFile> {
        let mut sniffer = MagicSniffer::new(entry);
        let size = self
            .store
            .put(&digest, &mut sniffer)
            .map_err(|e| self.store_error(path, state, e))?;
        trace!("Stored {path} ({size} bytes)");
        Ok(StoredFile {
            digest,
            size,
            compression: sniffer.compression(),
        })
    }

    /// Hash a file of unknown digest into a temporary file, then store it.
    fn spool_file(
        &self,
        path: &str,
        entry: &mut impl Read,
        state: &StreamState,
    ) -> Result<StoredFile> {
        let mut spool = tempfile::tempfile()?;
        let mut reader = MagicSniffer::new(HashingReader::new(entry));
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.stream_error(state, e)),
            };
            spool.write_all(&buf[..n])?;
        }
        let compression = reader.compression();
        let (digest, size) = reader.into_inner().finish();

        spool.rewind()?;
        self.store
            .put(&digest, &mut spool)
            .map_err(|e| match e {
                StoreError::Source { source, .. } => Error::Io(source),
                other => Error::ContentStore(other),
            })?;
        trace!("Spooled {path} as {digest} ({size} bytes)");
        Ok(StoredFile {
            digest,
            size,
            compression,
        })
    }

    fn top_level_entries(&self, contents: &Contents) -> Result<Vec<ArchiveEntry>> {
        if let Some(index) = &contents.index_json {
            if let Some(layout) = &contents.oci_layout {
                oci::check_layout(layout)?;
            }
            debug!("Resolving OCI index");
            oci::index_entries(index)
        } else if let Some(manifest) = &contents.manifest_json {
            debug!("Resolving Docker manifest.json");
            self.docker_entries(manifest, contents)
        } else {
            Err(Error::format(
                "unrecognized image format: neither index.json nor manifest.json found",
            ))
        }
    }

    fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.store.read(digest).map_err(|e| match e {
            StoreError::NotFound(_) => {
                Error::format(format!("blob {digest} is referenced but not in the archive"))
            }
            other => Error::ContentStore(other),
        })
    }

    fn ensure_blob(&self, digest: &Digest) -> Result<()> {
        if self.store.has(digest)? {
            Ok(())
        } else {
            Err(Error::format(format!(
                "blob {digest} is referenced but not in the archive"
            )))
        }
    }

    /// The manifests of a (possibly multi-platform) index.
    fn index_children(&self, index: &ArchiveEntry) -> Result<Vec<ArchiveEntry>> {
        let data = self.read_blob(&index.digest)?;
        oci::child_entries(&index.digest, &data)
    }

    /// Make sure an image manifest and everything it references is present.
    fn check_manifest(&self, manifest: &ArchiveEntry) -> Result<()> {
        if is_index(&manifest.media_type) {
            return Err(Error::format(format!(
                "nested image index {} not supported",
                manifest.digest
            )));
        }
        let data = self.read_blob(&manifest.digest)?;
        let parsed = ImageManifest::from_reader(&data[..])
            .map_err(|e| Error::format(format!("manifest {}: {e}", manifest.digest)))?;

        for descriptor in std::iter::once(parsed.config()).chain(parsed.layers()) {
            let digest: Digest = descriptor.digest().to_string().parse()?;
            self.ensure_blob(&digest)?;
        }
        Ok(())
    }

    fn resolve(&self, entries: &[ArchiveEntry]) -> Result<ImportOutcome> {
        let mut outcome = ImportOutcome::default();

        for entry in entries {
            let names = self.translator.names(&entry.name, &entry.digest);
            let canonical = self.translator.translate(&entry.name, &entry.digest);

            let manifests = if is_index(&entry.media_type) {
                let children = self.index_children(entry)?;
                let selection = platform::select(&children, &self.platforms);
                if let Some(unmatched) = selection.unmatched {
                    let unmatched = unmatched.for_index(&canonical, &entry.digest);
                    warn!("Skipping {canonical}: {unmatched}");
                    outcome.warnings.push(unmatched);
                }
                selection.selected
            } else if is_manifest(&entry.media_type) {
                vec![entry.clone()]
            } else {
                return Err(Error::format(format!(
                    "{}: unsupported media type {}",
                    entry.digest, entry.media_type
                )));
            };

            if manifests.is_empty() {
                continue;
            }
            for manifest in &manifests {
                self.check_manifest(manifest)?;
            }

            for name in names {
                for manifest in &manifests {
                    outcome.images.push(ResolvedImage {
                        name: name.clone(),
                        target: manifest.descriptor(),
                        platform: manifest.platform.clone(),
                    });
                }
                outcome.records.push(ImageRecord {
                    name,
                    target: entry.descriptor(),
                });
            }
        }

        Ok(outcome)
    }
}
