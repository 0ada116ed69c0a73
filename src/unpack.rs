//! Turning resolved images into snapshots.
//!
//! Every image goes through `Pending -> Unpacking -> {Done, Failed}` exactly once.  Layers are
//! applied bottom to top, each one keyed by its chain ID; layers that already have a snapshot
//! (from an earlier load or a sibling image) are skipped.  The uncompressed content of each layer
//! is checked against the diff ID from the image config while the snapshotter reads it.

use std::{
    fmt,
    io::{self, Read},
    iter::zip,
};

use anyhow::{anyhow, bail, ensure, Context};
use log::{debug, info};
use oci_spec::image::{ImageConfiguration, ImageManifest};

use crate::{
    archive::ResolvedImage,
    cancel::{self, CancellationToken},
    compression::Compression,
    digest::{Digest, Digester},
    error::{Error, Result},
    snapshot::{chain_id, Snapshotter, Snapshotters},
    store::ContentStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackState {
    Pending,
    Unpacking,
    Done,
    Failed,
}

impl fmt::Display for UnpackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnpackState::Pending => "pending",
            UnpackState::Unpacking => "unpacking",
            UnpackState::Done => "done",
            UnpackState::Failed => "failed",
        })
    }
}

/// Gets told about every state change of every image.
pub trait UnpackObserver {
    fn on_transition(
        &mut self,
        image: &ResolvedImage,
        from: UnpackState,
        to: UnpackState,
    ) -> io::Result<()>;
}

/// An observer that ignores everything.
impl UnpackObserver for () {
    fn on_transition(
        &mut self,
        _image: &ResolvedImage,
        _from: UnpackState,
        _to: UnpackState,
    ) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackResult {
    pub name: String,
    /// Always the digest of the image that was unpacked.
    pub digest: Digest,
    /// The snapshot holding the image's root filesystem, `None` for an image without layers.
    pub chain_id: Option<Digest>,
    pub state: UnpackState,
}

/// Checks the uncompressed layer against its diff ID as it is read.
///
/// Fails the read that hits EOF if the content doesn't match, and any read after cancellation.
struct VerifyingReader<R> {
    inner: R,
    digester: Option<Digester>,
    expected: Digest,
    cancel: CancellationToken,
}

impl<R: Read> VerifyingReader<R> {
    fn new(inner: R, expected: Digest, cancel: CancellationToken) -> Self {
        Self {
            inner,
            digester: Some(Digester::new()),
            expected,
            cancel,
        }
    }

    /// Whether the whole layer was read and matched.
    fn verified(&self) -> bool {
        self.digester.is_none()
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("operation cancelled"));
        }
        let Some(digester) = &mut self.digester else {
            return Ok(0);
        };

        let n = self.inner.read(buf)?;
        if n > 0 || buf.is_empty() {
            digester.update(&buf[..n]);
            return Ok(n);
        }

        if let Some(digester) = self.digester.take() {
            let actual = digester.finish();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "layer content {actual} does not match diff ID {}",
                        self.expected
                    ),
                ));
            }
        }
        Ok(0)
    }
}

/// Unpacks images from a content store through a named snapshotter.
pub struct Unpacker<'a> {
    store: &'a dyn ContentStore,
    snapshotters: &'a Snapshotters,
    cancel: CancellationToken,
}

impl<'a> Unpacker<'a> {
    pub fn new(store: &'a dyn ContentStore, snapshotters: &'a Snapshotters) -> Self {
        Self {
            store,
            snapshotters,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Unpack one image.  Single attempt: any failure leaves the image `Failed`.
    pub fn unpack(
        &self,
        image: &ResolvedImage,
        snapshotter: &str,
        observer: &mut dyn UnpackObserver,
    ) -> Result<UnpackResult> {
        let snapshotter = self.snapshotters.get(snapshotter)?;
        cancel::check(&self.cancel)?;

        observer
            .on_transition(image, UnpackState::Pending, UnpackState::Unpacking)
            .map_err(Error::Output)?;
        info!("Unpacking {} ({})", image.name, image.digest());

        match self.unpack_layers(image, snapshotter) {
            Ok(chain_id) => {
                observer
                    .on_transition(image, UnpackState::Unpacking, UnpackState::Done)
                    .map_err(Error::Output)?;
                Ok(UnpackResult {
                    name: image.name.clone(),
                    digest: *image.digest(),
                    chain_id,
                    state: UnpackState::Done,
                })
            }
            Err(err) => {
                observer
                    .on_transition(image, UnpackState::Unpacking, UnpackState::Failed)
                    .map_err(Error::Output)?;
                if self.cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::unpack(&image.name, format!("{err:#}")))
                }
            }
        }
    }

    fn unpack_layers(
        &self,
        image: &ResolvedImage,
        snapshotter: &dyn Snapshotter,
    ) -> anyhow::Result<Option<Digest>> {
        let raw_manifest = self.store.read(image.digest())?;
        ensure!(
            Digest::of(&raw_manifest) == *image.digest(),
            "manifest content does not match {}",
            image.digest()
        );
        let manifest =
            ImageManifest::from_reader(&raw_manifest[..]).context("parsing image manifest")?;

        let config_digest: Digest = manifest.config().digest().to_string().parse()?;
        let raw_config = self.store.read(&config_digest)?;
        let config =
            ImageConfiguration::from_reader(&raw_config[..]).context("parsing image config")?;

        let diff_ids = config
            .rootfs()
            .diff_ids()
            .iter()
            .map(|id| id.parse::<Digest>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parsing diff IDs")?;
        if diff_ids.len() != manifest.layers().len() {
            bail!(
                "manifest has {} layers but config has {} diff IDs",
                manifest.layers().len(),
                diff_ids.len()
            );
        }

        let mut parent: Option<Digest> = None;
        for (layer, diff_id) in zip(manifest.layers(), &diff_ids) {
            cancel::check(&self.cancel)?;

            let chain = chain_id(parent.as_ref(), diff_id);
            if snapshotter.exists(&chain)? {
                debug!("Layer {diff_id} already unpacked as {chain}");
                parent = Some(chain);
                continue;
            }

            let media_type = layer.media_type().to_string();
            let compression = Compression::from_layer_media_type(&media_type)
                .ok_or_else(|| anyhow!("unsupported layer media type {media_type}"))?;
            let blob: Digest = layer.digest().to_string().parse()?;

            debug!("Applying layer {blob} ({compression:?}) as {chain}");
            let stream = compression
                .decompress(self.store.open(&blob)?)
                .with_context(|| format!("decompressing layer {blob}"))?;
            let mut reader = VerifyingReader::new(stream, *diff_id, self.cancel.clone());
            snapshotter
                .apply(parent.as_ref(), &chain, &mut reader)
                .with_context(|| format!("applying layer {blob}"))?;
            ensure!(
                reader.verified(),
                "snapshotter {} did not read layer {blob} to the end",
                snapshotter.name()
            );

            parent = Some(chain);
        }

        Ok(parent)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    fn read_all(reader: &mut impl Read) -> io::Result<Vec<u8>> {
        let mut out = vec![];
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_verifying_reader() {
        let data = b"some layer".to_vec();
        let mut good = VerifyingReader::new(&data[..], Digest::of(&data), CancellationToken::new());
        assert!(!good.verified());
        assert_eq!(read_all(&mut good).unwrap(), data);
        assert!(good.verified());

        let mut bad = VerifyingReader::new(&data[..], Digest::of(b"other"), CancellationToken::new());
        let err = read_all(&mut bad).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_verifying_reader_cancel() {
        let cancel = CancellationToken::new();
        let mut reader = VerifyingReader::new(&b"abc"[..], Digest::of(b"abc"), cancel.clone());
        cancel.cancel();
        assert!(read_all(&mut reader).is_err());
    }
}
