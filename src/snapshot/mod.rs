//! Snapshot drivers: where unpacked layers end up.
//!
//! A snapshot is the filesystem state after applying a chain of layers.  Snapshots are keyed by
//! the chain ID of their top layer, so identical layer chains shared by several images are only
//! extracted once.

mod native;

use std::{
    collections::BTreeMap,
    io::{self, Read},
};

use crate::{
    digest::Digest,
    error::{Error, Result},
};

pub use native::NativeSnapshotter;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The layer stream could not be read or decoded.
    #[error("reading layer: {0}")]
    Layer(#[source] io::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("parent snapshot {0} does not exist")]
    MissingParent(Digest),

    #[error("invalid layer entry {path:?}: {reason}")]
    InvalidEntry { path: String, reason: &'static str },
}

/// A driver that materializes layers.
pub trait Snapshotter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a committed snapshot with this key exists.
    fn exists(&self, key: &Digest) -> std::result::Result<bool, SnapshotError>;

    /// Create the snapshot `key` by applying the uncompressed tar stream `layer` on top of
    /// `parent`.
    ///
    /// Implementations must read `layer` to its end before committing: the caller verifies the
    /// content while it is being read.  If `key` exists by the time the snapshot is committed,
    /// the existing one is kept and this succeeds.
    fn apply(
        &self,
        parent: Option<&Digest>,
        key: &Digest,
        layer: &mut dyn Read,
    ) -> std::result::Result<(), SnapshotError>;
}

/// The snapshotters available to a load, by name.
#[derive(Default)]
pub struct Snapshotters {
    drivers: BTreeMap<String, Box<dyn Snapshotter>>,
}

impl Snapshotters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, snapshotter: impl Snapshotter + 'static) -> Self {
        self.register(Box::new(snapshotter));
        self
    }

    pub fn register(&mut self, snapshotter: Box<dyn Snapshotter>) {
        self.drivers
            .insert(snapshotter.name().to_string(), snapshotter);
    }

    pub fn get(&self, name: &str) -> Result<&dyn Snapshotter> {
        self.drivers
            .get(name)
            .map(|driver| driver.as_ref())
            .ok_or_else(|| Error::UnknownSnapshotter(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

/// The chain ID of a layer: its diff ID for the bottom layer, otherwise
/// `sha256(parent_chain_id + " " + diff_id)`.
pub fn chain_id(parent: Option<&Digest>, diff_id: &Digest) -> Digest {
    match parent {
        None => *diff_id,
        Some(parent) => Digest::of(format!("{parent} {diff_id}").as_bytes()),
    }
}

/// Chain IDs for each layer of a stack, bottom first.
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut result: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        result.push(chain_id(result.last(), diff_id));
    }
    result
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_chain_ids() {
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");
        let c = Digest::of(b"c");

        let ids = chain_ids(&[a, b, c]);
        assert_eq!(ids[0], a);
        assert_eq!(
            ids[1],
            Digest::of(format!("{a} {b}").as_bytes()),
            "second chain ID hashes the textual digests"
        );
        assert_eq!(ids[2], Digest::of(format!("{} {c}", ids[1]).as_bytes()));
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn test_unknown_snapshotter() {
        let snapshotters = Snapshotters::new();
        assert!(matches!(
            snapshotters.get("overlayfs"),
            Err(Error::UnknownSnapshotter(name)) if name == "overlayfs"
        ));
    }
}
