//! The `native` snapshotter: every snapshot is a plain directory tree.
//!
//! A new snapshot starts as a full copy of its parent, has the layer applied on top (including
//! whiteouts) and is then committed with a rename.  This needs no kernel support at all, at the
//! cost of disk space.
//!
//! Layout under the state directory:
//!
//! ```text
//! snapshots/native/<chain id hex>/fs      committed snapshots
//! snapshots/native/.apply-XXXXXX/fs       snapshots being created
//! ```

use std::{
    collections::HashSet,
    ffi::OsStr,
    fs,
    io::{self, Read},
    os::unix::{
        ffi::OsStrExt,
        fs::{lchown, MetadataExt},
    },
    path::{Component, Path, PathBuf},
};

use log::{debug, trace};
use rustix::fs::{mknodat, symlinkat, FileType, Mode, CWD};

use super::{SnapshotError, Snapshotter};
use crate::digest::Digest;

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> SnapshotError {
    let context = context.into();
    move |source| SnapshotError::Io { context, source }
}

/// Remove whatever is at `path`, if anything.
fn remove_all(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove everything below `root/rel` that the current layer didn't put there.
///
/// `ours` holds the paths written by the current layer, together with all their ancestors.
fn clear_lower(root: &Path, rel: &Path, ours: &HashSet<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(root.join(rel)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        if !ours.contains(&child) {
            remove_all(&root.join(&child))?;
        } else if entry.file_type()?.is_dir() {
            clear_lower(root, &child, ours)?;
        }
    }
    Ok(())
}

/// Fail if any directory leading up to `rel` below `root` is a symlink.
///
/// Layers may plant symlinks pointing anywhere; nothing below the snapshot root may be reached
/// through one.
fn check_parents(root: &Path, rel: &Path) -> Result<(), SnapshotError> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SnapshotError::InvalidEntry {
                    path: rel.display().to_string(),
                    reason: "a parent directory is a symlink",
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(io_error(format!("checking {}", current.display()))(e)),
        }
    }
    Ok(())
}

/// Copy a directory tree, keeping file types and modes.  Hard links are not preserved.
fn copy_tree(src: &Path, dst: &Path, ownership: bool) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let kind = FileType::from_raw_mode(meta.mode());
    let mode = Mode::from_raw_mode(meta.mode());

    match kind {
        FileType::Directory => {
            fs::create_dir(dst)?;
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                copy_tree(&entry.path(), &dst.join(entry.file_name()), ownership)?;
            }
            fs::set_permissions(dst, meta.permissions())?;
        }
        FileType::RegularFile => {
            fs::copy(src, dst)?;
        }
        FileType::Symlink => symlinkat(fs::read_link(src)?, CWD, dst)?,
        FileType::BlockDevice | FileType::CharacterDevice => {
            mknodat(CWD, dst, kind, mode, meta.rdev())?
        }
        FileType::Fifo | FileType::Socket => mknodat(CWD, dst, kind, mode, 0)?,
        _ => {
            trace!("Not copying {}: unknown file type", src.display());
            return Ok(());
        }
    }

    if ownership {
        lchown(dst, Some(meta.uid()), Some(meta.gid()))?;
    }
    Ok(())
}

/// The path of a layer entry relative to the snapshot root.
fn relative_path(path: &Path) -> Result<PathBuf, SnapshotError> {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(SnapshotError::InvalidEntry {
                    path: path.display().to_string(),
                    reason: "path escapes the layer root",
                })
            }
        }
    }
    Ok(result)
}

#[derive(Debug)]
pub struct NativeSnapshotter {
    root: PathBuf,
    preserve_ownership: bool,
}

impl NativeSnapshotter {
    pub const NAME: &'static str = "native";

    /// Use (and create, if needed) the snapshot directory below `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let root = state_dir.as_ref().join("snapshots").join(Self::NAME);
        fs::create_dir_all(&root).map_err(io_error(format!("creating {}", root.display())))?;
        Ok(Self {
            root,
            preserve_ownership: rustix::process::geteuid().is_root(),
        })
    }

    /// Where the filesystem of snapshot `key` lives once committed.
    pub fn path(&self, key: &Digest) -> PathBuf {
        self.root.join(key.hex()).join("fs")
    }

    fn apply_layer(&self, dir: &Path, layer: &mut dyn Read) -> Result<(), SnapshotError> {
        let mut archive = tar::Archive::new(layer);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);
        archive.set_preserve_ownerships(self.preserve_ownership);

        // everything this layer wrote, so opaque whiteouts only hide lower layers
        let mut ours = HashSet::new();

        for entry in archive.entries().map_err(SnapshotError::Layer)? {
            let mut entry = entry.map_err(SnapshotError::Layer)?;
            let raw = entry.path().map_err(SnapshotError::Layer)?.into_owned();
            let path = relative_path(&raw)?;
            let Some(name) = path.file_name() else {
                // the layer root itself
                continue;
            };
            check_parents(dir, &path)?;

            if let Some(whiteout) = name.as_bytes().strip_prefix(b".wh.") {
                let parent = path.parent().unwrap_or(Path::new(""));
                let result = if whiteout == b".wh.opq" {
                    // complete name is '.wh..wh.opq'
                    clear_lower(dir, parent, &ours)
                } else {
                    remove_all(&dir.join(parent).join(OsStr::from_bytes(whiteout)))
                };
                result.map_err(io_error(format!("applying whiteout {}", raw.display())))?;
                continue;
            }

            if entry.header().entry_type().is_hard_link() {
                let source = entry
                    .link_name()
                    .map_err(SnapshotError::Layer)?
                    .map(|target| relative_path(&target))
                    .transpose()?;
                if let Some(source) = source {
                    check_parents(dir, &source)?;
                }
            }

            // Replace whatever is in the way, except a directory by a directory.
            let target = dir.join(&path);
            if let Ok(existing) = fs::symlink_metadata(&target) {
                if !(existing.is_dir() && entry.header().entry_type().is_dir()) {
                    remove_all(&target)
                        .map_err(io_error(format!("replacing {}", raw.display())))?;
                }
            }

            entry
                .unpack_in(dir)
                .map_err(io_error(format!("extracting {}", raw.display())))?;
            ours.extend(path.ancestors().map(Path::to_path_buf));
        }
        Ok(())
    }
}

impl Snapshotter for NativeSnapshotter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn exists(&self, key: &Digest) -> Result<bool, SnapshotError> {
        let path = self.root.join(key.hex());
        path.try_exists()
            .map_err(io_error(format!("checking {}", path.display())))
    }

    fn apply(
        &self,
        parent: Option<&Digest>,
        key: &Digest,
        layer: &mut dyn Read,
    ) -> Result<(), SnapshotError> {
        let staging = tempfile::Builder::new()
            .prefix(".apply-")
            .tempdir_in(&self.root)
            .map_err(io_error("creating staging directory"))?;
        let fs_dir = staging.path().join("fs");

        match parent {
            Some(parent) => {
                let source = self.path(parent);
                if !source.is_dir() {
                    return Err(SnapshotError::MissingParent(*parent));
                }
                copy_tree(&source, &fs_dir, self.preserve_ownership)
                    .map_err(io_error(format!("copying parent snapshot {parent}")))?;
            }
            None => fs::create_dir(&fs_dir).map_err(io_error("creating snapshot root"))?,
        }

        self.apply_layer(&fs_dir, layer)?;
        // the tar decoder stops at the end-of-archive marker; the rest is padding
        io::copy(layer, &mut io::sink()).map_err(SnapshotError::Layer)?;

        let target = self.root.join(key.hex());
        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                debug!("Committed snapshot {key}");
                Ok(())
            }
            Err(_) if target.is_dir() => {
                debug!("Snapshot {key} already committed, discarding ours");
                Ok(())
            }
            Err(e) => Err(io_error(format!("committing snapshot {key}"))(e)),
        }
    }
}
