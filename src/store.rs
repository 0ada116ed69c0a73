//! Content-addressable blob storage and image records.
//!
//! The loader only needs a narrow view of the storage engine: put a blob under its digest, ask
//! whether a digest is present, and read a blob back.  [`ContentStore`] captures that view.
//! [`ImageStore`] holds the name → target records that make loaded images addressable.
//!
//! Two implementations are provided: [`MemoryStore`] (useful for tests and dry runs) and
//! [`DirStore`], which keeps everything below a directory:
//!
//! ```text
//! root/
//! ├── blobs/sha256/<hex>           # Content-addressed blobs
//! ├── ingest/                      # In-flight writes, renamed into blobs/ once verified
//! └── images/<namespace>/<id>.json # Image records, <id> is the sha256 of the image name
//! ```
//!
//! Writes are idempotent: putting identical content under the same digest again succeeds and
//! stores nothing new.  Every write is verified against the digest it is stored under.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::digest::{Digest, Digester};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob {0} not found")]
    NotFound(Digest),

    #[error("content does not match digest: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// Reading the content handed to [`ContentStore::put`] failed.  This is the caller's stream
    /// failing, not the store.
    #[error("reading content for {digest}: {source}")]
    Source {
        digest: Digest,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),

    #[error("image record {name:?}: {source}")]
    Record {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

/// What a name points at: the same triple as an OCI descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// A named image, as registered after a successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub target: Descriptor,
}

/// Blob storage keyed by digest.
pub trait ContentStore: Send + Sync {
    /// Store everything `reader` yields under `digest`, returning the number of bytes.
    ///
    /// The content is verified: if it does not hash to `digest` nothing is stored and
    /// [`StoreError::DigestMismatch`] is returned.  Putting content that is already present
    /// succeeds.
    fn put(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64, StoreError>;

    fn has(&self, digest: &Digest) -> Result<bool, StoreError>;

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send + '_>, StoreError>;

    /// Read a whole blob into memory.  Meant for manifests and configs, not layers.
    fn read(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut data = vec![];
        self.open(digest)?
            .read_to_end(&mut data)
            .map_err(io_error(format!("reading blob {digest}")))?;
        Ok(data)
    }
}

/// Name → target records, partitioned by namespace.
pub trait ImageStore: Send + Sync {
    /// Create or replace the record for `record.name`.
    fn put_image(&self, namespace: &str, record: &ImageRecord) -> Result<(), StoreError>;

    fn get_image(&self, namespace: &str, name: &str) -> Result<Option<ImageRecord>, StoreError>;

    /// All records of a namespace, sorted by name.
    fn list_images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError>;
}

/// Copy `reader` to `writer` while hashing, keeping read failures apart from write failures.
fn copy_hashing(
    digest: &Digest,
    reader: &mut dyn Read,
    writer: &mut impl Write,
) -> Result<(Digest, u64), StoreError> {
    let mut digester = Digester::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(StoreError::Source {
                    digest: *digest,
                    source,
                })
            }
        };
        digester.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(io_error(format!("writing blob {digest}")))?;
    }
    let len = digester.len();
    Ok((digester.finish(), len))
}

fn verify(expected: &Digest, actual: Digest) -> Result<(), StoreError> {
    if actual == *expected {
        Ok(())
    } else {
        Err(StoreError::DigestMismatch {
            expected: *expected,
            actual,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A store that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<Digest, Arc<[u8]>>>,
    images: Mutex<BTreeMap<(String, String), ImageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.blobs).is_empty()
    }
}

impl ContentStore for MemoryStore {
    fn put(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let mut data = vec![];
        let (actual, size) = copy_hashing(digest, reader, &mut data)?;
        verify(digest, actual)?;
        lock(&self.blobs).entry(*digest).or_insert_with(|| data.into());
        Ok(size)
    }

    fn has(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(lock(&self.blobs).contains_key(digest))
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send + '_>, StoreError> {
        let data = lock(&self.blobs)
            .get(digest)
            .cloned()
            .ok_or(StoreError::NotFound(*digest))?;
        Ok(Box::new(io::Cursor::new(data)))
    }
}

impl ImageStore for MemoryStore {
    fn put_image(&self, namespace: &str, record: &ImageRecord) -> Result<(), StoreError> {
        lock(&self.images).insert(
            (namespace.to_string(), record.name.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn get_image(&self, namespace: &str, name: &str) -> Result<Option<ImageRecord>, StoreError> {
        Ok(lock(&self.images)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn list_images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(lock(&self.images)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// Namespaces name a single directory level of the image store.
pub fn check_namespace(namespace: &str) -> Result<(), StoreError> {
    if namespace.is_empty() || namespace == "." || namespace == ".." || namespace.contains('/') {
        return Err(StoreError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

/// A store kept in a directory on disk.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open the store at `root`, creating its directory structure as needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for sub in ["blobs/sha256", "ingest", "images"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(io_error(format!("creating {}", dir.display())))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        check_namespace(namespace)?;
        Ok(self.root.join("images").join(namespace))
    }

    fn record_path(&self, namespace: &str, name: &str) -> Result<PathBuf, StoreError> {
        let id = Digest::of(name.as_bytes()).hex();
        Ok(self.namespace_dir(namespace)?.join(format!("{id}.json")))
    }
}

impl ContentStore for DirStore {
    fn put(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let mut tmp = NamedTempFile::new_in(self.root.join("ingest"))
            .map_err(io_error("creating ingest file"))?;
        let (actual, size) = copy_hashing(digest, reader, tmp.as_file_mut())?;
        verify(digest, actual)?;

        let path = self.blob_path(digest);
        if path.exists() {
            trace!("Already have blob {digest}");
            return Ok(size);
        }
        // Identical content under the same name, so losing a race to another writer is harmless.
        tmp.persist(&path)
            .map_err(|e| e.error)
            .map_err(io_error(format!("committing blob {digest}")))?;
        debug!("Stored blob {digest} ({size} bytes)");
        Ok(size)
    }

    fn has(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.blob_path(digest).is_file())
    }

    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send + '_>, StoreError> {
        match File::open(self.blob_path(digest)) {
            Ok(file) => Ok(Box::new(io::BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*digest)),
            Err(e) => Err(io_error(format!("opening blob {digest}"))(e)),
        }
    }
}

impl ImageStore for DirStore {
    fn put_image(&self, namespace: &str, record: &ImageRecord) -> Result<(), StoreError> {
        let dir = self.namespace_dir(namespace)?;
        fs::create_dir_all(&dir).map_err(io_error(format!("creating {}", dir.display())))?;

        let json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Record {
            name: record.name.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_error("creating image record"))?;
        tmp.write_all(&json)
            .map_err(io_error("writing image record"))?;
        tmp.persist(self.record_path(namespace, &record.name)?)
            .map_err(|e| e.error)
            .map_err(io_error(format!("committing image record {}", record.name)))?;
        Ok(())
    }

    fn get_image(&self, namespace: &str, name: &str) -> Result<Option<ImageRecord>, StoreError> {
        let path = self.record_path(namespace, name)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(format!("reading {}", path.display()))(e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StoreError::Record {
                name: name.to_string(),
                source,
            })
    }

    fn list_images(&self, namespace: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_error(format!("listing {}", dir.display()))(e)),
        };

        let mut records = vec![];
        for entry in entries {
            let path = entry
                .map_err(io_error(format!("listing {}", dir.display())))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let data = fs::read(&path).map_err(io_error(format!("reading {}", path.display())))?;
            let record: ImageRecord =
                serde_json::from_slice(&data).map_err(|source| StoreError::Record {
                    name: path.display().to_string(),
                    source,
                })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
