//! Error types for loading image archives.
//!
//! Every fatal condition of a load surfaces as one [`Error`].  The first fatal error aborts the
//! whole invocation; nothing is retried and nothing is aggregated.  Non-fatal conditions (an index
//! without any child for the requested platform) are not errors, see
//! [`crate::platform::PlatformUnmatched`].

use std::io;

use crate::{digest::DigestError, store::StoreError};

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream is not a recognizable Docker v1.2 or OCI v1.0 archive.
    #[error("invalid image archive: {0}")]
    ArchiveFormat(String),

    /// Registering or reading a blob in the content store failed.
    #[error("content store: {0}")]
    ContentStore(#[from] StoreError),

    /// Extracting the layer chain of an image failed.
    #[error("failed to unpack {image}: {reason}")]
    Unpack { image: String, reason: String },

    /// Reading the input stream failed.
    #[error("reading archive: {0}")]
    Io(#[from] io::Error),

    /// Writing status lines failed.
    #[error("writing output: {0}")]
    Output(#[source] io::Error),

    #[error("snapshotter {0:?} is not available")]
    UnknownSnapshotter(String),

    #[error("invalid platform {0:?}: {1}")]
    InvalidPlatform(String, String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        Self::ArchiveFormat(message.into())
    }

    pub(crate) fn unpack(image: &str, reason: impl ToString) -> Self {
        Self::Unpack {
            image: image.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<DigestError> for Error {
    fn from(err: DigestError) -> Self {
        Self::ArchiveFormat(err.to_string())
    }
}
