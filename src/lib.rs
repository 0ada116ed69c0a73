//! Loading Docker and OCI image archives into a content store and unpacking them into snapshots.
//!
//! The entry point is [`load_image`].  The pieces it is built from are usable on their own:
//! [`archive::Importer`] decodes an archive, [`unpack::Unpacker`] materializes one image and
//! [`status::StatusReporter`] prints the progress lines.

#![forbid(unsafe_code)]

pub mod archive;
pub mod cancel;
pub mod compression;
pub mod digest;
pub mod error;
pub mod load;
pub mod platform;
pub mod reference;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod unpack;

pub use cancel::CancellationToken;
pub use digest::Digest;
pub use error::{Error, Result};
pub use load::{load_image, LoadContext, LoadOptions, LoadSummary};
