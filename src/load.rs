//! The whole load: import the archive, then unpack every resolved image in order.

use std::io::{Read, Write};

use log::info;

use crate::{
    archive::Importer,
    cancel::CancellationToken,
    error::Result,
    platform::{PlatformMode, PlatformUnmatched},
    reference::{DigestRefPolicy, DigestTranslator},
    snapshot::{self, Snapshotters},
    status::StatusReporter,
    store::{check_namespace, ContentStore, ImageStore},
    unpack::{UnpackResult, Unpacker},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Namespace the image records are registered in.
    pub namespace: String,
    /// Name of the snapshotter to unpack with.  Also the namespace of digest-derived names.
    pub snapshotter: String,
    pub platforms: PlatformMode,
    pub digest_refs: DigestRefPolicy,
    /// Print only the digest of each unpacked image.
    pub quiet: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            snapshotter: snapshot::NativeSnapshotter::NAME.to_string(),
            platforms: PlatformMode::Default,
            digest_refs: DigestRefPolicy::KeepIfNamed,
            quiet: false,
        }
    }
}

/// The collaborators a load works with.
pub struct LoadContext<'a> {
    pub store: &'a dyn ContentStore,
    pub images: &'a dyn ImageStore,
    pub snapshotters: &'a Snapshotters,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub unpacked: Vec<UnpackResult>,
    pub warnings: Vec<PlatformUnmatched>,
}

/// Load the archive in `input`, writing status lines to `out`.
///
/// Stops at the first error.  Status lines of images unpacked before that stay written.
pub fn load_image(
    input: impl Read,
    options: &LoadOptions,
    context: &LoadContext<'_>,
    out: impl Write,
) -> Result<LoadSummary> {
    // an unknown snapshotter should fail before the stream is consumed
    context.snapshotters.get(&options.snapshotter)?;
    check_namespace(&options.namespace)?;

    let outcome = Importer::new(context.store, context.images)
        .namespace(options.namespace.as_str())
        .translator(DigestTranslator::new(
            options.snapshotter.as_str(),
            options.digest_refs,
        ))
        .platforms(options.platforms.clone())
        .cancel(context.cancel.clone())
        .import(input)?;
    info!("Importing resolved {} image(s)", outcome.images.len());

    let unpacker =
        Unpacker::new(context.store, context.snapshotters).cancel(context.cancel.clone());
    let mut reporter = StatusReporter::new(out, options.quiet);

    let mut unpacked = Vec::with_capacity(outcome.images.len());
    for image in &outcome.images {
        unpacked.push(unpacker.unpack(image, &options.snapshotter, &mut reporter)?);
    }

    Ok(LoadSummary {
        unpacked,
        warnings: outcome.warnings,
    })
}
