use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use ociload::{
    load_image,
    platform::{Platform, PlatformMode},
    reference::DigestRefPolicy,
    snapshot::{NativeSnapshotter, Snapshotters},
    store::{DirStore, ImageStore},
    CancellationToken, LoadContext, LoadOptions, LoadSummary,
};

/// ociload
#[derive(Debug, Parser)]
#[clap(name = "ociload", version)]
pub struct App {
    /// State directory holding content, image records and snapshots
    #[clap(long, env = "OCILOAD_ROOT")]
    root: Option<PathBuf>,
    /// Namespace image records are registered in
    #[clap(long, env = "OCILOAD_NAMESPACE", default_value = "default")]
    namespace: String,
    /// Snapshotter to unpack images with
    #[clap(long, env = "OCILOAD_SNAPSHOTTER", default_value = NativeSnapshotter::NAME)]
    snapshotter: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Read from a tar archive file instead of standard input
    #[clap(long, short)]
    input: Option<PathBuf>,
    /// Import and unpack the content of every platform
    #[clap(long, conflicts_with = "platforms")]
    all_platforms: bool,
    /// Import and unpack content for specific platform(s), e.g. linux/arm64
    #[clap(long = "platform", id = "platforms", value_delimiter = ',')]
    platforms: Vec<Platform>,
    /// Only print the digest of each unpacked image
    #[clap(long, short)]
    quiet: bool,
}

impl LoadArgs {
    fn platform_mode(&self) -> PlatformMode {
        if self.all_platforms {
            PlatformMode::All
        } else if self.platforms.is_empty() {
            PlatformMode::Default
        } else {
            PlatformMode::Only(self.platforms.clone())
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load an image archive created by `docker save` or an OCI image layout tarball
    Load(LoadArgs),
    /// List the images in the namespace
    Images,
}

fn default_root() -> Result<PathBuf> {
    if rustix::process::getuid().is_root() {
        return Ok(PathBuf::from("/var/lib/ociload"));
    }
    let data = match std::env::var_os("XDG_DATA_HOME") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(std::env::var_os("HOME").context("$HOME is not set")?)
            .join(".local/share"),
    };
    Ok(data.join("ociload"))
}

fn run_load(
    root: PathBuf,
    options: LoadOptions,
    input: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<LoadSummary> {
    let store = DirStore::open(&root)
        .with_context(|| format!("opening content store in {}", root.display()))?;
    let snapshotters = Snapshotters::new().with(
        NativeSnapshotter::open(&root)
            .with_context(|| format!("opening snapshots in {}", root.display()))?,
    );
    let context = LoadContext {
        store: &store,
        images: &store,
        snapshotters: &snapshotters,
        cancel,
    };

    let stream: Box<dyn Read> = match &input {
        Some(path) => {
            Box::new(File::open(path).with_context(|| format!("opening {}", path.display()))?)
        }
        None => Box::new(io::stdin().lock()),
    };
    Ok(load_image(stream, &options, &context, io::stdout().lock())?)
}

async fn load(
    root: PathBuf,
    namespace: String,
    snapshotter: String,
    args: LoadArgs,
) -> Result<()> {
    let options = LoadOptions {
        namespace,
        snapshotter,
        platforms: args.platform_mode(),
        digest_refs: DigestRefPolicy::KeepIfNamed,
        quiet: args.quiet,
    };

    let cancel = CancellationToken::new();
    let mut worker = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || run_load(root, options, args.input, cancel)
    });

    let summary = tokio::select! {
        result = &mut worker => result??,
        Ok(()) = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, cancelling the load");
            cancel.cancel();
            worker.await??
        }
    };

    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn images(root: PathBuf, namespace: &str) -> Result<()> {
    let store = DirStore::open(&root)
        .with_context(|| format!("opening content store in {}", root.display()))?;
    for record in store.list_images(namespace)? {
        println!("{}\t{}", record.name, record.target.digest);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let root = match args.root {
        Some(root) => root,
        None => default_root()?,
    };

    match args.cmd {
        Command::Load(load_args) => load(root, args.namespace, args.snapshotter, load_args).await,
        Command::Images => images(root, &args.namespace),
    }
}
