//! Process entry point: loads configuration, wires a `CachingTree` to a
//! local content root and a remote HTTP DAM, starts the background
//! `RqProcessor`, and mounts the result as a FUSE filesystem.
//!
//! FUSE stands in for the "local file share" surface named in the
//! specification this crate implements; the SMB2 wire dispatch lives in
//! `damshare-smb` and is exercised independently of the mount path here.

mod attr_cache;
mod filesystem;

use std::path::PathBuf;

use clap::Parser;
use damshare_core::config::ShareConfig;
use damshare_core::Share;
use damshare_localtree::FsLocalTree;
use damshare_remotetree::HttpRemoteTree;
use fuser::MountOption;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filesystem::FsWrapper;

#[derive(Parser, Debug)]
#[command(name = "damshare", about = "Mount a remote DAM repository as a local write-back cached share")]
struct Args {
    /// Local directory to mount the share at.
    mountpoint: PathBuf,

    /// Base URL of the remote DAM HTTP endpoint.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    remote_url: String,

    /// Local directory used to stage cached file content and metadata.
    #[arg(long, default_value = "./cache")]
    cache_dir: PathBuf,

    /// Path to the request-queue's persistence log.
    #[arg(long, default_value = "./cache/rq.log")]
    rq_log: PathBuf,

    /// Path to a TOML config file; falls back to defaults when absent.
    #[arg(long, default_value = "damshare.toml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "damshare_cli=info,damshare_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ShareConfig::load(&args.config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let local = std::sync::Arc::new(
        FsLocalTree::new(args.cache_dir.clone()).expect("failed to initialize local cache root"),
    );
    let remote = std::sync::Arc::new(HttpRemoteTree::new(
        args.remote_url.clone(),
        std::time::Duration::from_millis(config.remote_timeout_ms),
    ));
    let share = Share::new(config, local, remote, args.rq_log.clone()).expect("failed to construct share");
    let _guard = runtime.enter();
    share.start();

    let filesystem = FsWrapper::new(share, runtime);
    let options = vec![MountOption::AutoUnmount, MountOption::FSName("damshare".to_string())];

    tracing::info!(mountpoint = %args.mountpoint.display(), "mounting share");
    if let Err(e) = fuser::mount2(filesystem, &args.mountpoint, &options) {
        tracing::error!("failed to mount filesystem: {e}");
        std::process::exit(1);
    }
}
