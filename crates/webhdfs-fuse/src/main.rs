#![warn(missing_docs)]
//! WebHDFS FUSE mount daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use webhdfs_fuse::cache::{MetadataCache, SystemClock};
use webhdfs_fuse::config::MountConfig;
use webhdfs_fuse::filesystem::WebHdfsFilesystem;
use webhdfs_fuse::idmap::IdMapper;
use webhdfs_fuse::mount::{options_to_fuser, parse_mount_options, validate_mountpoint};
use webhdfs_fuse::{Dispatcher, RestTransport};

#[derive(Parser)]
#[command(name = "webhdfs-mount")]
#[command(about = "Mount an HDFS namespace over WebHDFS", long_about = None)]
struct Cli {
    /// Local directory to mount on.
    mountpoint: PathBuf,

    /// NameNode host; overrides the config file.
    #[arg(long)]
    namenode: Option<String>,

    /// NameNode HTTP port; overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// `.toml` or `.json` configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebHDFS `user.name`.
    #[arg(short, long, env = "HADOOP_USER_NAME")]
    user: Option<String>,

    /// Talk to the NameNode over HTTPS.
    #[arg(long)]
    https: bool,

    /// Attribute cache TTL in milliseconds.
    #[arg(long)]
    cache_ttl_ms: Option<u64>,

    /// Comma-separated mount options (allow_other, ro, fsname=..., kernel_ttl_ms=...).
    #[arg(short = 'o', long = "options")]
    options: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    debug: bool,
}

fn load_config(cli: &Cli) -> Result<MountConfig> {
    let mut config = match &cli.config {
        Some(path) => MountConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MountConfig::default(),
    };
    if let Some(host) = &cli.namenode {
        config.namenode_host = host.clone();
    }
    if let Some(port) = cli.port {
        config.namenode_port = port;
    }
    if cli.user.is_some() {
        config.user = cli.user.clone();
    }
    if cli.https {
        config.use_https = true;
    }
    if let Some(ttl) = cli.cache_ttl_ms {
        config.cache.ttl_ms = ttl;
    }
    if let Some(opts) = &cli.options {
        config.mount = parse_mount_options(opts, config.mount.clone())?;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = load_config(&cli)?;
    validate_mountpoint(&cli.mountpoint)?;

    tracing::info!(
        "mounting {} on {}",
        config.transport_config().base_url(),
        cli.mountpoint.display()
    );

    let transport = RestTransport::new(&config.transport_config())?;
    let cache = MetadataCache::new(&config.cache, Arc::new(SystemClock));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(transport),
        cache,
        config.io.clone(),
        config.effective_user(),
    ));
    let fs = WebHdfsFilesystem::new(
        dispatcher,
        IdMapper::new(config.idmap.clone()),
        config.features.clone(),
        config.mount.kernel_ttl(),
    );

    fuser::mount2(fs, &cli.mountpoint, &options_to_fuser(&config.mount))
        .with_context(|| format!("mount on {} failed", cli.mountpoint.display()))?;

    tracing::info!("unmounted {}", cli.mountpoint.display());
    Ok(())
}
