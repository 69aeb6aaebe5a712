use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;

use repofs::api::{ClientPool, IoClient};
use repofs::cache::{CacheStore, Housekeeper, LiveUuids};
use repofs::fuse::{RefTable, RemoteBackend, RepoFs};
use repofs::MountConfig;

/// Mount a remote content repository as a local filesystem.
#[derive(Parser, Debug)]
#[command(name = "repofs", version, about)]
struct Cli {
    /// Local directory to mount on
    mountpoint: PathBuf,

    #[command(flatten)]
    config: MountConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "mount failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.config;

    let pool = Arc::new(ClientPool::new(config.pool_max, config.timeout()));
    let client = Arc::new(IoClient::new(&config, pool));
    let store = Arc::new(CacheStore::new(config.cache_dir())?);
    let backend = Arc::new(RemoteBackend::new(Arc::clone(&client), Arc::clone(&store)));
    let refs = Arc::new(RefTable::new(backend));

    let housekeeper = Housekeeper::spawn(
        config.housekeeping_interval(),
        config.cache_retention(),
        Arc::clone(&store),
        Arc::clone(&refs) as Arc<dyn LiveUuids>,
    );

    tracing::info!(
        endpoint = %config.endpoint(),
        base = %config.mount_base,
        mountpoint = %cli.mountpoint.display(),
        "mounting"
    );

    let fs = RepoFs::new(client, refs);
    let options = [
        MountOption::FSName("repofs".to_string()),
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::DefaultPermissions,
    ];
    // blocks until the filesystem is unmounted
    fuser::mount2(fs, &cli.mountpoint, &options)?;

    housekeeper.stop();
    tracing::info!("unmounted");
    Ok(())
}
