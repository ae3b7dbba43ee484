use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;
use projectfs::config::{MountConfig, validate_project_id};
use projectfs::fuse::mount::MountService;
use projectfs::remote::memory::MemoryRemote;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "projectfs")]
#[command(about = "Mount a remote project as a local filesystem", long_about = None)]
struct Args {
    /// Empty directory to mount the project on
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// project-xxxx or container-xxxx
    #[arg(long, value_parser = parse_project_id)]
    project_id: String,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(long)]
    foreground: bool,

    /// Seconds between two checks of the remote project
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    refresh_interval: u64,

    /// JSON manifest seeding the in-memory remote
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,
}

fn parse_project_id(s: &str) -> Result<String, String> {
    validate_project_id(s).map_err(|e| e.to_string())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = MountConfig::new(&args.project_id)?
        .with_refresh_interval(Duration::from_secs(args.refresh_interval))?
        .with_debug(args.debug);
    init_tracing(config.debug);

    let remote = match &args.manifest {
        Some(path) => MemoryRemote::from_manifest(path)?,
        None => {
            let remote = MemoryRemote::new();
            remote.add_project(&config.project_id, &config.project_id);
            remote
        }
    };

    std::fs::create_dir_all(&args.mountpoint)
        .with_context(|| format!("create mount point {}", args.mountpoint.display()))?;
    // The daemon runs from `/`.
    let mountpoint = args.mountpoint.canonicalize()?;

    if !args.foreground {
        let time_stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let dir = std::env::temp_dir();
        let out = File::create(dir.join(format!("projectfs_{time_stamp}.out")))?;
        let err = File::create(dir.join(format!("projectfs_{time_stamp}.err")))?;
        let pid = dir.join(format!("projectfs_{time_stamp}.pid"));
        let daemonize = Daemonize::new().pid_file(pid).stdout(out).stderr(err);
        daemonize.start()?;
    }

    // Built after daemonizing; worker threads do not survive a fork.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        info!(project = %config.project_id, mountpoint = %mountpoint.display(), "starting");
        let service = MountService::start(Arc::new(remote), config, &mountpoint).await?;
        service.run().await?;
        Ok(())
    })
}
