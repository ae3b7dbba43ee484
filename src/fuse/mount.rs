//! Mount helpers and the mount lifecycle
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we mount unprivileged via fusermount3.
//! - `MountService` owns everything a mount needs (dispatcher, refresher task,
//!   kernel session) and tears it all down together.

use std::path::Path;
use std::sync::Arc;

use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;
use tokio::task::JoinHandle;
use tracing::info;

use super::FuseFs;
use crate::config::MountConfig;
use crate::error::MountError;
use crate::remote::RemoteApi;
use crate::vfs::{ProjectFs, spawn_refresher};

/// Mount options derived from the configuration.
pub fn mount_options(config: &MountConfig) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name(config.fs_name.clone());
    mo.uid(config.uid);
    mo.gid(config.gid);
    // Plain readdir is enough; the kernel looks entries up on demand.
    mo.force_readdir_plus(false);
    mo
}

/// Mounts `fs` on an empty directory using unprivileged mode.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: FuseFs,
    mount_point: impl AsRef<Path>,
    opts: MountOptions,
) -> std::io::Result<MountHandle> {
    let session = rfuse3::raw::Session::new(opts);
    // Requires fusermount3 in PATH
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: FuseFs,
    _mount_point: impl AsRef<Path>,
    _opts: MountOptions,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

/// A live mount: the dispatcher, its refresher and the kernel session.
pub struct MountService {
    fs: Arc<ProjectFs>,
    refresher: JoinHandle<()>,
    handle: MountHandle,
}

impl MountService {
    /// Resolves the project, starts the refresher and mounts. Requests that
    /// arrive before the first build wait for it.
    pub async fn start(
        remote: Arc<dyn RemoteApi>,
        config: MountConfig,
        mount_point: impl AsRef<Path>,
    ) -> Result<Self, MountError> {
        let mount_point = mount_point.as_ref();
        let opts = mount_options(&config);
        let fs = Arc::new(ProjectFs::new(remote, config).await?);
        let refresher = spawn_refresher(fs.clone());
        let handle = match mount_unprivileged(FuseFs::new(fs.clone()), mount_point, opts).await {
            Ok(h) => h,
            Err(e) => {
                refresher.abort();
                return Err(e.into());
            }
        };
        info!(
            project = fs.project_id(),
            mount_point = %mount_point.display(),
            "mounted"
        );
        Ok(Self {
            fs,
            refresher,
            handle,
        })
    }

    /// Serves until the filesystem is unmounted externally or Ctrl+C arrives.
    pub async fn run(self) -> Result<(), MountError> {
        let Self {
            fs,
            refresher,
            mut handle,
        } = self;
        let finished = tokio::select! {
            res = &mut handle => Some(res),
            _ = tokio::signal::ctrl_c() => None,
        };
        let result = match finished {
            Some(res) => {
                info!(project = fs.project_id(), "unmounted");
                res
            }
            None => {
                info!(project = fs.project_id(), "interrupted, unmounting");
                handle.unmount().await
            }
        };
        refresher.abort();
        result.map_err(MountError::from)
    }

    /// Stops the refresher and unmounts.
    pub async fn shutdown(self) -> Result<(), MountError> {
        self.refresher.abort();
        self.handle.unmount().await?;
        info!(project = self.fs.project_id(), "unmounted");
        Ok(())
    }
}
