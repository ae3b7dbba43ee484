//! Builds the local tree from the remote project listing.
//!
//! A build describes the project (modification time and folders), creates
//! one directory per folder, then pages through every data object and
//! inserts a file node for it. The result replaces the served tree in one
//! swap. Later cycles only look at the project modification time and
//! rebuild when it moved.

use super::fs::ProjectFs;
use super::node::{EXEC_MODE, FILE_MODE, Node, is_reserved_name, sanitize_name};
use super::tree::Tree;
use crate::error::FsResult;
use crate::remote::{ObjectClass, ObjectDescription, ms_to_secs};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MirrorState {
    Uninitialized = 0,
    Populating = 1,
    Ready = 2,
    Refreshing = 3,
}

impl MirrorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MirrorState::Populating,
            2 => MirrorState::Ready,
            3 => MirrorState::Refreshing,
            _ => MirrorState::Uninitialized,
        }
    }
}

/// Counters from the last completed build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub folders: usize,
    pub objects: usize,
    /// Latest object creation time seen, remote milliseconds.
    pub max_created: i64,
    /// Project modification time the build was taken at.
    pub remote_modified: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Rebuilt(MirrorStats),
    Unchanged,
}

pub(super) struct MirrorStatus {
    state: AtomicU8,
    last_modified: AtomicI64,
    stats: ArcSwap<MirrorStats>,
}

impl MirrorStatus {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicU8::new(MirrorState::Uninitialized as u8),
            last_modified: AtomicI64::new(i64::MIN),
            stats: ArcSwap::from_pointee(MirrorStats::default()),
        }
    }

    fn state(&self) -> MirrorState {
        MirrorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: MirrorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn has_built(&self) -> bool {
        matches!(self.state(), MirrorState::Ready | MirrorState::Refreshing)
    }
}

/// Shorter paths first, then lexicographic, so parents precede children.
pub fn sort_folders(folders: &mut [String]) {
    folders.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
}

/// Folder path with every segment sanitized. `.` and `..` segments get a
/// `(folder)` suffix so they stay reachable.
fn local_folder(folder: &str) -> String {
    let parts: Vec<String> = folder
        .split('/')
        .map(sanitize_name)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if is_reserved_name(&s) {
                format!("{s} (folder)")
            } else {
                s
            }
        })
        .collect();
    format!("/{}", parts.join("/"))
}

fn is_pipeline(desc: &ObjectDescription) -> bool {
    desc.live
        .types
        .iter()
        .chain(desc.live.tags.iter())
        .any(|t| t == "pipeline")
}

/// Applets and pipeline records are executable.
pub fn object_mode(desc: &ObjectDescription) -> u32 {
    match desc.class {
        ObjectClass::Applet => EXEC_MODE,
        ObjectClass::Record if is_pipeline(desc) => EXEC_MODE,
        _ => FILE_MODE,
    }
}

/// Size reported before the content is read. Tables render larger than
/// the size the remote reports, so their estimate is doubled.
pub fn estimated_size(desc: &ObjectDescription) -> u64 {
    let reported = desc.live.size.unwrap_or(0);
    match desc.class {
        ObjectClass::Table => reported.saturating_mul(2),
        ObjectClass::Applet => serde_json::to_vec(desc).map_or(0, |v| v.len() as u64),
        ObjectClass::File | ObjectClass::Record => reported,
    }
}

impl ProjectFs {
    pub fn state(&self) -> MirrorState {
        self.mirror.state()
    }

    pub fn stats(&self) -> MirrorStats {
        self.mirror.stats.load().as_ref().clone()
    }

    /// Rebuilds the tree when the project changed since the last build. The
    /// first successful call opens the gate.
    pub async fn refresh(&self) -> FsResult<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        let built = self.mirror.has_built();
        if built {
            let modified = self.project.describe(false).await?.modified;
            if modified <= self.mirror.last_modified.load(Ordering::Acquire) {
                debug!(project = self.project.id(), modified, "project unchanged");
                return Ok(RefreshOutcome::Unchanged);
            }
        }

        self.mirror.set(if built {
            MirrorState::Refreshing
        } else {
            MirrorState::Populating
        });
        let result = self.rebuild().await;
        self.mirror.set(if built || result.is_ok() {
            MirrorState::Ready
        } else {
            MirrorState::Uninitialized
        });

        let stats = result?;
        self.mirror
            .last_modified
            .store(stats.remote_modified, Ordering::Release);
        self.mirror.stats.store(Arc::new(stats.clone()));
        if self.gate.open() {
            info!(project = self.project.id(), "initial mirror ready");
        }
        Ok(RefreshOutcome::Rebuilt(stats))
    }

    async fn rebuild(&self) -> FsResult<MirrorStats> {
        let project = self.project.describe(true).await?;
        let mut stats = MirrorStats {
            remote_modified: project.modified,
            ..MirrorStats::default()
        };

        let root = self
            .owned_dir("")
            .with_times(ms_to_secs(project.modified), ms_to_secs(project.modified));
        let mut tree = {
            let current = self.tree.load_full();
            let old = current.lock().await;
            old.successor(root)
        };

        let mut folders = project.folders;
        sort_folders(&mut folders);
        for folder in &folders {
            let path = local_folder(folder);
            if path == "/" {
                continue;
            }
            tree.mkdir_p(&path, |name| self.owned_dir(name))?;
            stats.folders += 1;
        }

        let mut cursor = None;
        loop {
            let page = self.project.find_data_objects(cursor).await?;
            for desc in page.objects {
                self.insert_object(&mut tree, desc, &mut stats);
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        tree.finish_build();

        self.tree.store(Arc::new(Mutex::new(tree)));
        Ok(stats)
    }

    fn owned_dir(&self, name: &str) -> Node {
        Node::dir(name).with_owner(self.config.uid, self.config.gid)
    }

    fn insert_object(&self, tree: &mut Tree, desc: ObjectDescription, stats: &mut MirrorStats) {
        let folder = local_folder(&desc.live.folder);
        let parent = match tree.mkdir_p(&folder, |name| self.owned_dir(name)) {
            Ok(ino) => ino,
            Err(e) => {
                warn!(id = %desc.id, %folder, error = %e, "skipping object");
                return;
            }
        };
        let name = sanitize_name(&desc.live.name);
        let name = if name.is_empty() {
            desc.id.clone()
        } else if is_reserved_name(&name) || tree.child_of(parent, &name).is_some() {
            format!("{name} ({})", desc.id)
        } else {
            name
        };

        stats.max_created = stats.max_created.max(desc.created);
        let node = Node::remote_file(name, desc.id.clone())
            .with_mode(object_mode(&desc))
            .with_owner(self.config.uid, self.config.gid)
            .with_size(estimated_size(&desc))
            .with_times(ms_to_secs(desc.created), ms_to_secs(desc.live.modified));
        let id = desc.id.clone();
        match tree.insert(parent, node.with_description(desc)) {
            Ok(_) => stats.objects += 1,
            Err(e) => warn!(%id, %folder, error = %e, "skipping object"),
        }
    }
}

/// Runs `refresh` forever, pausing `refresh_interval` after every cycle.
pub fn spawn_refresher(fs: Arc<ProjectFs>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match fs.refresh().await {
                Ok(RefreshOutcome::Rebuilt(stats)) => info!(
                    project = fs.project_id(),
                    folders = stats.folders,
                    objects = stats.objects,
                    max_created = stats.max_created,
                    modified = stats.remote_modified,
                    "mirror rebuilt"
                ),
                Ok(RefreshOutcome::Unchanged) => {}
                Err(e) => warn!(project = fs.project_id(), error = %e, "mirror refresh failed"),
            }
            tokio::time::sleep(fs.config().refresh_interval).await;
        }
    })
}
