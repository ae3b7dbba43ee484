//! Path-based operation dispatcher over the mirrored project tree.
//!
//! Every operation except `statfs` waits for the first mirror build, then
//! takes the current tree snapshot and holds its lock for the whole call,
//! remote round trips included. A refresh swaps in a new snapshot; calls
//! already running finish against the one they loaded.

use super::gate::InitGate;
use super::mirror::MirrorStatus;
use super::node::{DirEntry, FileAttr, FileType, Node, now_secs};
use super::tree::{Tree, join_path, normalize, split_path};
use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use crate::remote::{RemoteApi, RemoteProject};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Capacity numbers reported by `statfs`. The remote has no notion of free space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

const PLACEHOLDER_STATS: FsStats = FsStats {
    blocks: 1 << 30,
    bfree: 1 << 29,
    bavail: 1 << 29,
    files: 1 << 20,
    ffree: 1 << 19,
    bsize: 4096,
    namelen: 255,
};

/// Extended attributes with a remote side effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RemoteXattr {
    Tag,
    Property,
    State,
}

fn remote_xattr(name: &str) -> Option<RemoteXattr> {
    match name.strip_prefix("user.").unwrap_or(name) {
        "tag" => Some(RemoteXattr::Tag),
        "property" => Some(RemoteXattr::Property),
        "state" => Some(RemoteXattr::State),
        _ => None,
    }
}

fn resolve(t: &Tree, path: &str) -> FsResult<u64> {
    t.lookup(path)
        .ok_or_else(|| FsError::NotFound(path.to_string()))
}

fn resolve_dir(t: &Tree, path: &str) -> FsResult<u64> {
    let ino = resolve(t, path)?;
    if !node(t, ino)?.is_dir() {
        return Err(FsError::NotADirectory(path.to_string()));
    }
    Ok(ino)
}

fn node(t: &Tree, ino: u64) -> FsResult<&Node> {
    t.get(ino)
        .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
}

fn node_mut(t: &mut Tree, ino: u64) -> FsResult<&mut Node> {
    t.get_mut(ino)
        .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
}

/// Parent (inode, path) and name for a new entry at `path`; the name must be free.
fn vacant(t: &Tree, path: &str) -> FsResult<(u64, String, String)> {
    let (parent_path, name) = split_path(path);
    if name.is_empty() {
        return Err(FsError::AlreadyExists(path.to_string()));
    }
    let parent = resolve_dir(t, &parent_path)?;
    if t.child_of(parent, &name).is_some() {
        return Err(FsError::AlreadyExists(path.to_string()));
    }
    Ok((parent, parent_path, name))
}

fn touch_dir(t: &mut Tree, ino: u64) {
    if let Some(dir) = t.get_mut(ino) {
        dir.touch();
    }
}

pub struct ProjectFs {
    pub(super) remote: Arc<dyn RemoteApi>,
    pub(super) project: Arc<dyn RemoteProject>,
    pub(super) config: MountConfig,
    pub(super) tree: ArcSwap<Mutex<Tree>>,
    pub(super) gate: InitGate,
    pub(super) mirror: MirrorStatus,
    pub(super) refresh_lock: Mutex<()>,
}

impl ProjectFs {
    /// Resolves the project handle. The tree stays empty and the gate closed
    /// until the first `refresh`.
    pub async fn new(remote: Arc<dyn RemoteApi>, config: MountConfig) -> FsResult<Self> {
        let project = remote.project(&config.project_id).await?;
        let root = Node::dir("").with_owner(config.uid, config.gid);
        Ok(Self {
            remote,
            project,
            tree: ArcSwap::from_pointee(Mutex::new(Tree::new(root))),
            gate: InitGate::new(),
            mirror: MirrorStatus::new(),
            refresh_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn project_id(&self) -> &str {
        self.project.id()
    }

    /// Tree snapshot currently served.
    pub fn snapshot(&self) -> Arc<Mutex<Tree>> {
        self.tree.load_full()
    }

    async fn current(&self) -> Arc<Mutex<Tree>> {
        self.gate.wait().await;
        self.tree.load_full()
    }

    fn owned(&self, node: Node) -> Node {
        node.with_owner(self.config.uid, self.config.gid)
    }

    pub async fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        let path = normalize(path);
        let tree = self.current().await;
        let t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        Ok(node(&t, ino)?.stat())
    }

    /// Identifier of the remote object behind `path`, if any.
    pub async fn remote_id(&self, path: &str) -> FsResult<Option<String>> {
        let path = normalize(path);
        let tree = self.current().await;
        let t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        Ok(node(&t, ino)?.remote_id().map(str::to_string))
    }

    /// Children sorted by name; `.` and `..` are left to the caller.
    pub async fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = normalize(path);
        let tree = self.current().await;
        let t = tree.lock().await;
        let ino = resolve_dir(&t, &path)?;
        let mut entries: Vec<DirEntry> = node(&t, ino)?
            .children()
            .filter_map(|(name, &child)| {
                t.get(child).map(|n| DirEntry {
                    name: name.clone(),
                    ino: child,
                    kind: n.kind,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn readlink(&self, path: &str) -> FsResult<String> {
        let path = normalize(path);
        let tree = self.current().await;
        let t = tree.lock().await;
        let n = node(&t, resolve(&t, &path)?)?;
        if n.kind != FileType::Symlink {
            return Err(FsError::InvalidArgument(format!("{path} is not a symlink")));
        }
        Ok(String::from_utf8_lossy(n.local_data().unwrap_or_default()).into_owned())
    }

    /// Creates a file backed by a new remote file, or by `remote_id` when given.
    pub async fn create(
        &self,
        path: &str,
        mode: u32,
        remote_id: Option<String>,
    ) -> FsResult<FileAttr> {
        let path = normalize(path);
        debug!(%path, mode, "create");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let (parent, parent_path, name) = vacant(&t, &path)?;
        let id = match remote_id {
            Some(id) => id,
            None => self.project.new_file(&parent_path, &name).await?,
        };
        let ino = t.insert(parent, self.owned(Node::remote_file(name, id).with_mode(mode)))?;
        touch_dir(&mut t, parent);
        Ok(node(&t, ino)?.stat())
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<FileAttr> {
        let path = normalize(path);
        debug!(%path, mode, "mkdir");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let (parent, _, name) = vacant(&t, &path)?;
        self.project.new_folder(&path).await?;
        let ino = t.insert(parent, self.owned(Node::dir(name).with_mode(mode)))?;
        touch_dir(&mut t, parent);
        Ok(node(&t, ino)?.stat())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        debug!(%path, "rmdir");
        if path == "/" {
            return Err(FsError::InvalidArgument("cannot remove the root".into()));
        }
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve_dir(&t, &path)?;
        if node(&t, ino)?.children().next().is_some() {
            return Err(FsError::NotEmpty(path));
        }
        self.project.remove_folder(&path).await?;
        let parent = t.remove(ino).and_then(|n| n.parent());
        if let Some(parent) = parent {
            touch_dir(&mut t, parent);
        }
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        debug!(%path, "unlink");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;
        if n.is_dir() {
            return Err(FsError::IsADirectory(path));
        }
        if let Some(h) = n.handle(self.remote.as_ref()).await? {
            h.remove(self.project.id()).await?;
        }
        let parent = t.remove(ino).and_then(|n| n.parent());
        if let Some(parent) = parent {
            touch_dir(&mut t, parent);
        }
        Ok(())
    }

    /// Moves `from` to `to`. The target name must be free; directories carry
    /// their subtree along. When the remote rename fails after a move, the
    /// move is undone so the tree keeps matching the remote.
    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from = normalize(from);
        let to = normalize(to);
        debug!(%from, %to, "rename");
        if from == "/" {
            return Err(FsError::InvalidArgument("cannot move the root".into()));
        }
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let src = resolve(&t, &from)?;
        if from == to {
            return Ok(());
        }
        let (old_parent_path, old_name) = split_path(&from);
        let old_parent = resolve_dir(&t, &old_parent_path)?;
        let (new_parent, new_parent_path, new_name) = vacant(&t, &to)?;
        if t.is_within(new_parent, src) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {from} into itself"
            )));
        }
        let moved = old_parent != new_parent;
        let renamed = old_name != new_name;

        let n = node_mut(&mut t, src)?;
        if n.is_dir() {
            if moved {
                self.project
                    .move_items(&[], &[from.clone()], &new_parent_path)
                    .await?;
            }
            if renamed {
                let current = join_path(&new_parent_path, &old_name);
                if let Err(e) = self.project.rename_folder(&current, &new_name).await {
                    if moved {
                        self.undo_move(&[], &[current], &old_parent_path).await;
                    }
                    return Err(e.into());
                }
            }
        } else if let Some(h) = n.handle(self.remote.as_ref()).await? {
            let ids = [h.id().to_string()];
            if moved {
                self.project.move_items(&ids, &[], &new_parent_path).await?;
            }
            if renamed {
                if let Err(e) = h.rename(self.project.id(), &new_name).await {
                    if moved {
                        self.undo_move(&ids, &[], &old_parent_path).await;
                    }
                    return Err(e.into());
                }
            }
            n.set_remote_name(&new_name, Some(&new_parent_path));
        }

        t.rename(src, new_parent, &new_name)?;
        if let Some(n) = t.get_mut(src) {
            n.ctime = now_secs();
        }
        touch_dir(&mut t, old_parent);
        touch_dir(&mut t, new_parent);
        Ok(())
    }

    async fn undo_move(&self, objects: &[String], folders: &[String], back_to: &str) {
        if let Err(e) = self.project.move_items(objects, folders, back_to).await {
            warn!(?objects, ?folders, back_to, error = %e, "could not undo remote move");
        }
    }

    pub async fn symlink(&self, path: &str, target: &str) -> FsResult<FileAttr> {
        let path = normalize(path);
        debug!(%path, target, "symlink");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let (parent, _, name) = vacant(&t, &path)?;
        let ino = t.insert(parent, self.owned(Node::symlink(name, target)))?;
        touch_dir(&mut t, parent);
        Ok(node(&t, ino)?.stat())
    }

    pub async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let path = normalize(path);
        debug!(%path, offset, len, "read");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        node_mut(&mut t, ino)?
            .read(self.remote.as_ref(), offset, len)
            .await
    }

    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        let path = normalize(path);
        debug!(%path, offset, len = data.len(), "write");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        node_mut(&mut t, ino)?
            .write(self.remote.as_ref(), offset, data)
            .await
    }

    pub async fn truncate(&self, path: &str, length: u64) -> FsResult<()> {
        let path = normalize(path);
        debug!(%path, length, "truncate");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        node_mut(&mut t, ino)?.truncate(length)
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<FileAttr> {
        self.update_local(path, |n| n.mode = mode & 0o7777).await
    }

    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<FileAttr> {
        self.update_local(path, |n| {
            if let Some(uid) = uid {
                n.uid = uid;
            }
            if let Some(gid) = gid {
                n.gid = gid;
            }
        })
        .await
    }

    /// Sets access/modification times in seconds.
    pub async fn utimens(
        &self,
        path: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<FileAttr> {
        self.update_local(path, |n| {
            if let Some(atime) = atime {
                n.atime = atime;
            }
            if let Some(mtime) = mtime {
                n.mtime = mtime;
            }
        })
        .await
    }

    async fn update_local(&self, path: &str, f: impl FnOnce(&mut Node)) -> FsResult<FileAttr> {
        let path = normalize(path);
        debug!(%path, "setattr");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;
        f(n);
        n.ctime = now_secs();
        Ok(n.stat())
    }

    /// xattrs are only served for remote-backed entries.
    async fn require_description(&self, n: &mut Node, path: &str) -> FsResult<()> {
        if n.description(self.remote.as_ref()).await?.is_none() {
            return Err(FsError::NotSupported(format!("xattrs on {path}")));
        }
        Ok(())
    }

    pub async fn getxattr(&self, path: &str, name: &str) -> FsResult<String> {
        let path = normalize(path);
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;
        self.require_description(n, &path).await?;
        n.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoAttribute(name.to_string()))
    }

    pub async fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        let path = normalize(path);
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;
        self.require_description(n, &path).await?;
        Ok(n.xattrs.keys().cloned().collect())
    }

    /// Stores a local xattr. `tag`, `property` (`key=value`) and `state`
    /// (only `closed`) are forwarded to the remote object first.
    pub async fn setxattr(&self, path: &str, name: &str, value: &str) -> FsResult<()> {
        let path = normalize(path);
        debug!(%path, name, value, "setxattr");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;

        if let Some(kind) = remote_xattr(name) {
            let Some(h) = n.handle(self.remote.as_ref()).await? else {
                return Err(FsError::NotSupported(format!("{name} on local entry {path}")));
            };
            match kind {
                RemoteXattr::Tag => {
                    h.add_tags(self.project.id(), &[value.to_string()]).await?;
                }
                RemoteXattr::Property => {
                    let (key, val) = value
                        .split_once('=')
                        .filter(|(k, _)| !k.is_empty())
                        .ok_or_else(|| {
                            FsError::InvalidArgument(format!("property {value:?} is not key=value"))
                        })?;
                    let props = BTreeMap::from([(key.to_string(), val.to_string())]);
                    h.add_properties(self.project.id(), &props).await?;
                }
                RemoteXattr::State => {
                    if value != "closed" {
                        return Err(FsError::InvalidArgument(format!(
                            "state can only be set to closed, got {value:?}"
                        )));
                    }
                    h.close(true).await?;
                    n.reload();
                    n.refresh_description(self.remote.as_ref()).await?;
                }
            }
        }

        n.xattrs.insert(name.to_string(), value.to_string());
        n.ctime = now_secs();
        Ok(())
    }

    pub async fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        let path = normalize(path);
        debug!(%path, name, "removexattr");
        let tree = self.current().await;
        let mut t = tree.lock().await;
        let ino = resolve(&t, &path)?;
        let n = node_mut(&mut t, ino)?;
        if n.xattrs.remove(name).is_none() {
            return Err(FsError::NoAttribute(name.to_string()));
        }
        n.ctime = now_secs();
        Ok(())
    }

    /// Placeholder capacity; does not wait for the mirror.
    pub fn statfs(&self) -> FsStats {
        PLACEHOLDER_STATS
    }

    pub async fn path_of(&self, ino: u64) -> FsResult<String> {
        let tree = self.current().await;
        let t = tree.lock().await;
        t.path_of(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    /// Parent inode; the root is its own parent.
    pub async fn parent_of(&self, ino: u64) -> FsResult<u64> {
        let tree = self.current().await;
        let t = tree.lock().await;
        Ok(node(&t, ino)?.parent().unwrap_or(ino))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use crate::remote::{ObjectState, RemoteApi};
    use std::time::Duration;

    fn remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.add_project("project-1", "demo");
        remote
    }

    async fn mounted(remote: &MemoryRemote) -> ProjectFs {
        let fs = ProjectFs::new(
            Arc::new(remote.clone()),
            MountConfig::new("project-1").unwrap(),
        )
        .await
        .unwrap();
        fs.refresh().await.unwrap();
        fs
    }

    #[tokio::test]
    async fn test_operations_wait_for_first_build() {
        let remote = remote();
        remote.add_file("project-1", "/", "a.txt", "x", true).unwrap();
        let fs = Arc::new(
            ProjectFs::new(
                Arc::new(remote.clone()),
                MountConfig::new("project-1").unwrap(),
            )
            .await
            .unwrap(),
        );

        let pending = {
            let fs = fs.clone();
            tokio::spawn(async move { fs.getattr("/a.txt").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        // statfs never waits.
        assert_eq!(fs.statfs().namelen, 255);

        fs.refresh().await.unwrap();
        let attr = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.size, 1);
    }

    #[tokio::test]
    async fn test_create_allocates_remote_file() {
        let remote = remote();
        remote.add_folder("project-1", "/data").unwrap();
        let fs = mounted(&remote).await;

        let attr = fs.create("/data/new.txt", 0o600, None).await.unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.mode, 0o600);

        let got = fs.getattr("/data/new.txt").await.unwrap();
        assert_eq!(got.ino, attr.ino);
        let id = fs.remote_id("/data/new.txt").await.unwrap().unwrap();
        let desc = remote.describe_object(&id).unwrap();
        assert_eq!(desc.live.folder, "/data");
        assert_eq!(desc.live.name, "new.txt");
        assert_eq!(desc.live.state, ObjectState::Open);

        assert!(matches!(
            fs.create("/data/new.txt", 0o644, None).await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.create("/missing/x", 0o644, None).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.create("/data/new.txt/x", 0o644, None).await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_create_with_existing_id_skips_remote_allocation() {
        let remote = remote();
        let id = remote.add_file("project-1", "/", "src", "abc", true).unwrap();
        let fs = mounted(&remote).await;
        fs.create("/alias", 0o644, Some(id.clone())).await.unwrap();
        assert_eq!(fs.remote_id("/alias").await.unwrap(), Some(id));
        assert_eq!(fs.read("/alias", 0, 10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_mkdir_and_rmdir_reach_remote() {
        let remote = remote();
        let fs = mounted(&remote).await;

        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/b", 0o700).await.unwrap();
        assert!(remote.has_folder("project-1", "/a/b"));
        assert_eq!(fs.getattr("/a/b").await.unwrap().mode, 0o700);

        assert!(matches!(fs.rmdir("/a").await, Err(FsError::NotEmpty(_))));
        fs.rmdir("/a/b").await.unwrap();
        assert!(!remote.has_folder("project-1", "/a/b"));
        assert!(matches!(
            fs.getattr("/a/b").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(fs.rmdir("/").await, Err(FsError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unlink_removes_remote_object() {
        let remote = remote();
        let id = remote.add_file("project-1", "/", "gone.txt", "x", true).unwrap();
        let fs = mounted(&remote).await;
        fs.mkdir("/d", 0o755).await.unwrap();

        assert!(matches!(fs.unlink("/d").await, Err(FsError::IsADirectory(_))));
        fs.unlink("/gone.txt").await.unwrap();
        assert!(remote.describe_object(&id).is_none());
        assert!(fs.readdir("/").await.unwrap().iter().all(|e| e.name != "gone.txt"));
    }

    #[tokio::test]
    async fn test_rename_directory_moves_descendants() {
        let remote = remote();
        remote.add_folder("project-1", "/src/inner").unwrap();
        remote.add_folder("project-1", "/dst").unwrap();
        remote.add_file("project-1", "/src/inner", "f.txt", "hi", true).unwrap();
        let fs = mounted(&remote).await;
        let before = fs.getattr("/src/inner/f.txt").await.unwrap();

        fs.rename("/src", "/dst/moved").await.unwrap();

        assert!(matches!(
            fs.getattr("/src/inner/f.txt").await,
            Err(FsError::NotFound(_))
        ));
        let after = fs.getattr("/dst/moved/inner/f.txt").await.unwrap();
        assert_eq!(after.ino, before.ino);
        assert!(remote.has_folder("project-1", "/dst/moved/inner"));
        assert!(!remote.has_folder("project-1", "/src"));

        // The rebuilt mirror agrees with the local move.
        fs.refresh().await.unwrap();
        assert_eq!(fs.read("/dst/moved/inner/f.txt", 0, 10).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_failed_folder_rename_restores_remote_location() {
        let remote = remote();
        remote.add_folder("project-1", "/src/inner").unwrap();
        remote.add_folder("project-1", "/dst").unwrap();
        remote.add_file("project-1", "/src/inner", "f.txt", "hi", true).unwrap();
        let fs = mounted(&remote).await;
        // Taken on the remote after the build; the local tree does not know.
        remote.add_folder("project-1", "/dst/moved").unwrap();

        assert!(matches!(
            fs.rename("/src", "/dst/moved").await,
            Err(FsError::Remote(_))
        ));
        assert!(fs.getattr("/src/inner/f.txt").await.is_ok());
        assert!(remote.has_folder("project-1", "/src/inner"));
        assert!(!remote.has_folder("project-1", "/dst/src"));

        fs.mkdir("/src/x", 0o755).await.unwrap();
        assert!(remote.has_folder("project-1", "/src/x"));
        assert_eq!(fs.read("/src/inner/f.txt", 0, 10).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_rename_file_moves_and_renames_remote_object() {
        let remote = remote();
        remote.add_folder("project-1", "/out").unwrap();
        let id = remote.add_file("project-1", "/", "a.txt", "abc", true).unwrap();
        let fs = mounted(&remote).await;

        fs.rename("/a.txt", "/out/b.txt").await.unwrap();
        let desc = remote.describe_object(&id).unwrap();
        assert_eq!(desc.live.folder, "/out");
        assert_eq!(desc.live.name, "b.txt");
        assert_eq!(fs.read("/out/b.txt", 0, 10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_rename_preconditions() {
        let remote = remote();
        remote.add_folder("project-1", "/d").unwrap();
        remote.add_file("project-1", "/", "a", "1", true).unwrap();
        remote.add_file("project-1", "/", "b", "2", true).unwrap();
        let fs = mounted(&remote).await;

        assert!(matches!(
            fs.rename("/nope", "/c").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.rename("/a", "/missing/c").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.rename("/a", "/b/c").await,
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.rename("/a", "/b").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.rename("/d", "/d/sub").await,
            Err(FsError::InvalidArgument(_))
        ));

        // Renaming onto itself is a no-op, as long as the source exists.
        let before = remote.project_modified("project-1");
        fs.rename("/a", "/a").await.unwrap();
        fs.rename("/d", "/d").await.unwrap();
        assert_eq!(fs.read("/a", 0, 10).await.unwrap(), b"1");
        assert_eq!(remote.project_modified("project-1"), before);
        assert!(matches!(
            fs.rename("/nope", "/nope").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_symlink_is_local() {
        let remote = remote();
        let fs = mounted(&remote).await;
        let before = remote.project_modified("project-1");

        let attr = fs.symlink("/link", "/some/where").await.unwrap();
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.size, 11);
        assert_eq!(fs.readlink("/link").await.unwrap(), "/some/where");
        assert_eq!(remote.project_modified("project-1"), before);

        fs.mkdir("/dir", 0o755).await.unwrap();
        assert!(matches!(
            fs.readlink("/dir").await,
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_reads_empty() {
        let remote = remote();
        remote.add_file("project-1", "/", "pending", "secret", false).unwrap();
        let fs = mounted(&remote).await;
        assert!(fs.read("/pending", 0, 100).await.unwrap().is_empty());
        assert!(matches!(
            fs.read("/", 0, 1).await,
            Err(FsError::IsADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_setxattr_state_closed_reports_final_size() {
        let remote = remote();
        let fs = mounted(&remote).await;

        fs.create("/out.txt", 0o644, None).await.unwrap();
        fs.write("/out.txt", 0, b"hello").await.unwrap();
        fs.write("/out.txt", 5, b" world").await.unwrap();
        fs.setxattr("/out.txt", "state", "closed").await.unwrap();

        assert_eq!(fs.getattr("/out.txt").await.unwrap().size, 11);
        assert_eq!(fs.read("/out.txt", 0, 100).await.unwrap(), b"hello world");
        assert_eq!(fs.getxattr("/out.txt", "state").await.unwrap(), "closed");
        let id = fs.remote_id("/out.txt").await.unwrap().unwrap();
        assert!(remote.describe_object(&id).unwrap().is_closed());

        assert!(matches!(
            fs.setxattr("/out.txt", "user.state", "open").await,
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_tag_and_property_xattrs_reach_remote() {
        let remote = remote();
        let id = remote.add_file("project-1", "/", "f", "x", true).unwrap();
        let fs = mounted(&remote).await;

        fs.setxattr("/f", "user.tag", "important").await.unwrap();
        fs.setxattr("/f", "property", "owner=alice").await.unwrap();
        fs.setxattr("/f", "user.note", "local only").await.unwrap();

        let desc = remote.describe_object(&id).unwrap();
        assert_eq!(desc.live.tags, vec!["important".to_string()]);
        assert_eq!(desc.live.properties.get("owner").map(String::as_str), Some("alice"));

        let mut names = fs.listxattr("/f").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["property", "user.note", "user.tag"]);
        assert_eq!(fs.getxattr("/f", "user.note").await.unwrap(), "local only");

        assert!(matches!(
            fs.setxattr("/f", "property", "no-separator").await,
            Err(FsError::InvalidArgument(_))
        ));
        fs.removexattr("/f", "user.note").await.unwrap();
        assert!(matches!(
            fs.getxattr("/f", "user.note").await,
            Err(FsError::NoAttribute(_))
        ));
        assert!(matches!(
            fs.removexattr("/f", "user.note").await,
            Err(FsError::NoAttribute(_))
        ));
    }

    #[tokio::test]
    async fn test_xattrs_need_remote_description() {
        let remote = remote();
        let fs = mounted(&remote).await;
        fs.symlink("/l", "/t").await.unwrap();
        assert!(matches!(
            fs.getxattr("/l", "user.x").await,
            Err(FsError::NotSupported(_))
        ));
        assert!(matches!(
            fs.listxattr("/").await,
            Err(FsError::NotSupported(_))
        ));
        assert!(matches!(
            fs.setxattr("/l", "tag", "t").await,
            Err(FsError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_local_metadata_updates() {
        let remote = remote();
        remote.add_file("project-1", "/", "f", "x", true).unwrap();
        let fs = mounted(&remote).await;
        let before = remote.project_modified("project-1");

        assert_eq!(fs.chmod("/f", 0o100600).await.unwrap().mode, 0o600);
        let attr = fs.chown("/f", Some(42), None).await.unwrap();
        assert_eq!(attr.uid, 42);
        let attr = fs.utimens("/f", Some(10), Some(20)).await.unwrap();
        assert_eq!((attr.atime, attr.mtime), (10, 20));
        assert_eq!(remote.project_modified("project-1"), before);
    }

    #[tokio::test]
    async fn test_inode_helpers() {
        let remote = remote();
        remote.add_folder("project-1", "/a").unwrap();
        let fs = mounted(&remote).await;
        let a = fs.getattr("/a").await.unwrap().ino;
        assert_eq!(fs.path_of(a).await.unwrap(), "/a");
        assert_eq!(fs.parent_of(a).await.unwrap(), 1);
        assert_eq!(fs.parent_of(1).await.unwrap(), 1);
        assert!(matches!(fs.path_of(999).await, Err(FsError::NotFound(_))));
        let project = remote.project("project-1").await.unwrap();
        assert_eq!(project.id(), fs.project_id());
    }
}
