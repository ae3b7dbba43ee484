//! Filesystem entries.
//!
//! A `Node` carries POSIX metadata plus, for remote-backed entries, the object
//! id, the last describe snapshot and a lazily constructed object handle.

use crate::error::{FsError, FsResult};
use crate::remote::{ObjectClass, ObjectDescription, RemoteApi, RemoteObject};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const ROOT_INO: u64 = 1;

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;
pub const EXEC_MODE: u32 = 0o755;
pub const SYMLINK_MODE: u32 = 0o777;

/// Rows fetched per remote call when rendering a table.
const TABLE_PAGE_ROWS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Dir,
    File,
    Symlink,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub kind: FileType,
    /// Permission bits only; the type comes from `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Strips characters that would let a remote name escape its directory.
pub fn sanitize_name(name: &str) -> String {
    name.chars().filter(|c| *c != '/' && *c != '\0').collect()
}

/// `.` and `..` always resolve to the directory itself or its parent.
pub fn is_reserved_name(name: &str) -> bool {
    name == "." || name == ".."
}

pub struct Node {
    pub(crate) ino: u64,
    pub(crate) parent: Option<u64>,
    pub kind: FileType,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    remote_id: Option<String>,
    description: Option<ObjectDescription>,
    handle: Option<Arc<dyn RemoteObject>>,
    pub(crate) children: HashMap<String, u64>,
    local_data: Option<Vec<u8>>,
    pub xattrs: BTreeMap<String, String>,
}

impl Node {
    fn new(kind: FileType, name: impl Into<String>, mode: u32) -> Self {
        let now = now_secs();
        Self {
            ino: 0,
            parent: None,
            kind,
            name: name.into(),
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            remote_id: None,
            description: None,
            handle: None,
            children: HashMap::new(),
            local_data: None,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self::new(FileType::Dir, name, DIR_MODE)
    }

    /// File backed by the remote object `id`.
    pub fn remote_file(name: impl Into<String>, id: impl Into<String>) -> Self {
        let mut node = Self::new(FileType::File, name, FILE_MODE);
        node.remote_id = Some(id.into());
        node
    }

    pub fn symlink(name: impl Into<String>, target: &str) -> Self {
        let mut node = Self::new(FileType::Symlink, name, SYMLINK_MODE);
        node.size = target.len() as u64;
        node.local_data = Some(target.as_bytes().to_vec());
        node
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o7777;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Creation and modification times in seconds.
    pub fn with_times(mut self, created: i64, modified: i64) -> Self {
        self.ctime = modified.max(created);
        self.mtime = modified;
        self.atime = modified;
        self
    }

    pub fn with_description(mut self, desc: ObjectDescription) -> Self {
        self.description = Some(desc);
        self
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Dir
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.children.iter()
    }

    pub fn stat(&self) -> FileAttr {
        FileAttr {
            ino: self.ino,
            kind: self.kind,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    pub fn touch(&mut self) {
        let now = now_secs();
        self.mtime = now;
        self.ctime = now;
    }

    /// Symlink target, or the in-memory contents of a local file.
    pub fn local_data(&self) -> Option<&[u8]> {
        self.local_data.as_deref()
    }

    /// Remote handle, constructed on first use and cached until `reload`.
    pub async fn handle(&mut self, remote: &dyn RemoteApi) -> FsResult<Option<Arc<dyn RemoteObject>>> {
        let Some(id) = self.remote_id.as_deref() else {
            return Ok(None);
        };
        if let Some(h) = &self.handle {
            return Ok(Some(h.clone()));
        }
        let h = remote.object(id).await?;
        self.handle = Some(h.clone());
        Ok(Some(h))
    }

    /// Drops the cached handle and description.
    pub fn reload(&mut self) {
        self.handle = None;
        self.description = None;
    }

    /// Describes the remote object now and caches the result.
    pub async fn refresh_description(&mut self, remote: &dyn RemoteApi) -> FsResult<Option<ObjectDescription>> {
        let Some(h) = self.handle(remote).await? else {
            return Ok(None);
        };
        let desc = h.describe().await?;
        if desc.class == ObjectClass::File && desc.is_closed() {
            if let Some(size) = desc.live.size {
                self.size = size;
            }
        }
        self.description = Some(desc.clone());
        Ok(Some(desc))
    }

    /// Cached description, fetched once when missing.
    pub async fn description(&mut self, remote: &dyn RemoteApi) -> FsResult<Option<ObjectDescription>> {
        if let Some(desc) = &self.description {
            return Ok(Some(desc.clone()));
        }
        self.refresh_description(remote).await
    }

    pub(crate) fn set_remote_name(&mut self, name: &str, folder: Option<&str>) {
        if let Some(desc) = &mut self.description {
            desc.live.name = name.to_string();
            if let Some(folder) = folder {
                desc.live.folder = folder.to_string();
            }
        }
    }

    pub async fn read(&mut self, remote: &dyn RemoteApi, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        if self.is_dir() {
            return Err(FsError::IsADirectory(self.name.clone()));
        }
        if self.remote_id.is_none() {
            let data = self.local_data.as_deref().unwrap_or_default();
            return Ok(window(data, offset, len));
        }
        let Some(desc) = self.description(remote).await? else {
            return Ok(Vec::new());
        };
        match desc.class {
            ObjectClass::File => self.read_file(remote, desc, offset, len).await,
            ObjectClass::Table => self.read_table(remote, offset, len).await,
            ObjectClass::Record => {
                let Some(h) = self.handle(remote).await? else {
                    return Ok(Vec::new());
                };
                let details = h.details().await?;
                Ok(window(&serialize(&details), offset, len))
            }
            ObjectClass::Applet => {
                let blob = serde_json::to_vec(&desc).unwrap_or_default();
                Ok(window(&blob, offset, len))
            }
        }
    }

    async fn read_file(
        &mut self,
        remote: &dyn RemoteApi,
        desc: ObjectDescription,
        offset: u64,
        len: usize,
    ) -> FsResult<Vec<u8>> {
        if !desc.is_closed() {
            self.reload();
            let closed = self
                .refresh_description(remote)
                .await?
                .is_some_and(|d| d.is_closed());
            if !closed {
                debug!(name = %self.name, "remote file still open, nothing to read yet");
                return Ok(Vec::new());
            }
        }
        let Some(h) = self.handle(remote).await? else {
            return Ok(Vec::new());
        };
        Ok(h.read(offset, len).await?)
    }

    // Renders rows from the start every time; only enough pages to cover the
    // requested window are fetched.
    async fn read_table(&mut self, remote: &dyn RemoteApi, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let Some(h) = self.handle(remote).await? else {
            return Ok(Vec::new());
        };
        let want = offset.saturating_add(len as u64);
        let mut buf = Vec::new();
        let mut next_row = 0u64;
        while (buf.len() as u64) < want {
            let rows = h.rows(next_row, TABLE_PAGE_ROWS).await?;
            if rows.is_empty() {
                break;
            }
            next_row += rows.len() as u64;
            for row in &rows {
                render_row(row, &mut buf);
            }
            if rows.len() < TABLE_PAGE_ROWS {
                break;
            }
        }
        Ok(window(&buf, offset, len))
    }

    /// Appends `data` to the open remote file. The offset is only logged.
    pub async fn write(&mut self, remote: &dyn RemoteApi, offset: u64, data: &[u8]) -> FsResult<usize> {
        if self.kind != FileType::File {
            return Err(FsError::NotSupported(format!("write to {}", self.name)));
        }
        if let Some(desc) = &self.description {
            if desc.class != ObjectClass::File {
                return Err(FsError::NotSupported(format!(
                    "write to {:?} {}",
                    desc.class, self.name
                )));
            }
        }
        let Some(h) = self.handle(remote).await? else {
            return Err(FsError::NotSupported(format!(
                "write to local file {}",
                self.name
            )));
        };
        if offset != self.size {
            debug!(name = %self.name, offset, size = self.size, "non-sequential write treated as append");
        }
        h.write(data).await?;
        self.size += data.len() as u64;
        self.touch();
        Ok(data.len())
    }

    pub fn truncate(&mut self, length: u64) -> FsResult<()> {
        if self.is_dir() {
            return Err(FsError::IsADirectory(self.name.clone()));
        }
        match &mut self.local_data {
            Some(data) => {
                data.truncate(length as usize);
                self.size = data.len() as u64;
                self.touch();
                Ok(())
            }
            None if length == self.size => Ok(()),
            None => Err(FsError::NotSupported(format!(
                "truncate of remote file {}",
                self.name
            ))),
        }
    }
}

fn serialize(v: &Value) -> Vec<u8> {
    serde_json::to_vec(v).unwrap_or_default()
}

fn render_row(row: &[Value], out: &mut Vec<u8>) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        match cell {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            other => out.extend_from_slice(other.to_string().as_bytes()),
        }
    }
    out.push(b'\n');
}

fn window(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{MemoryRemote, ObjectSeed};
    use serde_json::json;

    fn seeded() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.add_project("project-1", "demo");
        remote
    }

    async fn node_for(remote: &MemoryRemote, id: &str) -> Node {
        let desc = remote.describe_object(id).unwrap();
        Node::remote_file(desc.live.name.clone(), id).with_description(desc)
    }

    #[test]
    fn test_sanitize_strips_separators_and_nul() {
        assert_eq!(sanitize_name("a/b\0c"), "abc");
        assert_eq!(sanitize_name("plain.txt"), "plain.txt");
    }

    #[tokio::test]
    async fn test_open_file_reads_empty_until_closed() {
        let remote = seeded();
        let id = remote.add_file("project-1", "/", "f", "payload", false).unwrap();
        let mut node = node_for(&remote, &id).await;

        assert!(node.read(&remote, 0, 64).await.unwrap().is_empty());

        remote.object(&id).await.unwrap().close(true).await.unwrap();
        assert_eq!(node.read(&remote, 0, 64).await.unwrap(), b"payload");
        assert_eq!(node.read(&remote, 3, 2).await.unwrap(), b"lo");
        assert_eq!(node.size, 7);
    }

    #[tokio::test]
    async fn test_table_rows_render_as_tsv() {
        let remote = seeded();
        let mut seed = ObjectSeed::new(ObjectClass::Table, "/", "t");
        seed.columns = vec!["name".into(), "n".into()];
        seed.rows = vec![vec![json!("a"), json!(1)], vec![json!("b"), json!(2)]];
        let id = remote.insert("project-1", seed).unwrap();
        let mut node = node_for(&remote, &id).await;

        assert_eq!(node.read(&remote, 0, 100).await.unwrap(), b"a\t1\nb\t2\n");
        assert_eq!(node.read(&remote, 4, 3).await.unwrap(), b"b\t2");
    }

    #[tokio::test]
    async fn test_record_reads_details_json() {
        let remote = seeded();
        let mut seed = ObjectSeed::new(ObjectClass::Record, "/", "r");
        seed.details = json!({"k": "v"});
        let id = remote.insert("project-1", seed).unwrap();
        let mut node = node_for(&remote, &id).await;
        assert_eq!(node.read(&remote, 0, 100).await.unwrap(), br#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn test_write_appends_to_remote_file() {
        let remote = seeded();
        let project = remote.project("project-1").await.unwrap();
        let id = project.new_file("/", "out").await.unwrap();
        let mut node = Node::remote_file("out", id.clone());

        assert_eq!(node.write(&remote, 0, b"abc").await.unwrap(), 3);
        assert_eq!(node.write(&remote, 100, b"def").await.unwrap(), 3);
        assert_eq!(node.size, 6);

        let obj = remote.object(&id).await.unwrap();
        obj.close(true).await.unwrap();
        assert_eq!(obj.read(0, 10).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_write_rejected_without_remote_file() {
        let remote = seeded();
        let mut link = Node::symlink("l", "/target");
        assert!(matches!(
            link.write(&remote, 0, b"x").await,
            Err(FsError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_truncate_is_local_only() {
        let remote = seeded();
        let mut link = Node::symlink("l", "/some/target");
        link.truncate(5).unwrap();
        assert_eq!(link.read(&remote, 0, 100).await.unwrap(), b"/some");

        let mut file = Node::remote_file("f", "file-1").with_size(10);
        file.truncate(10).unwrap();
        assert!(matches!(file.truncate(0), Err(FsError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_handle_is_cached_until_reload() {
        let remote = seeded();
        let id = remote.add_file("project-1", "/", "f", "x", true).unwrap();
        let mut node = Node::remote_file("f", id);
        let first = node.handle(&remote).await.unwrap().unwrap();
        let second = node.handle(&remote).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        node.reload();
        let third = node.handle(&remote).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
