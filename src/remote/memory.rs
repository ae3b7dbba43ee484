//! In-process remote store, used for development mounts and tests.
//!
//! Objects are kept in id order so searches page deterministically. Every
//! mutation bumps the owning project's modification time, which is what the
//! mirror polls to decide whether a rebuild is due.

use super::{
    LiveAttributes, ObjectClass, ObjectDescription, ObjectState, ProjectDescription, RemoteApi,
    RemoteObject, RemoteProject, SearchPage,
};
use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_PAGE_SIZE: usize = 1000;

enum Content {
    File(Vec<u8>),
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Record(Value),
    Applet,
}

struct StoredObject {
    desc: ObjectDescription,
    content: Content,
}

struct StoredProject {
    name: String,
    modified: i64,
    folders: BTreeSet<String>,
}

#[derive(Default)]
struct Store {
    clock: i64,
    next_id: u64,
    projects: HashMap<String, StoredProject>,
    objects: BTreeMap<String, StoredObject>,
}

impl Store {
    fn tick(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn touch(&mut self, project: &str) -> i64 {
        let now = self.tick();
        if let Some(p) = self.projects.get_mut(project) {
            p.modified = now;
        }
        now
    }

    fn project(&self, id: &str) -> RemoteResult<&StoredProject> {
        self.projects
            .get(id)
            .ok_or_else(|| RemoteError::not_found(format!("project {id} not found")))
    }

    fn project_mut(&mut self, id: &str) -> RemoteResult<&mut StoredProject> {
        self.projects
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("project {id} not found")))
    }

    fn object(&self, id: &str) -> RemoteResult<&StoredObject> {
        self.objects
            .get(id)
            .ok_or_else(|| RemoteError::not_found(format!("object {id} not found")))
    }

    fn object_mut(&mut self, id: &str) -> RemoteResult<&mut StoredObject> {
        self.objects
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("object {id} not found")))
    }

    fn alloc_id(&mut self, class: ObjectClass) -> String {
        self.next_id += 1;
        let prefix = match class {
            ObjectClass::File => "file",
            ObjectClass::Table => "gtable",
            ObjectClass::Record => "record",
            ObjectClass::Applet => "applet",
        };
        format!("{prefix}-{:08}", self.next_id)
    }

    /// Rewrites every folder and object path under `from` to live under `to`.
    fn relocate_folder(&mut self, project: &str, from: &str, to: &str) -> RemoteResult<()> {
        let p = self.project_mut(project)?;
        let moved: Vec<String> = p
            .folders
            .iter()
            .filter(|f| reparent(f, from, to).is_some())
            .cloned()
            .collect();
        for f in moved {
            p.folders.remove(&f);
            if let Some(n) = reparent(&f, from, to) {
                p.folders.insert(n);
            }
        }
        for obj in self.objects.values_mut() {
            if obj.desc.project != project {
                continue;
            }
            if let Some(n) = reparent(&obj.desc.live.folder, from, to) {
                obj.desc.live.folder = n;
            }
        }
        Ok(())
    }
}

fn reparent(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    let rest = path.strip_prefix(from)?.strip_prefix('/')?;
    Some(join(to, rest))
}

fn join(folder: &str, name: &str) -> String {
    if folder == "/" {
        format!("/{name}")
    } else {
        format!("{folder}/{name}")
    }
}

fn normalize_folder(folder: &str) -> String {
    let parts: Vec<&str> = folder.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent_folder(folder: &str) -> String {
    match folder.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(n) => folder[..n].to_string(),
    }
}

fn basename(folder: &str) -> &str {
    folder.rsplit('/').next().unwrap_or("")
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Seed description of one data object (manifest entry).
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectSeed {
    pub class: ObjectClass,
    pub name: String,
    #[serde(default = "root_folder")]
    pub folder: String,
    /// Files default to closed when seeded.
    #[serde(default)]
    pub state: Option<ObjectState>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Creation time in milliseconds; defaults to the store clock.
    #[serde(default)]
    pub created: Option<i64>,
}

fn root_folder() -> String {
    "/".to_string()
}

impl ObjectSeed {
    pub fn new(class: ObjectClass, folder: &str, name: &str) -> Self {
        Self {
            class,
            name: name.to_string(),
            folder: folder.to_string(),
            state: None,
            content: None,
            columns: Vec::new(),
            rows: Vec::new(),
            details: Value::Null,
            tags: Vec::new(),
            types: Vec::new(),
            properties: BTreeMap::new(),
            created: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProjectSeed {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub objects: Vec<ObjectSeed>,
}

/// JSON manifest accepted by `MemoryRemote::from_manifest`.
#[derive(Clone, Debug, Deserialize)]
pub struct Manifest {
    pub projects: Vec<ProjectSeed>,
}

#[derive(Clone)]
pub struct MemoryRemote {
    store: Arc<Mutex<Store>>,
    page_size: usize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Search page size; small values exercise pagination.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn from_manifest(path: impl AsRef<Path>) -> RemoteResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::invalid_input(format!("read manifest {}: {e}", path.display()))
        })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
            RemoteError::invalid_input(format!("parse manifest {}: {e}", path.display()))
        })?;
        let remote = Self::new();
        for p in manifest.projects {
            remote.add_project(&p.id, &p.name);
            for f in &p.folders {
                remote.add_folder(&p.id, f)?;
            }
            for o in p.objects {
                remote.insert(&p.id, o)?;
            }
        }
        Ok(remote)
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_project(&self, id: &str, name: &str) {
        let mut s = self.lock();
        let now = s.tick();
        let mut folders = BTreeSet::new();
        folders.insert("/".to_string());
        s.projects.entry(id.to_string()).or_insert(StoredProject {
            name: name.to_string(),
            modified: now,
            folders,
        });
    }

    /// Adds `folder` and any missing ancestors.
    pub fn add_folder(&self, project: &str, folder: &str) -> RemoteResult<()> {
        let folder = normalize_folder(folder);
        let mut s = self.lock();
        let p = s.project_mut(project)?;
        let mut cur = String::from("/");
        for part in folder.split('/').filter(|x| !x.is_empty()) {
            cur = join(&cur, part);
            p.folders.insert(cur.clone());
        }
        s.touch(project);
        Ok(())
    }

    /// Inserts a data object; its folder is created when missing.
    pub fn insert(&self, project: &str, seed: ObjectSeed) -> RemoteResult<String> {
        self.add_folder(project, &seed.folder)?;
        let mut s = self.lock();
        let now = s.tick();
        let id = s.alloc_id(seed.class);
        let (content, state, size) = match seed.class {
            ObjectClass::File => {
                let data = seed.content.unwrap_or_default().into_bytes();
                let state = seed.state.unwrap_or(ObjectState::Closed);
                let size = (state == ObjectState::Closed).then_some(data.len() as u64);
                (Content::File(data), state, size)
            }
            ObjectClass::Table => {
                let size: u64 = seed
                    .rows
                    .iter()
                    .flatten()
                    .map(|v| cell_text(v).len() as u64)
                    .sum();
                let content = Content::Table {
                    columns: seed.columns,
                    rows: seed.rows,
                };
                (content, ObjectState::Closed, Some(size))
            }
            ObjectClass::Record => {
                let size = seed.details.to_string().len() as u64;
                (Content::Record(seed.details), ObjectState::Closed, Some(size))
            }
            ObjectClass::Applet => (Content::Applet, ObjectState::Closed, None),
        };
        let desc = ObjectDescription {
            id: id.clone(),
            class: seed.class,
            project: project.to_string(),
            created: seed.created.unwrap_or(now),
            live: LiveAttributes {
                name: seed.name,
                folder: normalize_folder(&seed.folder),
                state,
                size,
                modified: seed.created.unwrap_or(now),
                tags: seed.tags,
                types: seed.types,
                properties: seed.properties,
            },
        };
        s.objects.insert(id.clone(), StoredObject { desc, content });
        s.touch(project);
        Ok(id)
    }

    pub fn add_file(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: &str,
        closed: bool,
    ) -> RemoteResult<String> {
        let mut seed = ObjectSeed::new(ObjectClass::File, folder, name);
        seed.content = Some(data.to_string());
        seed.state = Some(if closed {
            ObjectState::Closed
        } else {
            ObjectState::Open
        });
        self.insert(project, seed)
    }

    /// Current modification time of a project, 0 when unknown.
    pub fn project_modified(&self, project: &str) -> i64 {
        self.lock().projects.get(project).map_or(0, |p| p.modified)
    }

    /// Describe snapshot of any object, for assertions.
    pub fn describe_object(&self, id: &str) -> Option<ObjectDescription> {
        self.lock().objects.get(id).map(|o| o.desc.clone())
    }

    pub fn has_folder(&self, project: &str, folder: &str) -> bool {
        self.lock()
            .projects
            .get(project)
            .is_some_and(|p| p.folders.contains(folder))
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn project(&self, id: &str) -> RemoteResult<Arc<dyn RemoteProject>> {
        self.lock().project(id)?;
        Ok(Arc::new(MemoryProject {
            id: id.to_string(),
            remote: self.clone(),
        }))
    }

    async fn object(&self, id: &str) -> RemoteResult<Arc<dyn RemoteObject>> {
        self.lock().object(id)?;
        Ok(Arc::new(MemoryObject {
            id: id.to_string(),
            remote: self.clone(),
        }))
    }
}

struct MemoryProject {
    id: String,
    remote: MemoryRemote,
}

#[async_trait]
impl RemoteProject for MemoryProject {
    fn id(&self) -> &str {
        &self.id
    }

    async fn describe(&self, with_folders: bool) -> RemoteResult<ProjectDescription> {
        let s = self.remote.lock();
        let p = s.project(&self.id)?;
        Ok(ProjectDescription {
            id: self.id.clone(),
            name: p.name.clone(),
            modified: p.modified,
            folders: if with_folders {
                p.folders.iter().cloned().collect()
            } else {
                Vec::new()
            },
        })
    }

    async fn new_folder(&self, folder: &str) -> RemoteResult<()> {
        let folder = normalize_folder(folder);
        let mut s = self.remote.lock();
        let p = s.project_mut(&self.id)?;
        if p.folders.contains(&folder) {
            return Err(RemoteError::invalid_input(format!("{folder} already exists")));
        }
        if !p.folders.contains(&parent_folder(&folder)) {
            return Err(RemoteError::not_found(format!("parent of {folder} not found")));
        }
        p.folders.insert(folder);
        s.touch(&self.id);
        Ok(())
    }

    async fn rename_folder(&self, folder: &str, name: &str) -> RemoteResult<()> {
        let folder = normalize_folder(folder);
        if folder == "/" || name.is_empty() || name.contains('/') {
            return Err(RemoteError::invalid_input(format!(
                "cannot rename {folder} to {name:?}"
            )));
        }
        let target = join(&parent_folder(&folder), name);
        let mut s = self.remote.lock();
        let p = s.project(&self.id)?;
        if !p.folders.contains(&folder) {
            return Err(RemoteError::not_found(format!("{folder} not found")));
        }
        if p.folders.contains(&target) {
            return Err(RemoteError::invalid_input(format!("{target} already exists")));
        }
        s.relocate_folder(&self.id, &folder, &target)?;
        s.touch(&self.id);
        Ok(())
    }

    async fn remove_folder(&self, folder: &str) -> RemoteResult<()> {
        let folder = normalize_folder(folder);
        let mut s = self.remote.lock();
        let p = s.project(&self.id)?;
        if folder == "/" || !p.folders.contains(&folder) {
            return Err(RemoteError::not_found(format!("{folder} not found")));
        }
        let has_subfolders = p
            .folders
            .iter()
            .any(|f| f != &folder && reparent(f, &folder, "/").is_some());
        let has_objects = s
            .objects
            .values()
            .any(|o| o.desc.project == self.id && o.desc.live.folder == folder);
        if has_subfolders || has_objects {
            return Err(RemoteError::invalid_state(format!("{folder} is not empty")));
        }
        s.project_mut(&self.id)?.folders.remove(&folder);
        s.touch(&self.id);
        Ok(())
    }

    async fn move_items(
        &self,
        objects: &[String],
        folders: &[String],
        destination: &str,
    ) -> RemoteResult<()> {
        let destination = normalize_folder(destination);
        let mut s = self.remote.lock();
        if !s.project(&self.id)?.folders.contains(&destination) {
            return Err(RemoteError::not_found(format!("{destination} not found")));
        }
        for id in objects {
            let obj = s.object_mut(id)?;
            obj.desc.live.folder = destination.clone();
        }
        for f in folders {
            let f = normalize_folder(f);
            let target = join(&destination, basename(&f));
            if s.project(&self.id)?.folders.contains(&target) {
                return Err(RemoteError::invalid_input(format!("{target} already exists")));
            }
            s.relocate_folder(&self.id, &f, &target)?;
        }
        s.touch(&self.id);
        Ok(())
    }

    async fn find_data_objects(&self, cursor: Option<String>) -> RemoteResult<SearchPage> {
        let s = self.remote.lock();
        s.project(&self.id)?;
        let mut matching = s
            .objects
            .iter()
            .filter(|(id, o)| {
                o.desc.project == self.id && cursor.as_ref().is_none_or(|c| id.as_str() > c.as_str())
            })
            .map(|(_, o)| o.desc.clone());
        let objects: Vec<ObjectDescription> = matching.by_ref().take(self.remote.page_size).collect();
        let next = if matching.next().is_some() {
            objects.last().map(|o| o.id.clone())
        } else {
            None
        };
        Ok(SearchPage { objects, next })
    }

    async fn new_file(&self, folder: &str, name: &str) -> RemoteResult<String> {
        let folder = normalize_folder(folder);
        if !self.remote.lock().project(&self.id)?.folders.contains(&folder) {
            return Err(RemoteError::not_found(format!("{folder} not found")));
        }
        let mut seed = ObjectSeed::new(ObjectClass::File, &folder, name);
        seed.state = Some(ObjectState::Open);
        self.remote.insert(&self.id, seed)
    }
}

struct MemoryObject {
    id: String,
    remote: MemoryRemote,
}

#[async_trait]
impl RemoteObject for MemoryObject {
    fn id(&self) -> &str {
        &self.id
    }

    async fn describe(&self) -> RemoteResult<ObjectDescription> {
        Ok(self.remote.lock().object(&self.id)?.desc.clone())
    }

    async fn read(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        let s = self.remote.lock();
        let obj = s.object(&self.id)?;
        match &obj.content {
            Content::File(data) if obj.desc.is_closed() => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Content::File(_) => Err(RemoteError::invalid_state(format!(
                "{} is not closed",
                self.id
            ))),
            _ => Err(RemoteError::invalid_input(format!("{} is not a file", self.id))),
        }
    }

    async fn write(&self, data: &[u8]) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        let now = s.tick();
        let obj = s.object_mut(&self.id)?;
        if obj.desc.live.state != ObjectState::Open {
            return Err(RemoteError::invalid_state(format!("{} is not open", self.id)));
        }
        match &mut obj.content {
            Content::File(buf) => buf.extend_from_slice(data),
            _ => return Err(RemoteError::invalid_input(format!("{} is not a file", self.id))),
        }
        obj.desc.live.modified = now;
        Ok(())
    }

    async fn close(&self, _wait: bool) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        let now = s.tick();
        let obj = s.object_mut(&self.id)?;
        obj.desc.live.state = ObjectState::Closed;
        obj.desc.live.modified = now;
        if let Content::File(buf) = &obj.content {
            obj.desc.live.size = Some(buf.len() as u64);
        }
        let project = obj.desc.project.clone();
        s.touch(&project);
        Ok(())
    }

    async fn rename(&self, project: &str, name: &str) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        s.object_mut(&self.id)?.desc.live.name = name.to_string();
        s.touch(project);
        Ok(())
    }

    async fn add_tags(&self, project: &str, tags: &[String]) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        let obj = s.object_mut(&self.id)?;
        for t in tags {
            if !obj.desc.live.tags.contains(t) {
                obj.desc.live.tags.push(t.clone());
            }
        }
        s.touch(project);
        Ok(())
    }

    async fn add_properties(
        &self,
        project: &str,
        properties: &BTreeMap<String, String>,
    ) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        let obj = s.object_mut(&self.id)?;
        obj.desc
            .live
            .properties
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        s.touch(project);
        Ok(())
    }

    async fn remove(&self, project: &str) -> RemoteResult<()> {
        let mut s = self.remote.lock();
        s.objects
            .remove(&self.id)
            .ok_or_else(|| RemoteError::not_found(format!("object {} not found", self.id)))?;
        s.touch(project);
        Ok(())
    }

    async fn rows(&self, start: u64, limit: usize) -> RemoteResult<Vec<Vec<Value>>> {
        let s = self.remote.lock();
        match &s.object(&self.id)?.content {
            Content::Table { rows, .. } => Ok(rows
                .iter()
                .skip(start as usize)
                .take(limit)
                .cloned()
                .collect()),
            _ => Err(RemoteError::invalid_input(format!("{} is not a table", self.id))),
        }
    }

    async fn details(&self) -> RemoteResult<Value> {
        let s = self.remote.lock();
        match &s.object(&self.id)?.content {
            Content::Record(details) => Ok(details.clone()),
            Content::Table { columns, .. } => Ok(serde_json::json!({ "columns": columns })),
            _ => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_search_pages_through_all_objects() {
        let remote = MemoryRemote::new().with_page_size(2);
        remote.add_project("project-1", "demo");
        for i in 0..5 {
            remote
                .add_file("project-1", "/data", &format!("f{i}"), "x", true)
                .unwrap();
        }
        let project = remote.project("project-1").await.unwrap();
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = project.find_data_objects(cursor).await.unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.live.name));
            match page.next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn test_file_lifecycle_and_modification_time() {
        let remote = MemoryRemote::new();
        remote.add_project("project-1", "demo");
        let project = remote.project("project-1").await.unwrap();
        let before = project.describe(false).await.unwrap().modified;

        let id = project.new_file("/", "out.txt").await.unwrap();
        let obj = remote.object(&id).await.unwrap();
        obj.write(b"hello ").await.unwrap();
        obj.write(b"world").await.unwrap();
        assert!(obj.read(0, 5).await.is_err(), "open files are unreadable");

        obj.close(true).await.unwrap();
        let desc = obj.describe().await.unwrap();
        assert_eq!(desc.live.state, ObjectState::Closed);
        assert_eq!(desc.live.size, Some(11));
        assert_eq!(obj.read(6, 100).await.unwrap(), b"world");
        assert!(obj.write(b"!").await.is_err());
        assert!(project.describe(false).await.unwrap().modified > before);
    }

    #[tokio::test]
    async fn test_folder_rename_and_move_carry_contents() {
        let remote = MemoryRemote::new();
        remote.add_project("project-1", "demo");
        let id = remote.add_file("project-1", "/a/b", "f", "x", true).unwrap();
        let project = remote.project("project-1").await.unwrap();

        project.rename_folder("/a", "c").await.unwrap();
        assert!(remote.has_folder("project-1", "/c/b"));
        assert!(!remote.has_folder("project-1", "/a"));
        assert_eq!(remote.describe_object(&id).unwrap().live.folder, "/c/b");

        project.new_folder("/d").await.unwrap();
        project
            .move_items(&[], &["/c/b".to_string()], "/d")
            .await
            .unwrap();
        assert_eq!(remote.describe_object(&id).unwrap().live.folder, "/d/b");

        assert!(project.remove_folder("/d/b").await.is_err());
        remote.object(&id).await.unwrap().remove("project-1").await.unwrap();
        project.remove_folder("/d/b").await.unwrap();
    }

    #[test]
    fn test_manifest_seeding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"projects":[{"id":"project-1","name":"demo","folders":["/empty"],
                "objects":[
                  {"class":"file","name":"a.txt","folder":"/docs","content":"hi"},
                  {"class":"table","name":"t","columns":["c"],"rows":[["x"],["yy"]]},
                  {"class":"record","name":"r","details":{"k":1},"types":["pipeline"]}
                ]}]}"#,
        )
        .unwrap();
        let remote = MemoryRemote::from_manifest(&path).unwrap();
        assert!(remote.has_folder("project-1", "/empty"));
        assert!(remote.has_folder("project-1", "/docs"));
        let file = remote.describe_object("file-00000001").unwrap();
        assert_eq!(file.live.size, Some(2));
        let table = remote.describe_object("gtable-00000002").unwrap();
        assert_eq!(table.live.size, Some(3));
    }
}
