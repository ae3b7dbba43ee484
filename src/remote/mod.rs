//! Remote object store interface
//!
//! The mirror only talks to the remote through the traits in this module:
//! - `RemoteApi`: entry point resolving project and object handles by id.
//! - `RemoteProject`: project-level calls (describe, folders, search, moves).
//! - `RemoteObject`: per data object calls (describe, read/write/close, tags).
//!
//! Submodules:
//! - `memory`: in-process implementation used by the dev mount and the tests.
//!
//! All timestamps exchanged here are milliseconds since the Unix epoch.
pub mod memory;

use crate::error::RemoteResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Class of a data object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    File,
    Table,
    Record,
    Applet,
}

/// Lifecycle of a data object. Content is only readable once `Closed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    #[default]
    Open,
    Closing,
    Closed,
}

/// Attributes that can change after creation. A cached copy is only a hint;
/// call `RemoteObject::describe` when the current value matters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveAttributes {
    pub name: String,
    pub folder: String,
    #[serde(default)]
    pub state: ObjectState,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Snapshot returned by a describe call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescription {
    // Fixed at creation.
    pub id: String,
    pub class: ObjectClass,
    pub project: String,
    pub created: i64,
    #[serde(flatten)]
    pub live: LiveAttributes,
}

impl ObjectDescription {
    pub fn is_closed(&self) -> bool {
        self.live.state == ObjectState::Closed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescription {
    pub id: String,
    pub name: String,
    pub modified: i64,
    /// Absolute folder paths, `/` included. Empty unless folders were requested.
    pub folders: Vec<String>,
}

/// One page of a data object search.
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    pub objects: Vec<ObjectDescription>,
    /// Cursor for the next page, `None` on the last one.
    pub next: Option<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn project(&self, id: &str) -> RemoteResult<Arc<dyn RemoteProject>>;

    async fn object(&self, id: &str) -> RemoteResult<Arc<dyn RemoteObject>>;
}

#[async_trait]
pub trait RemoteProject: Send + Sync {
    fn id(&self) -> &str;

    async fn describe(&self, with_folders: bool) -> RemoteResult<ProjectDescription>;

    async fn new_folder(&self, folder: &str) -> RemoteResult<()>;

    /// Renames `folder` in place; `name` is a single segment.
    async fn rename_folder(&self, folder: &str, name: &str) -> RemoteResult<()>;

    async fn remove_folder(&self, folder: &str) -> RemoteResult<()>;

    /// Moves objects and folders (with their contents) into `destination`.
    async fn move_items(
        &self,
        objects: &[String],
        folders: &[String],
        destination: &str,
    ) -> RemoteResult<()>;

    /// Data object search with descriptions, starting at `cursor`.
    async fn find_data_objects(&self, cursor: Option<String>) -> RemoteResult<SearchPage>;

    /// Creates an empty open file and returns its id.
    async fn new_file(&self, folder: &str, name: &str) -> RemoteResult<String>;
}

#[async_trait]
pub trait RemoteObject: Send + Sync {
    fn id(&self) -> &str;

    async fn describe(&self) -> RemoteResult<ObjectDescription>;

    /// Reads up to `len` bytes of a closed file starting at `offset`.
    async fn read(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>>;

    /// Appends to an open file.
    async fn write(&self, data: &[u8]) -> RemoteResult<()>;

    /// Finalizes the object. With `wait` the call returns once it is closed.
    async fn close(&self, wait: bool) -> RemoteResult<()>;

    async fn rename(&self, project: &str, name: &str) -> RemoteResult<()>;

    async fn add_tags(&self, project: &str, tags: &[String]) -> RemoteResult<()>;

    async fn add_properties(
        &self,
        project: &str,
        properties: &BTreeMap<String, String>,
    ) -> RemoteResult<()>;

    async fn remove(&self, project: &str) -> RemoteResult<()>;

    /// Table rows `[start, start + limit)`; fewer rows at the end of the table.
    async fn rows(&self, start: u64, limit: usize) -> RemoteResult<Vec<Vec<serde_json::Value>>>;

    /// Record details blob.
    async fn details(&self) -> RemoteResult<serde_json::Value>;
}

/// Converts a remote millisecond timestamp to whole seconds.
pub fn ms_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}
