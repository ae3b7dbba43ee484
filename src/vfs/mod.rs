//! VFS layer
//!
//! Responsibilities:
//! - Keep an in-memory mirror of the remote project namespace and rebuild it
//!   when the project changes.
//! - Serve POSIX-style operations against the mirror and forward mutations to
//!   the remote store.
//!
//! Submodules:
//! - `node`: one filesystem entry and its lazily resolved remote handle
//! - `tree`: inode arena and path helpers
//! - `mirror`: tree builder, refresh cycle and background refresher
//! - `gate`: one-shot gate released after the first build
//! - `fs`: the operation dispatcher
pub mod fs;
pub mod gate;
pub mod mirror;
pub mod node;
pub mod tree;

pub use fs::{FsStats, ProjectFs};
pub use mirror::{MirrorState, MirrorStats, RefreshOutcome, spawn_refresher};
pub use node::{DirEntry, FileAttr, FileType};
