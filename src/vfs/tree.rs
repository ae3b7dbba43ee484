//! Inode arena holding one generation of the mirrored namespace.
//!
//! Nodes are owned by the arena and linked by inode number: a directory maps
//! child names to inodes, every node records its parent. A rebuilt tree is a
//! `successor` of the previous one and reuses inode numbers for paths that
//! survive, so inodes the kernel still holds keep resolving.

use super::node::{FileType, Node, ROOT_INO, is_reserved_name};
use crate::error::{FsError, FsResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Collapses repeated separators; the result is always absolute.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits a normalized path into (parent, last segment). The root has no name.
pub fn split_path(path: &str) -> (String, String) {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) => ("/".into(), path[1..].into()),
        Some(n) => (path[..n].into(), path[n + 1..].into()),
        None => ("/".into(), path),
    }
}

pub struct Tree {
    nodes: HashMap<u64, Node>,
    inodes: Arc<AtomicU64>,
    carried: HashMap<String, (u64, FileType)>,
}

impl Tree {
    pub fn new(root: Node) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            inodes: Arc::new(AtomicU64::new(ROOT_INO + 1)),
            carried: HashMap::new(),
        };
        tree.install_root(root);
        tree
    }

    /// Empty tree for the next generation, sharing the inode counter.
    pub fn successor(&self, root: Node) -> Self {
        let carried = self
            .paths()
            .into_iter()
            .filter(|(_, ino, _)| *ino != ROOT_INO)
            .map(|(path, ino, kind)| (path, (ino, kind)))
            .collect();
        let mut tree = Self {
            nodes: HashMap::new(),
            inodes: self.inodes.clone(),
            carried,
        };
        tree.install_root(root);
        tree
    }

    fn install_root(&mut self, mut root: Node) {
        root.kind = FileType::Dir;
        root.ino = ROOT_INO;
        root.parent = None;
        root.name = String::new();
        self.nodes.insert(ROOT_INO, root);
    }

    /// Forgets inode numbers of paths that did not reappear.
    pub fn finish_build(&mut self) {
        self.carried.clear();
    }

    pub fn root(&self) -> &Node {
        &self.nodes[&ROOT_INO]
    }

    pub fn get(&self, ino: u64) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    pub fn get_mut(&mut self, ino: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&ino)
    }

    pub fn child_of(&self, parent: u64, name: &str) -> Option<u64> {
        let node = self.nodes.get(&parent)?;
        if !node.is_dir() {
            return None;
        }
        node.children.get(name).copied()
    }

    /// Resolves `rel` segment by segment starting at `from`.
    pub fn child(&self, from: u64, rel: &str) -> Option<u64> {
        rel.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(from, |cur, seg| self.child_of(cur, seg))
    }

    pub fn lookup(&self, path: &str) -> Option<u64> {
        self.child(ROOT_INO, path)
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        let mut parts = Vec::new();
        let mut cur = self.nodes.get(&ino)?;
        while let Some(parent) = cur.parent {
            parts.push(cur.name.as_str());
            if parts.len() > self.nodes.len() {
                return None;
            }
            cur = self.nodes.get(&parent)?;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// True when `ino` lies in the subtree rooted at `ancestor` (itself included).
    pub fn is_within(&self, ino: u64, ancestor: u64) -> bool {
        let mut cur = Some(ino);
        let mut steps = 0;
        while let Some(i) = cur {
            if i == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                return false;
            }
            cur = self.nodes.get(&i).and_then(|n| n.parent);
        }
        false
    }

    fn alloc_ino(&mut self, path: &str, kind: FileType) -> u64 {
        match self.carried.remove(path) {
            Some((ino, k)) if k == kind && !self.nodes.contains_key(&ino) => ino,
            _ => self.inodes.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn insert(&mut self, parent: u64, mut node: Node) -> FsResult<u64> {
        let parent_path = self
            .path_of(parent)
            .ok_or_else(|| FsError::NotFound(format!("inode {parent}")))?;
        let p = &self.nodes[&parent];
        if !p.is_dir() {
            return Err(FsError::NotADirectory(parent_path));
        }
        if node.name.is_empty() || is_reserved_name(&node.name) {
            return Err(FsError::InvalidArgument(format!(
                "invalid name {:?} under {parent_path}",
                node.name
            )));
        }
        if p.children.contains_key(&node.name) {
            return Err(FsError::AlreadyExists(join_path(&parent_path, &node.name)));
        }
        let ino = self.alloc_ino(&join_path(&parent_path, &node.name), node.kind);
        node.ino = ino;
        node.parent = Some(parent);
        if node.is_dir() {
            node.children.clear();
        }
        let name = node.name.clone();
        self.nodes.insert(ino, node);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.insert(name, ino);
        }
        Ok(ino)
    }

    /// mkdir -p: creates missing directories with `make`, returns the last one.
    pub fn mkdir_p(&mut self, path: &str, make: impl Fn(&str) -> Node) -> FsResult<u64> {
        let mut cur = ROOT_INO;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = match self.child_of(cur, seg) {
                Some(ino) if self.nodes[&ino].is_dir() => ino,
                Some(_) => {
                    return Err(FsError::NotADirectory(
                        self.path_of(cur).map_or_else(|| seg.to_string(), |p| join_path(&p, seg)),
                    ));
                }
                None => self.insert(cur, make(seg))?,
            };
        }
        Ok(cur)
    }

    /// Detaches `ino` from its parent and drops its whole subtree.
    pub fn remove(&mut self, ino: u64) -> Option<Node> {
        if ino == ROOT_INO {
            return None;
        }
        let node = self.nodes.remove(&ino)?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.remove(&node.name);
        }
        let mut stack: Vec<u64> = node.children.values().copied().collect();
        while let Some(i) = stack.pop() {
            if let Some(child) = self.nodes.remove(&i) {
                stack.extend(child.children.values().copied());
            }
        }
        Some(node)
    }

    /// Moves `ino` under `new_parent` as `new_name`; the subtree moves with it.
    pub fn rename(&mut self, ino: u64, new_parent: u64, new_name: &str) -> FsResult<()> {
        if ino == ROOT_INO {
            return Err(FsError::InvalidArgument("cannot move the root".into()));
        }
        if new_name.is_empty() || is_reserved_name(new_name) {
            return Err(FsError::InvalidArgument(format!("invalid name {new_name:?}")));
        }
        let target = self
            .nodes
            .get(&new_parent)
            .ok_or_else(|| FsError::NotFound(format!("inode {new_parent}")))?;
        if !target.is_dir() {
            return Err(FsError::NotADirectory(target.name.clone()));
        }
        if target.children.contains_key(new_name) {
            return Err(FsError::AlreadyExists(new_name.to_string()));
        }
        if self.is_within(new_parent, ino) {
            return Err(FsError::InvalidArgument(
                "cannot move a directory into itself".into(),
            ));
        }
        let node = self
            .nodes
            .get_mut(&ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))?;
        let old_parent = node.parent;
        let old_name = std::mem::replace(&mut node.name, new_name.to_string());
        node.parent = Some(new_parent);
        if let Some(p) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.remove(&old_name);
        }
        if let Some(p) = self.nodes.get_mut(&new_parent) {
            p.children.insert(new_name.to_string(), ino);
        }
        Ok(())
    }

    /// (path, inode, kind) of every node.
    fn paths(&self) -> Vec<(String, u64, FileType)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(ROOT_INO, String::from("/"))];
        while let Some((ino, path)) = stack.pop() {
            let Some(node) = self.nodes.get(&ino) else {
                continue;
            };
            for (name, &child) in &node.children {
                stack.push((child, join_path(&path, name)));
            }
            out.push((path, ino, node.kind));
        }
        out
    }
}
