//! FUSE adapter
//!
//! Implements the rfuse3 raw `Filesystem` trait on top of the path-based
//! `ProjectFs` dispatcher. Inode numbers come straight from the mirror tree;
//! every request maps its inode back to a path and calls the matching
//! dispatcher operation. File handles are stateless (fh = 0).
//!
//! Submodules:
//! - `mount`: mount options, unprivileged mount and the mount lifecycle service.
pub mod mount;

use crate::error::FsError;
use crate::vfs::tree::join_path;
use crate::vfs::{FileAttr as VfsFileAttr, FileType as VfsFileType, ProjectFs};
use bytes::Bytes;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite, ReplyXAttr,
};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use tracing::debug;

const MAX_WRITE: u32 = 1024 * 1024;

/// rfuse3 front end for a shared `ProjectFs`.
#[derive(Clone)]
pub struct FuseFs {
    fs: Arc<ProjectFs>,
}

impl FuseFs {
    pub fn new(fs: Arc<ProjectFs>) -> Self {
        Self { fs }
    }

    pub fn inner(&self) -> &Arc<ProjectFs> {
        &self.fs
    }

    fn ttl(&self) -> Duration {
        self.fs.config().attr_ttl
    }

    async fn path(&self, ino: u64) -> FuseResult<String> {
        self.fs.path_of(ino).await.map_err(errno)
    }

    async fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&self.path(parent).await?, name))
    }

    async fn attr(&self, path: &str) -> FuseResult<rfuse3::raw::reply::FileAttr> {
        let attr = self.fs.getattr(path).await.map_err(errno)?;
        Ok(to_fuse_attr(&attr))
    }

    async fn entry(&self, path: &str) -> FuseResult<ReplyEntry> {
        Ok(ReplyEntry {
            ttl: self.ttl(),
            attr: self.attr(path).await?,
            generation: 0,
        })
    }
}

impl Filesystem for FuseFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or(libc::EINVAL)?;
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        self.entry(&path).await
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino).await?;
        Ok(ReplyAttr {
            ttl: self.ttl(),
            attr: self.attr(&path).await?,
        })
    }

    // size truncates; mode/uid/gid/times are local metadata
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino).await?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await.map_err(errno)?;
        }
        if let Some(mode) = set_attr.mode {
            self.fs.chmod(&path, mode).await.map_err(errno)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.fs
                .chown(&path, set_attr.uid, set_attr.gid)
                .await
                .map_err(errno)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.fs
                .utimens(
                    &path,
                    set_attr.atime.map(|t| t.sec),
                    set_attr.mtime.map(|t| t.sec),
                )
                .await
                .map_err(errno)?;
        }
        Ok(ReplyAttr {
            ttl: self.ttl(),
            attr: self.attr(&path).await?,
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path(ino).await?;
        let target = self.fs.readlink(&path).await.map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        let target = link.to_str().ok_or(libc::EINVAL)?;
        self.fs.symlink(&path, target).await.map_err(errno)?;
        self.entry(&path).await
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name).await?;
        self.fs
            .mkdir(&path, mode & !umask)
            .await
            .map_err(errno)?;
        self.entry(&path).await
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name).await?;
        let attr = self.fs.create(&path, mode, None).await.map_err(errno)?;
        Ok(ReplyCreated {
            ttl: self.ttl(),
            attr: to_fuse_attr(&attr),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name).await?;
        self.fs.unlink(&path).await.map_err(errno)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name).await?;
        self.fs.rmdir(&path).await.map_err(errno)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_path(parent, name).await?;
        let to = self.child_path(new_parent, new_name).await?;
        self.fs.rename(&from, &to).await.map_err(errno)
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino).await?;
        let attr = self.fs.getattr(&path).await.map_err(errno)?;
        if attr.kind == VfsFileType::Dir {
            return Err(libc::EISDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino).await?;
        let attr = self.fs.getattr(&path).await.map_err(errno)?;
        if attr.kind != VfsFileType::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path(ino).await?;
        let data = self
            .fs
            .read(&path, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.path(ino).await?;
        let n = self.fs.write(&path, offset, data).await.map_err(errno)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path(ino).await?;
        let entries = self.fs.readdir(&path).await.map_err(errno)?;
        let parent = self.fs.parent_of(ino).await.map_err(errno)?;

        // offset is that of the last entry already returned
        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: parent,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, e) in entries.into_iter().enumerate() {
            all.push(DirectoryEntry {
                inode: e.ino,
                kind: fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 3,
            });
        }

        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let rest: Vec<DirectoryEntry> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(rest.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path(ino).await?;
        let entries = self.fs.readdir(&path).await.map_err(errno)?;
        let parent = self.fs.parent_of(ino).await.map_err(errno)?;
        let parent_path = self.path(parent).await?;
        let ttl = self.ttl();

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self.attr(&path).await?,
            entry_ttl: ttl,
            attr_ttl: ttl,
        });
        all.push(DirectoryEntryPlus {
            inode: parent,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: self.attr(&parent_path).await?,
            entry_ttl: ttl,
            attr_ttl: ttl,
        });
        for (i, e) in entries.into_iter().enumerate() {
            // Entries removed since the listing are skipped.
            let Ok(attr) = self.attr(&join_path(&path, &e.name)).await else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: e.ino,
                generation: 0,
                kind: fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 3,
                attr,
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let rest: Vec<DirectoryEntryPlus> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(rest.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.fs.statfs();
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.bsize,
        })
    }

    async fn setxattr(
        &self,
        _req: Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        let path = self.path(ino).await?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let value = std::str::from_utf8(value).map_err(|_| libc::EINVAL)?;
        self.fs.setxattr(&path, name, value).await.map_err(errno)
    }

    async fn getxattr(
        &self,
        _req: Request,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let path = self.path(ino).await?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let value = self.fs.getxattr(&path, name).await.map_err(errno)?;
        xattr_reply(value.into_bytes(), size)
    }

    async fn listxattr(&self, _req: Request, ino: u64, size: u32) -> FuseResult<ReplyXAttr> {
        let path = self.path(ino).await?;
        let names = self.fs.listxattr(&path).await.map_err(errno)?;
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        xattr_reply(buf, size)
    }

    async fn removexattr(&self, _req: Request, ino: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.path(ino).await?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.fs.removexattr(&path, name).await.map_err(errno)
    }

    async fn access(&self, _req: Request, ino: u64, _mask: u32) -> FuseResult<()> {
        let path = self.path(ino).await?;
        self.fs.getattr(&path).await.map_err(errno)?;
        Ok(())
    }

    // Stateless handles: nothing to release or sync.
    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}
}

// =============== helpers ===============

fn errno(e: FsError) -> rfuse3::Errno {
    match &e {
        FsError::NotFound(_) => debug!(error = %e, "fuse request"),
        _ => debug!(error = %e, errno = e.errno(), "fuse request failed"),
    }
    e.errno().into()
}

/// size 0 asks for the length; a too-small buffer is ERANGE.
fn xattr_reply(data: Vec<u8>, size: u32) -> FuseResult<ReplyXAttr> {
    let len = u32::try_from(data.len()).map_err(|_| libc::E2BIG)?;
    if size == 0 {
        Ok(ReplyXAttr::Size(len))
    } else if len > size {
        Err(libc::ERANGE.into())
    } else {
        Ok(ReplyXAttr::Data(Bytes::from(data)))
    }
}

fn fuse_kind(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
        VfsFileType::Symlink => FuseFileType::Symlink,
    }
}

fn to_fuse_attr(v: &VfsFileAttr) -> rfuse3::raw::reply::FileAttr {
    let ts = |secs: i64| Timestamp::new(secs, 0);
    rfuse3::raw::reply::FileAttr {
        ino: v.ino,
        size: v.size,
        blocks: v.size.div_ceil(512),
        atime: ts(v.atime),
        mtime: ts(v.mtime),
        ctime: ts(v.ctime),
        #[cfg(target_os = "macos")]
        crtime: ts(v.ctime),
        kind: fuse_kind(v.kind),
        perm: (v.mode & 0o7777) as u16,
        nlink: if v.kind == VfsFileType::Dir { 2 } else { 1 },
        uid: v.uid,
        gid: v.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::remote::memory::MemoryRemote;

    async fn fuse_fs() -> (MemoryRemote, FuseFs) {
        let remote = MemoryRemote::new();
        remote.add_project("project-1", "demo");
        remote.add_folder("project-1", "/docs").unwrap();
        remote
            .add_file("project-1", "/docs", "readme", "hello", true)
            .unwrap();
        let fs = ProjectFs::new(
            Arc::new(remote.clone()),
            MountConfig::new("project-1").unwrap(),
        )
        .await
        .unwrap();
        fs.refresh().await.unwrap();
        (remote, FuseFs::new(Arc::new(fs)))
    }

    #[test]
    fn test_xattr_reply_sizes() {
        assert!(matches!(
            xattr_reply(b"abc".to_vec(), 0),
            Ok(ReplyXAttr::Size(3))
        ));
        assert!(xattr_reply(b"abc".to_vec(), 2).is_err());
        assert!(matches!(
            xattr_reply(b"abc".to_vec(), 16),
            Ok(ReplyXAttr::Data(d)) if d.as_ref() == b"abc"
        ));
    }

    #[test]
    fn test_attr_conversion() {
        let attr = VfsFileAttr {
            ino: 7,
            kind: VfsFileType::Symlink,
            mode: 0o777,
            uid: 1000,
            gid: 100,
            size: 1025,
            atime: 1,
            mtime: 2,
            ctime: 3,
        };
        let f = to_fuse_attr(&attr);
        assert_eq!(f.ino, 7);
        assert_eq!(f.kind, FuseFileType::Symlink);
        assert_eq!(f.perm, 0o777);
        assert_eq!(f.blocks, 3);
        assert_eq!((f.uid, f.gid), (1000, 100));
        assert_eq!(f.mtime, Timestamp::new(2, 0));
    }

    #[tokio::test]
    async fn test_lookup_and_read_through_inodes() {
        let (_remote, fuse) = fuse_fs().await;
        let docs = fuse
            .lookup(Request::default(), 1, OsStr::new("docs"))
            .await
            .unwrap();
        assert_eq!(docs.attr.kind, FuseFileType::Directory);
        let readme = fuse
            .lookup(Request::default(), docs.attr.ino, OsStr::new("readme"))
            .await
            .unwrap();
        assert_eq!(readme.attr.size, 5);

        let data = fuse
            .read(Request::default(), readme.attr.ino, 0, 1, 3)
            .await
            .unwrap();
        assert_eq!(data.data.as_ref(), b"ell");

        assert!(
            fuse.lookup(Request::default(), 1, OsStr::new("nope"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_create_write_and_close_via_xattr() {
        let (remote, fuse) = fuse_fs().await;
        let created = fuse
            .create(Request::default(), 1, OsStr::new("out"), 0o644, 0)
            .await
            .unwrap();
        let ino = created.attr.ino;
        fuse.write(Request::default(), ino, 0, 0, b"data", 0, 0)
            .await
            .unwrap();
        fuse.setxattr(Request::default(), ino, OsStr::new("user.state"), b"closed", 0, 0)
            .await
            .unwrap();
        let attr = fuse.getattr(Request::default(), ino, None, 0).await.unwrap();
        assert_eq!(attr.attr.size, 4);

        let id = fuse.inner().remote_id("/out").await.unwrap().unwrap();
        assert!(remote.describe_object(&id).unwrap().is_closed());

        let size = fuse
            .getxattr(Request::default(), ino, OsStr::new("user.state"), 0)
            .await
            .unwrap();
        assert!(matches!(size, ReplyXAttr::Size(6)));
    }

    #[tokio::test]
    async fn test_readdir_lists_dot_entries_and_children() {
        use futures_util::StreamExt;

        let (_remote, fuse) = fuse_fs().await;
        let reply = fuse.readdir(Request::default(), 1, 0, 0).await.unwrap();
        let names: Vec<OsString> = reply
            .entries
            .map(|e| e.unwrap().name)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(names, vec![OsString::from("."), OsString::from(".."), OsString::from("docs")]);

        let reply = fuse.readdir(Request::default(), 1, 0, 2).await.unwrap();
        let rest: Vec<_> = reply.entries.collect::<Vec<_>>().await;
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_map_to_errno() {
        let (_remote, fuse) = fuse_fs().await;
        let docs = fuse
            .lookup(Request::default(), 1, OsStr::new("docs"))
            .await
            .unwrap();
        let err = fuse
            .rmdir(Request::default(), 1, OsStr::new("docs"))
            .await
            .unwrap_err();
        let io: std::io::Error = err.into();
        assert_eq!(io.raw_os_error(), Some(libc::ENOTEMPTY));

        let err = fuse
            .open(Request::default(), docs.attr.ino, 0)
            .await
            .unwrap_err();
        let io: std::io::Error = err.into();
        assert_eq!(io.raw_os_error(), Some(libc::EISDIR));
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::mount::MountService;
    use crate::config::MountConfig;
    use crate::remote::memory::MemoryRemote;
    use std::fs;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    // Real mount smoke test, only with PROJECTFS_FUSE_TEST=1.
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("PROJECTFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set PROJECTFS_FUSE_TEST=1 to enable");
            return;
        }

        let remote = MemoryRemote::new();
        remote.add_project("project-smoke", "smoke");
        remote
            .add_file("project-smoke", "/", "seed.txt", "seeded", true)
            .expect("seed");

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let config = MountConfig::new("project-smoke").expect("config");
        let service = match MountService::start(Arc::new(remote.clone()), config, &mnt_path).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {}", e);
                return;
            }
        };
        tokio::time::sleep(StdDuration::from_millis(2000)).await;

        let content = fs::read(mnt_path.join("seed.txt")).expect("read seeded");
        assert_eq!(content, b"seeded");

        let dir = mnt_path.join("a");
        fs::create_dir(&dir).expect("mkdir");
        assert!(remote.has_folder("project-smoke", "/a"));
        {
            let mut f = fs::File::create(dir.join("hello.txt")).expect("create file");
            f.write_all(b"abc").expect("write");
        }
        let list = fs::read_dir(&dir)
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect::<Vec<_>>();
        assert!(list.iter().any(|n| n.to_string_lossy() == "hello.txt"));

        if let Err(e) = service.shutdown().await {
            eprintln!("unmount error: {}", e);
        }
    }
}
