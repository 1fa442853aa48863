//! FUSE driver for sealfs.
//!
//! This module implements the fuser `Filesystem` trait on top of
//! [`EncryptedIo`]. File content (read, write, truncate) goes through the
//! encrypted I/O path; every other operation is a passthrough to the backing
//! directory.
//!
//! ## Operations
//!
//! | Operation | Handling |
//! |-----------|----------|
//! | read/write | staged, per-path locked, via the runtime bridge |
//! | setattr(size), open(O_TRUNC) | truncate through the core |
//! | getattr/lookup | backing metadata, plaintext size for regular files |
//! | release/unlink/rename | discard any staged copy |
//! | readdir | backing listing without reseal temporaries |
//! | create/mknod | new regular files get their encryption flag |
//! | xattr ops | passthrough; `user.encrypted` only changes on empty files |
//!
//! fuser dispatches callbacks from a single thread; each content operation
//! blocks that thread until the runtime finishes it or `op_timeout` passes.

use crate::bridge::{self, BridgeStats};
use crate::encrypted_io::EncryptedIo;
use crate::error::Result;
use crate::flags::{FlagStore, ENCRYPTION_ATTR};
use crate::inode::{InodeTable, ROOT_INO};
use crate::staging::is_sealing_temp;
use crate::streaming::CipherTransform;
use crate::xattr;
use filetime::FileTime;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::future::Future;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Attribute and entry cache lifetime handed to the kernel
const TTL: Duration = Duration::from_secs(1);

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SealFs<T, F> {
    io: Arc<EncryptedIo<T, F>>,
    inodes: InodeTable,
    runtime: Handle,
    op_timeout: Duration,
    encrypt_new_files: bool,
    stats: BridgeStats,
    next_fh: AtomicU64,
}

impl<T, F> SealFs<T, F>
where
    T: CipherTransform,
    F: FlagStore,
{
    pub fn new(io: Arc<EncryptedIo<T, F>>, runtime: Handle) -> Self {
        Self {
            io,
            inodes: InodeTable::new(),
            runtime,
            op_timeout: DEFAULT_OP_TIMEOUT,
            encrypt_new_files: true,
            stats: BridgeStats::default(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Whether files created through the mount are sealed
    pub fn with_encrypt_new_files(mut self, encrypt: bool) -> Self {
        self.encrypt_new_files = encrypt;
        self
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    fn run<Fut, R>(&self, future: Fut) -> Result<R>
    where
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        bridge::execute(&self.runtime, self.op_timeout, &self.stats, future)
    }

    fn vpath(&self, ino: u64) -> std::result::Result<PathBuf, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_vpath(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, c_int> {
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn backing(&self, vpath: &Path) -> std::result::Result<PathBuf, c_int> {
        self.io.resolver().resolve_backing(vpath).map_err(|e| e.to_errno())
    }

    fn attr(&self, ino: u64, backing: &Path) -> std::result::Result<FileAttr, c_int> {
        let meta = fs::symlink_metadata(backing).map_err(|e| errno(&e))?;
        let kind = file_kind(meta.file_type());
        let size = if kind == FileType::RegularFile {
            match self.io.plaintext_len_of(backing, meta.len()) {
                Ok(len) => len,
                Err(e) => {
                    warn!(path = %backing.display(), error = %e, "reporting sealed size");
                    meta.len()
                }
            }
        } else {
            meta.len()
        };

        Ok(FileAttr {
            ino,
            size,
            blocks: meta.blocks(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
            crtime: meta.created().unwrap_or(UNIX_EPOCH),
            kind,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        })
    }

    /// Counts a lookup on `vpath` and builds its entry reply
    fn entry(&self, vpath: &Path, backing: &Path) -> std::result::Result<FileAttr, c_int> {
        // Stat first so a failed lookup leaves no inode behind
        fs::symlink_metadata(backing).map_err(|e| errno(&e))?;
        let ino = self.inodes.lookup(vpath);
        self.attr(ino, backing)
    }

    /// Hands a node created by the daemon to the requesting user
    fn chown_to_requester(&self, req: &Request<'_>, backing: &Path) {
        hand_over(backing, req.uid(), req.gid());
    }

    /// Records the encryption flag of a new, empty regular file
    fn flag_new_file(&self, backing: &Path) -> std::result::Result<(), c_int> {
        match self.io.stager().flags().set_encrypted(backing, self.encrypt_new_files) {
            Ok(()) => Ok(()),
            // An unflagged file is already treated as encrypted
            Err(crate::SealFsError::Io(ref e))
                if self.encrypt_new_files && xattr::is_unsupported(e) =>
            {
                debug!(path = %backing.display(), "backing filesystem has no user xattrs");
                Ok(())
            }
            Err(e) => {
                warn!(path = %backing.display(), error = %e, "cannot flag new file, removing it");
                let _ = fs::remove_file(backing);
                Err(e.to_errno())
            }
        }
    }

    fn discard(&self, vpath: &Path) -> Result<()> {
        let io = Arc::clone(&self.io);
        let vpath = vpath.to_path_buf();
        self.run(async move { io.discard(&vpath).await })
    }

    fn truncate(&self, vpath: &Path, size: u64) -> Result<()> {
        let io = Arc::clone(&self.io);
        let vpath = vpath.to_path_buf();
        self.run(async move { io.truncate(&vpath, size).await })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        vpath: &Path,
        backing: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> std::result::Result<(), c_int> {
        if let Some(mode) = mode {
            fs::set_permissions(backing, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| errno(&e))?;
        }

        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(backing, uid, gid).map_err(|e| errno(&e))?;
        }

        if let Some(size) = size {
            self.truncate(vpath, size).map_err(|e| e.to_errno())?;
        }

        if atime.is_some() || mtime.is_some() {
            let meta = fs::symlink_metadata(backing).map_err(|e| errno(&e))?;
            let atime = atime
                .map(file_time)
                .unwrap_or_else(|| FileTime::from_last_access_time(&meta));
            let mtime = mtime
                .map(file_time)
                .unwrap_or_else(|| FileTime::from_last_modification_time(&meta));
            filetime::set_symlink_file_times(backing, atime, mtime).map_err(|e| errno(&e))?;
        }
        Ok(())
    }

    fn is_regular_file(backing: &Path) -> bool {
        fs::symlink_metadata(backing)
            .map(|m| m.file_type().is_file())
            .unwrap_or(false)
    }

    /// Opens or creates `backing` for `create`. A new file gets its flag; an
    /// existing one is truncated through the core under `O_TRUNC`. Returns
    /// whether the file was created.
    fn open_for_create(
        &self,
        vpath: &Path,
        backing: &Path,
        perm: u32,
        flags: i32,
    ) -> std::result::Result<bool, c_int> {
        let existed = fs::symlink_metadata(backing).is_ok();

        let mut options = fs::OpenOptions::new();
        options.write(true).mode(perm);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        options.open(backing).map_err(|e| errno(&e))?;

        if existed {
            if flags & libc::O_TRUNC != 0 {
                self.truncate(vpath, 0).map_err(|e| e.to_errno())?;
            }
        } else {
            self.flag_new_file(backing)?;
        }
        Ok(!existed)
    }

    /// Ends any read session on `ino` when the kernel releases a handle
    fn end_session(&self, ino: u64) {
        if let Some(vpath) = self.inodes.path(ino) {
            if let Err(e) = self.discard(&vpath) {
                warn!(path = %vpath.display(), error = %e, "failed to discard staging on release");
            }
        }
    }

    fn rename_entry(&self, from: &Path, to: &Path) -> std::result::Result<(), c_int> {
        let from_backing = self.backing(from)?;
        let to_backing = self.backing(to)?;

        for (vpath, backing) in [(from, &from_backing), (to, &to_backing)] {
            if Self::is_regular_file(backing) {
                self.discard(vpath).map_err(|e| e.to_errno())?;
            }
        }
        fs::rename(&from_backing, &to_backing).map_err(|e| errno(&e))?;
        self.io.stager().flags().rename_flag(&from_backing, &to_backing);
        self.inodes.rename(from, to);
        debug!(from = %from.display(), to = %to.display(), "renamed");
        Ok(())
    }

    fn unlink_entry(&self, vpath: &Path) -> std::result::Result<(), c_int> {
        let backing = self.backing(vpath)?;
        if Self::is_regular_file(&backing) {
            self.discard(vpath).map_err(|e| e.to_errno())?;
        }
        fs::remove_file(&backing).map_err(|e| errno(&e))?;
        self.io.stager().flags().remove_flag(&backing);
        self.inodes.remove_path(vpath);
        Ok(())
    }

    /// Refuses to change `user.encrypted` once a regular file has content;
    /// the stored bytes were written under the current flag
    fn check_flag_change(&self, vpath: &Path, backing: &Path) -> std::result::Result<(), c_int> {
        let meta = fs::symlink_metadata(backing).map_err(|e| errno(&e))?;
        if !meta.file_type().is_file() {
            return Ok(());
        }
        if meta.len() > 0 {
            warn!(path = %vpath.display(), "refusing to change the encryption flag of a non-empty file");
            return Err(libc::EPERM);
        }
        // Staged bytes were produced under the old flag
        self.discard(vpath).map_err(|e| e.to_errno())
    }

    /// Directory listing without reseal temporaries: `.`, `..`, then the
    /// children sorted by name
    fn list_dir(&self, ino: u64) -> std::result::Result<Vec<(u64, FileType, OsString)>, c_int> {
        let vpath = self.vpath(ino)?;
        let backing = self.backing(&vpath)?;
        let parent_ino = vpath
            .parent()
            .and_then(|p| self.inodes.peek(p))
            .unwrap_or(ROOT_INO);

        let mut entries: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        let mut children = Vec::new();
        for entry in fs::read_dir(&backing).map_err(|e| errno(&e))? {
            let entry = entry.map_err(|e| errno(&e))?;
            let name = entry.file_name();
            if is_sealing_temp(&name) {
                continue;
            }
            let kind = entry
                .file_type()
                .map(file_kind)
                .unwrap_or(FileType::RegularFile);
            let child_ino = self
                .inodes
                .peek(&vpath.join(&name))
                .unwrap_or_else(|| std::os::unix::fs::DirEntryExt::ino(&entry));
            children.push((child_ino, kind, name));
        }
        // Stable order across the calls of one listing
        children.sort_by(|a, b| a.2.cmp(&b.2));
        entries.extend(children);
        Ok(entries)
    }
}

impl<T, F> Filesystem for SealFs<T, F>
where
    T: CipherTransform,
    F: FlagStore,
{
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!(
            backing = %self.io.resolver().backing_root().display(),
            scratch = %self.io.resolver().scratch_root().display(),
            "filesystem initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let (started, completed, timed_out) = self.stats.snapshot();
        info!(started, completed, timed_out, "filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if is_sealing_temp(name) {
            reply.error(libc::ENOENT);
            return;
        }
        let result = self
            .child_vpath(parent, name)
            .and_then(|vpath| {
                let backing = self.backing(&vpath)?;
                self.entry(&vpath, &backing)
            });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| self.backing(&vpath))
            .and_then(|backing| self.attr(ino, &backing));
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.vpath(ino).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            self.apply_setattr(&vpath, &backing, mode, uid, gid, size, atime, mtime)?;
            self.attr(ino, &backing)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| self.backing(&vpath))
            .and_then(|backing| fs::read_link(backing).map_err(|e| errno(&e)));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_vpath(parent, name).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            let perm = mode & !umask & 0o7777;
            let kind = mode & libc::S_IFMT;
            if kind == libc::S_IFREG || kind == 0 {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(perm)
                    .open(&backing)
                    .map_err(|e| errno(&e))?;
                self.flag_new_file(&backing)?;
            } else {
                nix::sys::stat::mknod(
                    &backing,
                    nix::sys::stat::SFlag::from_bits_truncate(kind),
                    nix::sys::stat::Mode::from_bits_truncate(perm),
                    rdev as libc::dev_t,
                )
                .map_err(|e| e as c_int)?;
            }
            self.chown_to_requester(req, &backing);
            debug!(path = %vpath.display(), mode = format_args!("{:o}", mode), "mknod");
            self.entry(&vpath, &backing)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_vpath(parent, name).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            fs::DirBuilder::new()
                .mode(mode & !umask & 0o7777)
                .create(&backing)
                .map_err(|e| errno(&e))?;
            self.chown_to_requester(req, &backing);
            self.entry(&vpath, &backing)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .child_vpath(parent, name)
            .and_then(|vpath| self.unlink_entry(&vpath));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_vpath(parent, name).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            fs::remove_dir(&backing).map_err(|e| errno(&e))?;
            // Empty once every file below it is gone
            if let Ok(staging) = self.io.resolver().resolve_staging(&vpath) {
                let _ = fs::remove_dir(staging);
            }
            self.inodes.remove_path(&vpath);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_vpath(parent, link_name).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            std::os::unix::fs::symlink(target, &backing).map_err(|e| errno(&e))?;
            self.chown_to_requester(req, &backing);
            self.entry(&vpath, &backing)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.child_vpath(parent, name).and_then(|from| {
            let to = self.child_vpath(newparent, newname)?;
            self.rename_entry(&from, &to)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.vpath(ino).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            let new_vpath = self.child_vpath(newparent, newname)?;
            let new_backing = self.backing(&new_vpath)?;
            fs::hard_link(&backing, &new_backing).map_err(|e| errno(&e))?;
            self.io.stager().flags().link_flag(&backing, &new_backing);
            self.entry(&new_vpath, &new_backing)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.vpath(ino).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            let access = flags & libc::O_ACCMODE;
            let writable = access != libc::O_RDONLY;

            // Access check only; content goes through the core
            fs::OpenOptions::new()
                .read(access != libc::O_WRONLY)
                .write(writable)
                .open(&backing)
                .map_err(|e| errno(&e))?;

            if writable && flags & libc::O_TRUNC != 0 {
                self.truncate(&vpath, 0).map_err(|e| e.to_errno())?;
            }
            let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
            trace!(path = %vpath.display(), fh, flags, "open");
            Ok(fh)
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.vpath(ino).and_then(|vpath| {
            let io = Arc::clone(&self.io);
            self.run(async move { io.read_to_vec(&vpath, size as usize, offset as u64).await })
                .map_err(|e| e.to_errno())
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.vpath(ino).and_then(|vpath| {
            let io = Arc::clone(&self.io);
            let data = data.to_vec();
            self.run(async move { io.write(&vpath, &data, offset as u64).await })
                .map_err(|e| e.to_errno())
        });
        match result {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Writes are sealed before they return
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.end_session(ino);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| self.backing(&vpath))
            .and_then(|backing| {
                let file = fs::File::open(backing).map_err(|e| errno(&e))?;
                let synced = if datasync { file.sync_data() } else { file.sync_all() };
                synced.map_err(|e| errno(&e))
            });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = self.list_dir(ino);

        match listing {
            Ok(entries) => {
                for (i, (child_ino, kind, name)) in
                    entries.into_iter().enumerate().skip(offset.max(0) as usize)
                {
                    if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.io.resolver().backing_root()) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.vpath(ino).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            if name == ENCRYPTION_ATTR {
                self.check_flag_change(&vpath, &backing)?;
            }
            xattr::set(&backing, name, value, flags).map_err(|e| errno(&e))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| self.backing(&vpath))
            .and_then(|backing| xattr::get(&backing, name).map_err(|e| errno(&e)));
        match result {
            Ok(Some(value)) => reply_xattr(reply, size, &value),
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| self.backing(&vpath))
            .and_then(|backing| xattr::list(&backing).map_err(|e| errno(&e)));
        match result {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                reply_xattr(reply, size, &packed);
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.vpath(ino).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            if name == ENCRYPTION_ATTR {
                self.check_flag_change(&vpath, &backing)?;
            }
            xattr::remove(&backing, name).map_err(|e| errno(&e))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self.vpath(ino).and_then(|vpath| self.backing(&vpath)).and_then(|backing| {
            nix::unistd::access(&backing, nix::unistd::AccessFlags::from_bits_truncate(mask))
                .map_err(|e| e as c_int)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if is_sealing_temp(name) {
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.child_vpath(parent, name).and_then(|vpath| {
            let backing = self.backing(&vpath)?;
            if self.open_for_create(&vpath, &backing, mode & !umask & 0o7777, flags)? {
                self.chown_to_requester(req, &backing);
            }

            let attr = self.entry(&vpath, &backing)?;
            let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
            debug!(path = %vpath.display(), encrypted = self.encrypt_new_files, "created");
            Ok((attr, fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e),
        }
    }
}

/// Mounts `fs` at `mountpoint` and serves requests until unmounted
pub fn mount<T, F>(filesystem: SealFs<T, F>, mountpoint: &Path, allow_other: bool) -> io::Result<()>
where
    T: CipherTransform,
    F: FlagStore,
{
    let mut options = vec![
        MountOption::FSName("sealfs".to_string()),
        MountOption::Subtype("sealfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    info!(mountpoint = %mountpoint.display(), allow_other, "mounting");
    fuser::mount2(filesystem, mountpoint, &options)
}

/// Gives `backing` to `uid`/`gid` when the daemon runs as root; otherwise the
/// node already belongs to the caller
fn hand_over(backing: &Path, uid: u32, gid: u32) -> bool {
    if !nix::unistd::geteuid().is_root() {
        return false;
    }
    match std::os::unix::fs::lchown(backing, Some(uid), Some(gid)) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %backing.display(), error = %e, "failed to set owner of new node");
            false
        }
    }
}

fn errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn reply_xattr(reply: ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

fn file_kind(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn file_time(t: TimeOrNow) -> FileTime {
    match t {
        TimeOrNow::SpecificTime(t) => FileTime::from_system_time(t),
        TimeOrNow::Now => FileTime::now(),
    }
}
