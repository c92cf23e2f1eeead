//! Object handles and the operations on them
//!
//! A `Handle` wraps exactly one store node handle for the life of the
//! object wrapper. CoralFS has no file-descriptor abstraction and forbids
//! concurrent opens of a node, so every logical open funnels through the
//! per-handle share state and at most one store-level open is kept per
//! node; "is this node open at the store" is tracked next to the share
//! counters under the same object lock.
//!
//! Store calls block on network I/O. The object lock is dropped before
//! any store call that is not itself the serialization point; failed
//! opens compensate by restoring the counters they took.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::attr::{
    apply_umask, check_verifier, set_verifier, AttrList, AttrMask, NodeAttr, ObjectKind, Timespec,
    Verifier,
};
use crate::error::{ErrorMajor, FsalError, Result};
use crate::export::OpenState;
use crate::share::{ShareMode, ShareState};
use crate::store::{FileSystem, NodeGuard, NodeHandle, NodePtr, SetAttrMask};
use crate::wire::{self, DigestKind, NodeKey};

/// Context shared by an export and every handle constructed beneath it.
pub(crate) struct ExportCtx {
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) umask: u32,
}

/// How an open treats an existing or missing target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Open an existing object; never create.
    NoCreate,
    /// Create if missing; an existing object is simply opened. Tolerates
    /// races with concurrent creates and unlinks.
    Unchecked,
    /// Create only if missing; an existing object is an error.
    Guarded,
    /// Exclusive create carrying a verifier so a retried request can be
    /// recognized on the object it already created.
    Exclusive,
}

/// Caller credentials applied to created objects.
#[derive(Copy, Clone, Debug, Default)]
pub struct Creds {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

/// Result of a successful `open2`.
#[derive(Debug)]
pub struct Opened {
    /// Newly constructed handle when the open resolved a name.
    pub handle: Option<Arc<Handle>>,
    /// Attributes as of the open, when the path (re)fetched them.
    pub attrs: Option<NodeAttr>,
    /// True when the caller still needs to perform the permission check.
    pub caller_perm_check: bool,
}

/// Share bookkeeping guarded by the object lock.
#[derive(Default)]
struct ShareBook {
    share: ShareState,
    /// Effective open mode; `CLOSED` means not open at the store.
    open_mode: ShareMode,
}

/// The adapter's representation of one filesystem object.
///
/// Owns its store node handle exclusively unless it wraps the export
/// root's node, which the export owns; the node is released exactly once,
/// on drop. Type and ids derive from the construction-time attributes and
/// are immutable afterwards.
pub struct Handle {
    ctx: Arc<ExportCtx>,
    node: NodeHandle,
    owns_node: bool,
    kind: ObjectKind,
    fileid: u64,
    fsid: u64,
    book: RwLock<ShareBook>,
}

fn posix_open_flags(mode: ShareMode) -> i32 {
    let mut flags = if mode.contains(ShareMode::READ) && mode.contains(ShareMode::WRITE) {
        libc::O_RDWR
    } else if mode.contains(ShareMode::WRITE) {
        libc::O_WRONLY
    } else {
        libc::O_RDONLY
    };
    if mode.contains(ShareMode::TRUNC) {
        flags |= libc::O_TRUNC;
    }
    flags
}

impl Handle {
    /// Builds a handle around the node at `ptr`, acquiring a fresh store
    /// node handle for it. Nothing is installed on failure.
    pub(crate) fn construct(
        ctx: &Arc<ExportCtx>,
        ptr: NodePtr,
        attr: &NodeAttr,
    ) -> Result<Arc<Handle>> {
        let node = ctx.fs.get_node_handle(ptr).map_err(FsalError::from_store)?;
        Ok(Arc::new(Handle {
            ctx: ctx.clone(),
            node,
            owns_node: true,
            kind: attr.kind(),
            fileid: attr.ino,
            fsid: attr.dev,
            book: RwLock::new(ShareBook::default()),
        }))
    }

    /// Builds the export root handle around a node the export owns.
    pub(crate) fn construct_root(
        ctx: &Arc<ExportCtx>,
        node: NodeHandle,
        attr: &NodeAttr,
    ) -> Arc<Handle> {
        Arc::new(Handle {
            ctx: ctx.clone(),
            node,
            owns_node: false,
            kind: attr.kind(),
            fileid: attr.ino,
            fsid: attr.dev,
            book: RwLock::new(ShareBook::default()),
        })
    }

    /// The object type.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The numeric file id, fixed at construction.
    pub fn fileid(&self) -> u64 {
        self.fileid
    }

    /// The filesystem id, fixed at construction.
    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// The stable key naming this object, as used for wire handles and
    /// handle hashing.
    pub fn handle_to_key(&self) -> NodeKey {
        self.node.key
    }

    /// Writes this object's wire handle into `out`, returning the digest
    /// length.
    pub fn wire_digest(&self, kind: DigestKind, out: &mut [u8]) -> Result<usize> {
        wire::digest_key(kind, &self.node.key, out)
    }

    /// Looks up `name` under this directory and constructs a handle for
    /// the result.
    pub fn lookup(&self, name: &str) -> Result<(Arc<Handle>, NodeAttr)> {
        debug!(name, "lookup");
        let nh = self
            .ctx
            .fs
            .lookup_path(&self.node, name)
            .map_err(FsalError::from_store)?;
        let nh = NodeGuard::new(self.ctx.fs.as_ref(), nh);
        let attr = self
            .ctx
            .fs
            .get_attr(nh.node())
            .map_err(FsalError::from_store)?;
        let obj = Handle::construct(&self.ctx, nh.node().ptr, &attr)?;
        Ok((obj, attr))
    }

    /// Reads directory entries, invoking `entry` per name with a
    /// constructed handle and current attributes. Iteration runs to end
    /// of directory unless `entry` returns false; returns true at eof.
    pub fn readdir(
        &self,
        whence: Option<u64>,
        entry: &mut dyn FnMut(&str, Arc<Handle>, &NodeAttr, u64) -> bool,
    ) -> Result<bool> {
        debug!("readdir");
        let mut cursor = whence.unwrap_or(0);
        loop {
            let mut failed: Option<FsalError> = None;
            let mut stopped = false;
            let eof = self
                .ctx
                .fs
                .read_dir(&self.node, &mut cursor, &mut |name, cookie| {
                    match self.lookup(name) {
                        Ok((obj, attr)) => {
                            if entry(name, obj, &attr, cookie) {
                                true
                            } else {
                                stopped = true;
                                false
                            }
                        }
                        Err(err) => {
                            failed = Some(err);
                            false
                        }
                    }
                })
                .map_err(FsalError::from_store)?;
            if let Some(err) = failed {
                return Err(err);
            }
            if stopped {
                return Ok(false);
            }
            if eof {
                return Ok(true);
            }
        }
    }

    /// Creates an empty regular file under this directory.
    pub fn create(
        &self,
        name: &str,
        attrs_in: &AttrList,
        creds: Creds,
    ) -> Result<(Arc<Handle>, NodeAttr)> {
        debug!(name, "create");
        let st_in = NodeAttr {
            uid: creds.uid,
            gid: creds.gid,
            mode: apply_umask(attrs_in.attrs.mode, self.ctx.umask),
            ..NodeAttr::default()
        };
        let (nh, st) = self
            .ctx
            .fs
            .create(&self.node, name, &st_in, 0)
            .map_err(FsalError::from_store)?;
        let nh = NodeGuard::new(self.ctx.fs.as_ref(), nh);
        let obj = Handle::construct(&self.ctx, nh.node().ptr, &st)?;
        Ok((obj, st))
    }

    /// Creates a directory under this directory.
    pub fn mkdir(
        &self,
        name: &str,
        attrs_in: &AttrList,
        creds: Creds,
    ) -> Result<(Arc<Handle>, NodeAttr)> {
        debug!(name, "mkdir");
        let st_in = NodeAttr {
            uid: creds.uid,
            gid: creds.gid,
            mode: apply_umask(attrs_in.attrs.mode, self.ctx.umask),
            ..NodeAttr::default()
        };
        let (nh, st) = self
            .ctx
            .fs
            .mkdir(&self.node, name, &st_in)
            .map_err(FsalError::from_store)?;
        let nh = NodeGuard::new(self.ctx.fs.as_ref(), nh);
        let obj = Handle::construct(&self.ctx, nh.node().ptr, &st)?;
        Ok((obj, st))
    }

    /// Freshens and returns this object's attributes.
    pub fn getattrs(&self) -> Result<NodeAttr> {
        self.ctx
            .fs
            .get_attr(&self.node)
            .map_err(FsalError::from_store)
    }

    /// Sets attributes named by the list's mask.
    ///
    /// Attributes outside the settable set are rejected. A size change
    /// requires a regular file and a share compatible with writing,
    /// checked under the object lock; `bypass` relaxes the deny checks
    /// the way an open bypass would.
    pub fn setattr2(&self, bypass: bool, attrs: &AttrList) -> Result<()> {
        debug!(mask = ?attrs.mask, "setattr2");
        if !attrs.mask.without(AttrMask::SETTABLE).is_empty() {
            return Err(FsalError::inval());
        }

        if attrs.mask.contains(AttrMask::SIZE) {
            if self.kind != ObjectKind::RegularFile {
                return Err(FsalError::new(ErrorMajor::Inval, libc::EINVAL));
            }
            // lock released before the blocking truncate
            self.book
                .read()
                .share
                .check_conflict(ShareMode::RDWR, bypass)?;
            self.ctx
                .fs
                .truncate(&self.node, attrs.attrs.size)
                .map_err(FsalError::from_store)?;
        }

        let mut st = NodeAttr::default();
        let mut mask = SetAttrMask::empty();
        if attrs.mask.contains(AttrMask::MODE) {
            mask |= SetAttrMask::MODE;
            st.mode = apply_umask(attrs.attrs.mode, self.ctx.umask);
        }
        if attrs.mask.contains(AttrMask::OWNER) {
            mask |= SetAttrMask::UID;
            st.uid = attrs.attrs.uid;
        }
        if attrs.mask.contains(AttrMask::GROUP) {
            mask |= SetAttrMask::GID;
            st.gid = attrs.attrs.gid;
        }
        if attrs.mask.contains(AttrMask::ATIME) {
            mask |= SetAttrMask::ATIME;
            st.atime = attrs.attrs.atime;
        }
        if attrs.mask.contains(AttrMask::ATIME_SERVER) {
            mask |= SetAttrMask::ATIME;
            st.atime = Timespec::now();
        }
        if attrs.mask.contains(AttrMask::MTIME) {
            mask |= SetAttrMask::MTIME;
            st.mtime = attrs.attrs.mtime;
        }
        if attrs.mask.contains(AttrMask::MTIME_SERVER) {
            mask |= SetAttrMask::MTIME;
            st.mtime = Timespec::now();
        }
        if attrs.mask.contains(AttrMask::CTIME) {
            mask |= SetAttrMask::CTIME;
            st.ctime = attrs.attrs.ctime;
        }

        if !mask.is_empty() {
            self.ctx
                .fs
                .set_attr(&self.node, &st, mask)
                .map_err(FsalError::from_store)?;
        }
        Ok(())
    }

    /// Removes `name` from this directory.
    pub fn unlink(&self, name: &str) -> Result<()> {
        debug!(name, "unlink");
        self.ctx
            .fs
            .unlink(&self.node, name)
            .map_err(FsalError::from_store)
    }

    /// Renaming is not wired to the store; callers receive not-supported.
    pub fn rename(&self, _old_name: &str, _new_dir: &Handle, _new_name: &str) -> Result<()> {
        Err(FsalError::not_supported())
    }

    /// Opens this object (no name) or a named child, possibly creating
    /// it.
    ///
    /// With a share-bearing state the reservation is taken before the
    /// store open and rolled back if the open fails; no reservation
    /// survives a failed open. Without a state (a stateless NFSv3-style
    /// create) there are no counters to compensate and the object lock
    /// itself serializes the store open.
    #[allow(clippy::too_many_arguments)]
    pub fn open2(
        &self,
        state: Option<&OpenState>,
        mode: ShareMode,
        createmode: CreateMode,
        name: Option<&str>,
        attrs_in: Option<&AttrList>,
        verifier: Verifier,
        creds: Creds,
    ) -> Result<Opened> {
        debug!(?name, ?createmode, "open2");
        let truncated = mode.contains(ShareMode::TRUNC);

        let mut set_list = attrs_in.cloned();
        if createmode == CreateMode::Exclusive {
            let list = set_list.get_or_insert_with(AttrList::empty);
            set_verifier(list, verifier);
        }

        let Some(name) = name else {
            return self.open_by_handle(state, mode, createmode, truncated, verifier);
        };

        if createmode == CreateMode::NoCreate {
            // the store has no open-by-name: look the object up, then
            // open it by handle
            let (temp, _) = self.lookup(name)?;
            let mut opened =
                temp.open2(state, mode, CreateMode::NoCreate, None, None, verifier, creds)?;
            opened.handle = Some(temp);
            return Ok(opened);
        }

        // create path; try exclusive first even for unchecked so
        // attributes can be set safely afterwards
        let mut posix_flags = posix_open_flags(mode) | libc::O_CREAT;
        if createmode != CreateMode::Unchecked || set_list.is_some() {
            posix_flags |= libc::O_EXCL;
        }

        let unix_mode = match set_list.as_mut() {
            Some(list) if list.mask.contains(AttrMask::MODE) => {
                // the mode goes in at create time, not via setattr
                let m = apply_umask(list.attrs.mode, self.ctx.umask);
                list.mask = list.mask.without(AttrMask::MODE);
                m
            }
            _ => 0o600,
        };
        let st_in = NodeAttr {
            uid: creds.uid,
            gid: creds.gid,
            mode: unix_mode,
            ..NodeAttr::default()
        };

        let first = self.ctx.fs.create(&self.node, name, &st_in, posix_flags);
        let (nh, st) = match first {
            Err(rc) if rc == -libc::EEXIST && createmode == CreateMode::Unchecked => {
                // the exclusive attempt existed only to set attributes
                // safely; retry without it, attributes dropped
                posix_flags &= !libc::O_EXCL;
                self.ctx
                    .fs
                    .create(&self.node, name, &st_in, posix_flags)
                    .map_err(FsalError::from_store)?
            }
            other => other.map_err(FsalError::from_store)?,
        };
        let nh = NodeGuard::new(self.ctx.fs.as_ref(), nh);

        // whether this call created the object; in the unchecked retry
        // an existing file may have been re-created under us unnoticed
        let created = posix_flags & libc::O_EXCL != 0;

        let obj = Handle::construct(&self.ctx, nh.node().ptr, &st)?;

        if let Err(rc) = self.ctx.fs.open(&obj.node, posix_flags) {
            if created {
                if let Err(undo) = self.ctx.fs.unlink(&self.node, name) {
                    warn!(name, undo, "could not remove created file after failed open");
                }
            }
            return Err(FsalError::from_store(rc));
        }
        obj.book.write().open_mode = mode;

        let mut attrs_out = st;
        if created && set_list.as_ref().is_some_and(|l| !l.mask.is_empty()) {
            // remaining attributes only when we created the file; a
            // failure leaves the created file behind
            let list = set_list.as_ref().unwrap();
            if let Err(err) = obj.setattr2(false, list) {
                if let Err(rc) = self.ctx.fs.close(&obj.node) {
                    warn!(rc, "close after failed post-create setattr");
                }
                return Err(err);
            }
            match obj.getattrs() {
                Ok(attr) => attrs_out = attr,
                Err(err) => {
                    // the creation is not rolled back for a failed
                    // attribute read
                    if let Err(rc) = self.ctx.fs.close(&obj.node) {
                        warn!(rc, "close after failed post-create getattr");
                    }
                    return Err(err);
                }
            }
        }

        if state.is_some() {
            let mut book = obj.book.write();
            book.share.update_counters(ShareMode::CLOSED, mode);
        }

        Ok(Opened {
            handle: Some(obj),
            attrs: Some(attrs_out),
            caller_perm_check: false,
        })
    }

    fn open_by_handle(
        &self,
        state: Option<&OpenState>,
        mode: ShareMode,
        createmode: CreateMode,
        truncated: bool,
        verifier: Verifier,
    ) -> Result<Opened> {
        let posix_flags = posix_open_flags(mode);

        if state.is_none() {
            // stateless open: no counters to roll back, so the lock is
            // held across the store open to keep stateless opens serial
            let mut book = self.book.write();
            if !book.open_mode.has_access() {
                self.ctx
                    .fs
                    .open(&self.node, posix_flags)
                    .map_err(FsalError::from_store)?;
            }
            book.open_mode = mode;
            let attrs = self.refresh_after_open(createmode, truncated, verifier)?;
            return Ok(Opened {
                handle: None,
                attrs,
                caller_perm_check: true,
            });
        }

        let prev_mode;
        let need_open;
        {
            let mut book = self.book.write();
            book.share.check_conflict(mode, false)?;
            book.share.update_counters(ShareMode::CLOSED, mode);
            prev_mode = book.open_mode;
            need_open = !prev_mode.has_access();
            book.open_mode = mode;
        }

        if need_open {
            if let Err(rc) = self.ctx.fs.open(&self.node, posix_flags) {
                // no reservation may survive a failed open
                let mut book = self.book.write();
                book.share.update_counters(mode, ShareMode::CLOSED);
                book.open_mode = prev_mode;
                return Err(FsalError::from_store(rc));
            }
        }

        match self.refresh_after_open(createmode, truncated, verifier) {
            Ok(attrs) => Ok(Opened {
                handle: None,
                attrs,
                caller_perm_check: true,
            }),
            Err(err) => {
                if need_open {
                    if let Err(rc) = self.ctx.fs.close(&self.node) {
                        warn!(rc, "close after failed open refresh");
                    }
                }
                let mut book = self.book.write();
                book.share.update_counters(mode, ShareMode::CLOSED);
                book.open_mode = prev_mode;
                Err(err)
            }
        }
    }

    /// Attribute refresh after an open-by-handle: exclusive creates check
    /// the verifier against the current attributes, truncating opens
    /// refetch the size.
    fn refresh_after_open(
        &self,
        createmode: CreateMode,
        truncated: bool,
        verifier: Verifier,
    ) -> Result<Option<NodeAttr>> {
        if createmode != CreateMode::Exclusive && !truncated {
            return Ok(None);
        }
        let attr = self.getattrs()?;
        if createmode == CreateMode::Exclusive && !check_verifier(&attr, verifier) {
            return Err(FsalError::new(ErrorMajor::Exist, libc::EEXIST));
        }
        Ok(Some(attr))
    }

    /// Changes the access mode of an existing share-bearing open.
    ///
    /// The new mode is validated against the other holders only; a store
    /// open is issued only when the node is not already open there.
    pub fn reopen2(&self, mode: ShareMode) -> Result<()> {
        debug!("reopen2");
        let posix_flags = posix_open_flags(mode);
        let prev_mode;
        let need_open;
        {
            let mut book = self.book.write();
            prev_mode = book.open_mode;
            book.share.try_transition(prev_mode, mode, false)?;
            need_open = !prev_mode.has_access();
            book.open_mode = mode;
        }

        if need_open {
            if let Err(rc) = self.ctx.fs.open(&self.node, posix_flags) {
                let mut book = self.book.write();
                book.share.update_counters(mode, prev_mode);
                book.open_mode = prev_mode;
                return Err(FsalError::from_store(rc));
            }
        }
        Ok(())
    }

    /// Reads from the file at `offset` into `buf`, returning the byte
    /// count and whether end of file was reached.
    pub fn read2(&self, offset: u64, buf: &mut [u8]) -> Result<(usize, bool)> {
        debug!(offset, len = buf.len(), "read2");
        let n = self
            .ctx
            .fs
            .read(&self.node, offset, buf)
            .map_err(FsalError::from_store)?;
        Ok((n, n == 0))
    }

    /// Writes `data` at `offset`. With `stable` set the data is committed
    /// to stable storage before returning; the result reports the byte
    /// count and whether the write is stable.
    pub fn write2(&self, offset: u64, data: &[u8], stable: bool) -> Result<(usize, bool)> {
        debug!(offset, len = data.len(), stable, "write2");
        let n = self
            .ctx
            .fs
            .write(&self.node, offset, data)
            .map_err(FsalError::from_store)?;
        if stable {
            self.ctx
                .fs
                .commit(&self.node, 0, 0)
                .map_err(FsalError::from_store)?;
        }
        Ok((n, stable))
    }

    /// Flushes the byte range to stable storage.
    pub fn commit2(&self, offset: u64, len: u64) -> Result<()> {
        debug!(offset, len, "commit2");
        self.ctx
            .fs
            .commit(&self.node, offset, len)
            .map_err(FsalError::from_store)
    }

    /// Closes for the given upper-layer state. Share-bearing states give
    /// up their reservation before the store close; other state kinds do
    /// not touch the counters.
    pub fn close2(&self, state: Option<&OpenState>) -> Result<()> {
        debug!("close2");
        if let Some(st) = state {
            if st.kind.bears_share() {
                let mut book = self.book.write();
                let mode = book.open_mode;
                book.share.update_counters(mode, ShareMode::CLOSED);
            }
        }
        self.ctx
            .fs
            .close(&self.node)
            .map_err(FsalError::from_store)?;
        self.book.write().open_mode = ShareMode::CLOSED;
        Ok(())
    }

    /// Closes the handle-wide open, outside any state.
    pub fn close(&self) -> Result<()> {
        self.close2(None)
    }

    /// The currently-effective open mode.
    pub fn status2(&self) -> ShareMode {
        self.book.read().open_mode
    }

    /// Folds a duplicate handle's reservations into this one.
    ///
    /// The upper layer calls this when a second handle resolved to the
    /// same underlying node; incompatible reservations are denied and the
    /// caller releases the duplicate either way.
    pub fn merge(&self, dupe: &Handle) -> Result<()> {
        if self.kind != ObjectKind::RegularFile || dupe.kind != ObjectKind::RegularFile {
            return Ok(());
        }
        let dupe_share = dupe.book.read().share.clone();
        let mut book = self.book.write();
        book.share.merge(&dupe_share)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind)
            .field("fileid", &self.fileid)
            .field("fsid", &self.fsid)
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.owns_node {
            self.ctx.fs.free_node_handle(&self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::StateKind;
    use crate::mock::MockFileSystem;
    use std::sync::Barrier;

    const NO_VERIFIER: Verifier = [0; 8];

    fn test_ctx(umask: u32) -> (Arc<MockFileSystem>, Arc<ExportCtx>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let fs = MockFileSystem::new(1);
        let ctx = Arc::new(ExportCtx {
            fs: fs.clone() as Arc<dyn FileSystem>,
            umask,
        });
        (fs, ctx)
    }

    fn make_root(fs: &Arc<MockFileSystem>, ctx: &Arc<ExportCtx>) -> Arc<Handle> {
        let tmp = fs.get_node_handle(fs.root_ptr()).unwrap();
        let attr = fs.get_attr(&tmp).unwrap();
        fs.free_node_handle(&tmp);
        Handle::construct(ctx, fs.root_ptr(), &attr).unwrap()
    }

    fn make_file(root: &Handle, name: &str) -> Arc<Handle> {
        let (obj, _) = root
            .create(name, &AttrList::with_mode(0o644), Creds::default())
            .unwrap();
        obj
    }

    fn share_state(h: &Handle) -> ShareState {
        h.book.read().share.clone()
    }

    fn share_open_state() -> OpenState {
        OpenState {
            kind: StateKind::Share,
            mode: ShareMode::CLOSED,
        }
    }

    #[test]
    fn test_construct_and_drop_release_node_once() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let child = make_file(&root, "f");

        let live_before = fs.live_handle_count();
        let freed_before = fs.handles_freed();
        drop(child);
        assert_eq!(fs.live_handle_count(), live_before - 1);
        assert_eq!(fs.handles_freed(), freed_before + 1);
        assert_eq!(fs.double_frees(), 0);

        // the root handle is untouched
        assert!(root.getattrs().is_ok());
    }

    #[test]
    fn test_root_handle_does_not_own_its_node() {
        let (fs, ctx) = test_ctx(0);
        let node = fs.get_node_handle(fs.root_ptr()).unwrap();
        let attr = fs.get_attr(&node).unwrap();
        let root = Handle::construct_root(&ctx, node.clone(), &attr);
        let freed_before = fs.handles_freed();
        drop(root);
        assert_eq!(fs.handles_freed(), freed_before);
        fs.free_node_handle(&node);
        assert_eq!(fs.double_frees(), 0);
    }

    #[test]
    fn test_lookup_missing_yields_not_found_without_leak() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let live_before = fs.live_handle_count();
        let err = root.lookup("missing-name").unwrap_err();
        assert_eq!(err.major, ErrorMajor::NoEnt);
        assert_eq!(fs.live_handle_count(), live_before);
    }

    #[test]
    fn test_lookup_roundtrip() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let created = make_file(&root, "f");
        let (found, attr) = root.lookup("f").unwrap();
        assert_eq!(found.handle_to_key(), created.handle_to_key());
        assert_eq!(attr.kind(), ObjectKind::RegularFile);
        assert_eq!(found.fileid(), attr.ino);
    }

    #[test]
    fn test_create_applies_umask() {
        let (fs, ctx) = test_ctx(0o022);
        let root = make_root(&fs, &ctx);
        let (_, attr) = root
            .create("f", &AttrList::with_mode(0o666), Creds { uid: 10, gid: 20 })
            .unwrap();
        assert_eq!(attr.mode & 0o7777, 0o644);
        assert_eq!(attr.uid, 10);
        assert_eq!(attr.gid, 20);
    }

    #[test]
    fn test_mkdir_makes_directory() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let (dir, attr) = root
            .mkdir("d", &AttrList::with_mode(0o755), Creds::default())
            .unwrap();
        assert_eq!(dir.kind(), ObjectKind::Directory);
        assert_eq!(attr.kind(), ObjectKind::Directory);
    }

    #[test]
    fn test_unlink_then_lookup_not_found() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let _f = make_file(&root, "f");
        root.unlink("f").unwrap();
        assert_eq!(root.lookup("f").unwrap_err().major, ErrorMajor::NoEnt);
    }

    #[test]
    fn test_rename_is_not_supported() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let err = root.rename("a", &root, "b").unwrap_err();
        assert_eq!(err.major, ErrorMajor::NotSupported);
    }

    #[test]
    fn test_readdir_lists_all_entries() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        for name in ["a", "b", "c"] {
            make_file(&root, name);
        }
        let mut seen = Vec::new();
        let eof = root
            .readdir(None, &mut |name, obj, attr, _cookie| {
                assert_eq!(obj.fileid(), attr.ino);
                seen.push(name.to_string());
                true
            })
            .unwrap();
        assert!(eof);
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn test_readdir_resumes_from_cookie() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        for name in ["a", "b", "c"] {
            make_file(&root, name);
        }
        let mut last_cookie = 0;
        let eof = root
            .readdir(None, &mut |_name, _obj, _attr, cookie| {
                last_cookie = cookie;
                false
            })
            .unwrap();
        assert!(!eof);
        let mut rest = Vec::new();
        let eof = root
            .readdir(Some(last_cookie), &mut |name, _obj, _attr, _cookie| {
                rest.push(name.to_string());
                true
            })
            .unwrap();
        assert!(eof);
        assert_eq!(rest, ["b", "c"]);
    }

    #[test]
    fn test_setattr_rejects_unsettable_attrs() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let list = AttrList {
            mask: AttrMask::MODE | AttrMask::TYPE,
            attrs: NodeAttr::default(),
        };
        assert_eq!(f.setattr2(false, &list).unwrap_err().major, ErrorMajor::Inval);
    }

    #[test]
    fn test_setattr_size_on_directory_is_invalid() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let list = AttrList {
            mask: AttrMask::SIZE,
            attrs: NodeAttr {
                size: 0,
                ..NodeAttr::default()
            },
        };
        let err = root.setattr2(false, &list).unwrap_err();
        assert_eq!(err.major, ErrorMajor::Inval);
        assert_eq!(err.minor, libc::EINVAL);
    }

    #[test]
    fn test_setattr_truncates_file() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        f.write2(0, b"hello world", false).unwrap();
        let list = AttrList {
            mask: AttrMask::SIZE,
            attrs: NodeAttr {
                size: 5,
                ..NodeAttr::default()
            },
        };
        f.setattr2(false, &list).unwrap();
        assert_eq!(f.getattrs().unwrap().size, 5);
    }

    #[test]
    fn test_setattr_size_respects_deny_write() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::READ | ShareMode::DENY_WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        let list = AttrList {
            mask: AttrMask::SIZE,
            attrs: NodeAttr {
                size: 0,
                ..NodeAttr::default()
            },
        };
        assert_eq!(
            f.setattr2(false, &list).unwrap_err().major,
            ErrorMajor::ShareDenied
        );
        // bypass relaxes the deny check
        assert!(f.setattr2(true, &list).is_ok());
    }

    #[test]
    fn test_setattr_mode_and_owner() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let list = AttrList {
            mask: AttrMask::MODE | AttrMask::OWNER | AttrMask::GROUP,
            attrs: NodeAttr {
                mode: 0o600,
                uid: 42,
                gid: 43,
                ..NodeAttr::default()
            },
        };
        f.setattr2(false, &list).unwrap();
        let attr = f.getattrs().unwrap();
        assert_eq!(attr.mode & 0o7777, 0o600);
        assert_eq!(attr.uid, 42);
        assert_eq!(attr.gid, 43);
    }

    #[test]
    fn test_open2_by_handle_takes_share_and_opens_store() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        let opened = f
            .open2(
                Some(&state),
                ShareMode::READ,
                CreateMode::NoCreate,
                None,
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap();
        assert!(opened.handle.is_none());
        assert!(opened.caller_perm_check);
        assert_eq!(fs.opens(), 1);
        assert_eq!(f.status2(), ShareMode::READ);

        // a second compatible open shares the store-level open
        let state2 = share_open_state();
        f.open2(
            Some(&state2),
            ShareMode::READ,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        assert_eq!(fs.opens(), 1);
    }

    #[test]
    fn test_open2_conflicting_share_denied() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::READ | ShareMode::DENY_WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        let before = share_state(&f);
        let state2 = share_open_state();
        let err = f
            .open2(
                Some(&state2),
                ShareMode::WRITE,
                CreateMode::NoCreate,
                None,
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap_err();
        assert_eq!(err.major, ErrorMajor::ShareDenied);
        assert_eq!(share_state(&f), before);
    }

    #[test]
    fn test_open2_failed_store_open_restores_share() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let before = share_state(&f);
        fs.fail_next_open(-libc::EIO);
        let state = share_open_state();
        let err = f
            .open2(
                Some(&state),
                ShareMode::RDWR,
                CreateMode::NoCreate,
                None,
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap_err();
        assert_eq!(err.major, ErrorMajor::Io);
        assert_eq!(share_state(&f), before);
        assert_eq!(f.status2(), ShareMode::CLOSED);
        assert_eq!(fs.open_node_count(), 0);
    }

    #[test]
    fn test_concurrent_conflicting_opens_one_winner() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let barrier = Barrier::new(2);

        let results: Vec<Result<Opened>> = std::thread::scope(|s| {
            let modes = [
                ShareMode::READ | ShareMode::DENY_WRITE,
                ShareMode::WRITE,
            ];
            let handles: Vec<_> = modes
                .into_iter()
                .map(|mode| {
                    let f = &f;
                    let barrier = &barrier;
                    s.spawn(move || {
                        let state = share_open_state();
                        barrier.wait();
                        f.open2(
                            Some(&state),
                            mode,
                            CreateMode::NoCreate,
                            None,
                            None,
                            NO_VERIFIER,
                            Creds::default(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let denied = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.major == ErrorMajor::ShareDenied))
            .count();
        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 1);
        assert_eq!(denied, 1);
    }

    #[test]
    fn test_close2_share_state_releases_reservation() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::RDWR,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        assert!(!share_state(&f).is_closed());

        f.close2(Some(&state)).unwrap();
        assert!(share_state(&f).is_closed());
        assert_eq!(f.status2(), ShareMode::CLOSED);
        assert_eq!(fs.open_node_count(), 0);
    }

    #[test]
    fn test_close2_non_share_state_keeps_counters() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::READ,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        let lock_state = OpenState {
            kind: StateKind::Lock,
            mode: ShareMode::CLOSED,
        };
        f.close2(Some(&lock_state)).unwrap();
        // the reservation is still held even though the store open closed
        assert!(!share_state(&f).is_closed());
    }

    #[test]
    fn test_reopen2_upgrades_without_new_store_open() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::READ,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        assert_eq!(fs.opens(), 1);
        f.reopen2(ShareMode::RDWR).unwrap();
        assert_eq!(fs.opens(), 1);
        assert_eq!(f.status2(), ShareMode::RDWR);
    }

    #[test]
    fn test_reopen2_ignores_own_prior_deny() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let state = share_open_state();
        f.open2(
            Some(&state),
            ShareMode::READ | ShareMode::DENY_WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        // upgrading to write must not conflict with our own deny-write
        f.reopen2(ShareMode::RDWR | ShareMode::DENY_WRITE).unwrap();
    }

    #[test]
    fn test_reopen2_conflict_with_other_holder() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let s1 = share_open_state();
        f.open2(
            Some(&s1),
            ShareMode::READ | ShareMode::DENY_WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        let s2 = share_open_state();
        f.open2(
            Some(&s2),
            ShareMode::READ,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        let before = share_state(&f);
        // upgrading the second state to write hits the first one's deny
        let err = f.reopen2(ShareMode::RDWR).unwrap_err();
        assert_eq!(err.major, ErrorMajor::ShareDenied);
        assert_eq!(share_state(&f), before);
    }

    #[test]
    fn test_reopen2_failed_store_open_restores_share() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let before = share_state(&f);
        fs.fail_next_open(-libc::EIO);
        let err = f.reopen2(ShareMode::READ).unwrap_err();
        assert_eq!(err.major, ErrorMajor::Io);
        assert_eq!(share_state(&f), before);
        assert_eq!(f.status2(), ShareMode::CLOSED);
    }

    #[test]
    fn test_open2_by_name_without_create() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let created = make_file(&root, "f");
        let state = share_open_state();
        let opened = root
            .open2(
                Some(&state),
                ShareMode::READ,
                CreateMode::NoCreate,
                Some("f"),
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap();
        let handle = opened.handle.expect("open by name returns the object");
        assert_eq!(handle.handle_to_key(), created.handle_to_key());
        assert!(opened.caller_perm_check);
    }

    #[test]
    fn test_open2_unchecked_retries_after_eexist() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let existing = make_file(&root, "f");
        existing.write2(0, b"keep", false).unwrap();

        // attributes force the exclusive first attempt, which collides
        // and is retried unchecked
        let state = share_open_state();
        let opened = root
            .open2(
                Some(&state),
                ShareMode::RDWR,
                CreateMode::Unchecked,
                Some("f"),
                Some(&AttrList::with_mode(0o600)),
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap();
        let handle = opened.handle.unwrap();
        assert_eq!(handle.handle_to_key(), existing.handle_to_key());
        // the existing content survived the unchecked retry
        let mut buf = [0u8; 16];
        let (n, _) = handle.read2(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"keep");
    }

    #[test]
    fn test_open2_guarded_existing_fails() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        make_file(&root, "f");
        let state = share_open_state();
        let err = root
            .open2(
                Some(&state),
                ShareMode::RDWR,
                CreateMode::Guarded,
                Some("f"),
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap_err();
        assert_eq!(err.major, ErrorMajor::Exist);
    }

    #[test]
    fn test_open2_exclusive_embeds_and_checks_verifier() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let verifier: Verifier = [9, 8, 7, 6, 5, 4, 3, 2];
        let state = share_open_state();
        let opened = root
            .open2(
                Some(&state),
                ShareMode::RDWR,
                CreateMode::Exclusive,
                Some("f"),
                None,
                verifier,
                Creds::default(),
            )
            .unwrap();
        let handle = opened.handle.unwrap();
        let attr = handle.getattrs().unwrap();
        assert!(check_verifier(&attr, verifier));

        // retry recognition: an exclusive open-by-handle with the same
        // verifier succeeds, a different verifier is already-exists
        handle.close2(Some(&state)).unwrap();
        let state2 = share_open_state();
        handle
            .open2(
                Some(&state2),
                ShareMode::RDWR,
                CreateMode::Exclusive,
                None,
                None,
                verifier,
                Creds::default(),
            )
            .unwrap();
        handle.close2(Some(&state2)).unwrap();

        let before = share_state(&handle);
        let state3 = share_open_state();
        let err = handle
            .open2(
                Some(&state3),
                ShareMode::RDWR,
                CreateMode::Exclusive,
                None,
                None,
                [0xff; 8],
                Creds::default(),
            )
            .unwrap_err();
        assert_eq!(err.major, ErrorMajor::Exist);
        assert_eq!(err.minor, libc::EEXIST);
        // the failed open left no reservation and no store open behind
        assert_eq!(share_state(&handle), before);
        assert_eq!(fs.open_node_count(), 0);
    }

    #[test]
    fn test_open2_stateless_create_asks_for_perm_check() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let opened = f
            .open2(
                None,
                ShareMode::READ,
                CreateMode::NoCreate,
                None,
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap();
        assert!(opened.caller_perm_check);
        assert!(share_state(&f).is_closed());
        assert_eq!(fs.opens(), 1);
    }

    #[test]
    fn test_open2_post_create_setattr_failure_leaves_file() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let live_before = fs.live_handle_count();

        fs.fail_next_set_attr(-libc::EIO);
        let attrs = AttrList {
            mask: AttrMask::OWNER,
            attrs: NodeAttr {
                uid: 42,
                ..NodeAttr::default()
            },
        };
        let state = share_open_state();
        let err = root
            .open2(
                Some(&state),
                ShareMode::RDWR,
                CreateMode::Guarded,
                Some("f"),
                Some(&attrs),
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap_err();
        assert_eq!(err.major, ErrorMajor::Io);
        // the created file stays behind, the handle and store open do not
        assert!(root.lookup("f").is_ok());
        assert_eq!(fs.open_node_count(), 0);
        assert_eq!(fs.live_handle_count(), live_before);
    }

    #[test]
    fn test_open2_truncating_open_refreshes_attrs() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        f.write2(0, b"data", false).unwrap();
        let state = share_open_state();
        let opened = f
            .open2(
                Some(&state),
                ShareMode::RDWR | ShareMode::TRUNC,
                CreateMode::NoCreate,
                None,
                None,
                NO_VERIFIER,
                Creds::default(),
            )
            .unwrap();
        assert!(opened.attrs.is_some());
    }

    #[test]
    fn test_read2_reports_eof_on_empty_read() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        f.write2(0, b"abc", false).unwrap();

        let mut buf = [0u8; 2];
        let (n, eof) = f.read2(0, &mut buf).unwrap();
        assert_eq!((n, eof), (2, false));
        let (n, eof) = f.read2(3, &mut buf).unwrap();
        assert_eq!((n, eof), (0, true));
    }

    #[test]
    fn test_write2_stable_commits() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let (n, stable) = f.write2(0, b"data", true).unwrap();
        assert_eq!(n, 4);
        assert!(stable);
        let (n, stable) = f.write2(4, b"more", false).unwrap();
        assert_eq!(n, 4);
        assert!(!stable);
        f.commit2(0, 8).unwrap();
        assert_eq!(f.getattrs().unwrap().size, 8);
    }

    #[test]
    fn test_merge_folds_duplicate_share() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let orig = make_file(&root, "f");
        let (dupe, _) = root.lookup("f").unwrap();

        let state = share_open_state();
        dupe.open2(
            Some(&state),
            ShareMode::READ,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        orig.merge(&dupe).unwrap();
        assert!(!share_state(&orig).is_closed());
    }

    #[test]
    fn test_merge_conflicting_share_denied() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let orig = make_file(&root, "f");
        let (dupe, _) = root.lookup("f").unwrap();

        let s1 = share_open_state();
        orig.open2(
            Some(&s1),
            ShareMode::READ | ShareMode::DENY_WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();
        orig.close2(None).unwrap(); // store-level close; reservation stays

        let s2 = share_open_state();
        dupe.open2(
            Some(&s2),
            ShareMode::WRITE,
            CreateMode::NoCreate,
            None,
            None,
            NO_VERIFIER,
            Creds::default(),
        )
        .unwrap();

        let err = orig.merge(&dupe).unwrap_err();
        assert_eq!(err.major, ErrorMajor::ShareDenied);
    }

    #[test]
    fn test_merge_ignores_directories() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let (d1, _) = root.mkdir("d", &AttrList::with_mode(0o755), Creds::default()).unwrap();
        let (d2, _) = root.lookup("d").unwrap();
        assert!(d1.merge(&d2).is_ok());
    }

    #[test]
    fn test_wire_digest_roundtrips_key() {
        let (fs, ctx) = test_ctx(0);
        let root = make_root(&fs, &ctx);
        let f = make_file(&root, "f");
        let mut out = [0u8; 64];
        let len = f.wire_digest(DigestKind::Nfsv3, &mut out).unwrap();
        assert_eq!(&out[..len], f.handle_to_key().as_bytes());
    }
}
