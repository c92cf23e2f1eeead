//! Storage client seam
//!
//! CoralFS is consumed as a black-box synchronous client library: every
//! call may block on network I/O and reports zero or a negated POSIX
//! errno. The node-handle API has no file-descriptor concept and the
//! store forbids concurrent opens of a node; the adapter layers both on
//! top (see `share` and `handle`).

use std::sync::Arc;

use crate::attr::NodeAttr;
use crate::wire::NodeKey;

/// Raw result of a store call: `Ok` or a negated POSIX errno.
pub type StoreResult<T> = std::result::Result<T, i32>;

/// Opaque reference to a node within an open filesystem.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodePtr(pub u64);

/// A store-issued node handle.
///
/// Acquired from `FileSystem::get_node_handle` or a lookup and released
/// with `free_node_handle` exactly once. The serial identifies one
/// acquisition; the key names the node durably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    /// Node this handle refers to.
    pub ptr: NodePtr,
    /// Durable key naming the node.
    pub key: NodeKey,
    /// Store-assigned serial for this acquisition.
    pub serial: u64,
}

/// Mask for `FileSystem::set_attr`, naming which fields of the supplied
/// attributes to apply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SetAttrMask(u32);

impl SetAttrMask {
    /// Permission bits.
    pub const MODE: SetAttrMask = SetAttrMask(0x01);
    /// Owner user id.
    pub const UID: SetAttrMask = SetAttrMask(0x02);
    /// Owner group id.
    pub const GID: SetAttrMask = SetAttrMask(0x04);
    /// Access time.
    pub const ATIME: SetAttrMask = SetAttrMask(0x08);
    /// Modification time.
    pub const MTIME: SetAttrMask = SetAttrMask(0x10);
    /// Change time.
    pub const CTIME: SetAttrMask = SetAttrMask(0x20);

    /// Empty mask.
    pub fn empty() -> Self {
        SetAttrMask(0)
    }

    /// True when no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when any bit of `other` is set here.
    pub fn contains(self, other: SetAttrMask) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOrAssign for SetAttrMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Filesystem-wide usage statistics, statvfs-shaped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStat {
    /// Fragment size in bytes; block counts are in these units.
    pub fragment_size: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub blocks_free: u64,
    /// Blocks available to unprivileged users.
    pub blocks_avail: u64,
    /// Total file slots.
    pub files: u64,
    /// Free file slots.
    pub files_free: u64,
    /// File slots available to unprivileged users.
    pub files_avail: u64,
}

/// Library-level store session: one per process, shared by all exports.
pub trait StoreDriver: Send + Sync {
    /// One-time library initialization. Called exactly once, by
    /// `Session::connect`.
    fn init(&self) -> StoreResult<()>;

    /// Releases the library. Called when the session is dropped.
    fn fini(&self);

    /// Opens a filesystem container. One call per export attach.
    fn open_filesystem(
        &self,
        server_group: Option<&str>,
        pool: &str,
        container: &str,
    ) -> StoreResult<Arc<dyn FileSystem>>;
}

/// One open filesystem container.
///
/// All node operations are synchronous and may block indefinitely; there
/// is no cancellation at this layer. Implementations are the CoralFS
/// client library in production and `mock::MockFileSystem` in tests.
pub trait FileSystem: Send + Sync {
    /// The root node of this filesystem.
    fn root_ptr(&self) -> NodePtr;

    /// Acquires a node handle for `ptr`.
    fn get_node_handle(&self, ptr: NodePtr) -> StoreResult<NodeHandle>;

    /// Releases a node handle. Each acquisition is released exactly once.
    fn free_node_handle(&self, node: &NodeHandle);

    /// Resolves a path relative to `dir`.
    fn lookup_path(&self, dir: &NodeHandle, path: &str) -> StoreResult<NodeHandle>;

    /// Resolves a durable node key, failing when the node is gone.
    fn lookup_key(&self, key: &NodeKey) -> StoreResult<NodeHandle>;

    /// Reads current node attributes.
    fn get_attr(&self, node: &NodeHandle) -> StoreResult<NodeAttr>;

    /// Applies the masked fields of `attr` to the node.
    fn set_attr(&self, node: &NodeHandle, attr: &NodeAttr, mask: SetAttrMask) -> StoreResult<()>;

    /// Truncates or extends a regular file to `size`.
    fn truncate(&self, node: &NodeHandle, size: u64) -> StoreResult<()>;

    /// Creates a regular file under `dir` and returns its handle and
    /// attributes. `flags` are POSIX open flags (O_CREAT, O_EXCL, ...).
    fn create(
        &self,
        dir: &NodeHandle,
        name: &str,
        attr: &NodeAttr,
        flags: i32,
    ) -> StoreResult<(NodeHandle, NodeAttr)>;

    /// Creates a directory under `dir`.
    fn mkdir(
        &self,
        dir: &NodeHandle,
        name: &str,
        attr: &NodeAttr,
    ) -> StoreResult<(NodeHandle, NodeAttr)>;

    /// Removes `name` from `dir`.
    fn unlink(&self, dir: &NodeHandle, name: &str) -> StoreResult<()>;

    /// Opens the node. The store admits one open per node at a time.
    fn open(&self, node: &NodeHandle, flags: i32) -> StoreResult<()>;

    /// Closes the node's open.
    fn close(&self, node: &NodeHandle) -> StoreResult<()>;

    /// Reads into `buf` at `offset`, returning the byte count.
    fn read(&self, node: &NodeHandle, offset: u64, buf: &mut [u8]) -> StoreResult<usize>;

    /// Writes `data` at `offset`, returning the byte count.
    fn write(&self, node: &NodeHandle, offset: u64, data: &[u8]) -> StoreResult<usize>;

    /// Flushes written data to stable storage. Zero offset and length
    /// cover the whole file.
    fn commit(&self, node: &NodeHandle, offset: u64, len: u64) -> StoreResult<()>;

    /// Delivers one batch of directory entries starting at `cursor`,
    /// advancing it. `entry` receives each name and its cookie and
    /// returns false to stop the batch. Returns true at end of
    /// directory.
    fn read_dir(
        &self,
        dir: &NodeHandle,
        cursor: &mut u64,
        entry: &mut dyn FnMut(&str, u64) -> bool,
    ) -> StoreResult<bool>;

    /// Filesystem-wide usage statistics.
    fn stat_fs(&self) -> StoreResult<FsStat>;

    /// Closes the filesystem container. One call per export detach.
    fn close_filesystem(&self) -> StoreResult<()>;
}

/// Scope guard releasing a node handle on drop unless disarmed.
///
/// Transient handles from lookups and creates go through this so every
/// exit path releases them.
pub struct NodeGuard<'a> {
    fs: &'a dyn FileSystem,
    node: Option<NodeHandle>,
}

impl<'a> NodeGuard<'a> {
    /// Takes ownership of `node`, releasing it on drop.
    pub fn new(fs: &'a dyn FileSystem, node: NodeHandle) -> Self {
        Self {
            fs,
            node: Some(node),
        }
    }

    /// The guarded handle.
    pub fn node(&self) -> &NodeHandle {
        self.node.as_ref().unwrap()
    }

    /// Disarms the guard and hands the handle back to the caller.
    pub fn into_inner(mut self) -> NodeHandle {
        self.node.take().unwrap()
    }
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.fs.free_node_handle(&node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_attr_mask_ops() {
        let mut mask = SetAttrMask::empty();
        assert!(mask.is_empty());
        mask |= SetAttrMask::MODE;
        mask |= SetAttrMask::ATIME;
        assert!(mask.contains(SetAttrMask::MODE));
        assert!(mask.contains(SetAttrMask::ATIME));
        assert!(!mask.contains(SetAttrMask::GID));
    }
}
