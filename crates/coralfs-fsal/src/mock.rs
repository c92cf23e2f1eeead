//! In-memory store backend for tests
//!
//! Mirrors the CoralFS client contract closely enough to exercise the
//! adapter: node handles must be released exactly once, a node admits a
//! single store-level open at a time, and every failure is a negated
//! errno. Call counting and one-shot failure injection back the
//! lifecycle and compensation tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attr::{NodeAttr, Timespec};
use crate::store::{
    FileSystem, FsStat, NodeHandle, NodePtr, SetAttrMask, StoreDriver, StoreResult,
};
use crate::wire::{NodeKey, NODE_KEY_SIZE};

const ROOT_PTR: u64 = 1;

struct MockNode {
    attr: NodeAttr,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
}

impl MockNode {
    fn is_dir(&self) -> bool {
        self.attr.mode & libc::S_IFMT == libc::S_IFDIR
    }

    fn is_file(&self) -> bool {
        self.attr.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// In-memory `FileSystem` with call counting and failure injection.
pub struct MockFileSystem {
    fsid: u64,
    nodes: Mutex<HashMap<u64, MockNode>>,
    next_ptr: AtomicU64,
    next_serial: AtomicU64,
    live_handles: Mutex<HashSet<u64>>,
    open_nodes: Mutex<HashSet<u64>>,
    handles_issued: AtomicU64,
    handles_freed: AtomicU64,
    double_frees: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    fs_closes: AtomicU64,
    fail_next_open: Mutex<Option<i32>>,
    fail_next_get_attr: Mutex<Option<i32>>,
    fail_next_set_attr: Mutex<Option<i32>>,
}

impl MockFileSystem {
    /// Builds a filesystem holding only a root directory.
    pub fn new(fsid: u64) -> Arc<Self> {
        let root = MockNode {
            attr: NodeAttr {
                mode: libc::S_IFDIR | 0o755,
                nlink: 2,
                ino: ROOT_PTR,
                dev: fsid,
                atime: Timespec::now(),
                mtime: Timespec::now(),
                ctime: Timespec::now(),
                ..NodeAttr::default()
            },
            data: Vec::new(),
            children: BTreeMap::new(),
        };
        let nodes = HashMap::from([(ROOT_PTR, root)]);
        Arc::new(Self {
            fsid,
            nodes: Mutex::new(nodes),
            next_ptr: AtomicU64::new(ROOT_PTR + 1),
            next_serial: AtomicU64::new(1),
            live_handles: Mutex::new(HashSet::new()),
            open_nodes: Mutex::new(HashSet::new()),
            handles_issued: AtomicU64::new(0),
            handles_freed: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            fs_closes: AtomicU64::new(0),
            fail_next_open: Mutex::new(None),
            fail_next_get_attr: Mutex::new(None),
            fail_next_set_attr: Mutex::new(None),
        })
    }

    fn key_for(&self, ptr: u64) -> NodeKey {
        let mut bytes = [0u8; NODE_KEY_SIZE];
        bytes[..8].copy_from_slice(&ptr.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.fsid.to_le_bytes());
        bytes[16..24].copy_from_slice(b"CORALKEY");
        NodeKey::new(bytes)
    }

    fn issue_handle(&self, ptr: u64) -> NodeHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.live_handles.lock().insert(serial);
        self.handles_issued.fetch_add(1, Ordering::SeqCst);
        NodeHandle {
            ptr: NodePtr(ptr),
            key: self.key_for(ptr),
            serial,
        }
    }

    fn take_injected(&self, slot: &Mutex<Option<i32>>) -> Option<i32> {
        slot.lock().take()
    }

    /// Arranges for the next `open` call to fail with `errno` (negated).
    pub fn fail_next_open(&self, errno: i32) {
        *self.fail_next_open.lock() = Some(errno);
    }

    /// Arranges for the next `get_attr` call to fail with `errno`.
    pub fn fail_next_get_attr(&self, errno: i32) {
        *self.fail_next_get_attr.lock() = Some(errno);
    }

    /// Arranges for the next `set_attr` call to fail with `errno`.
    pub fn fail_next_set_attr(&self, errno: i32) {
        *self.fail_next_set_attr.lock() = Some(errno);
    }

    /// Node handles issued so far.
    pub fn handles_issued(&self) -> u64 {
        self.handles_issued.load(Ordering::SeqCst)
    }

    /// Node handles released so far.
    pub fn handles_freed(&self) -> u64 {
        self.handles_freed.load(Ordering::SeqCst)
    }

    /// Releases of handles that were not live.
    pub fn double_frees(&self) -> u64 {
        self.double_frees.load(Ordering::SeqCst)
    }

    /// Node handles currently live.
    pub fn live_handle_count(&self) -> usize {
        self.live_handles.lock().len()
    }

    /// Store-level opens performed.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Store-level closes performed.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Nodes currently open at the store.
    pub fn open_node_count(&self) -> usize {
        self.open_nodes.lock().len()
    }

    /// Filesystem close calls performed.
    pub fn fs_closes(&self) -> u64 {
        self.fs_closes.load(Ordering::SeqCst)
    }

    /// True when `ptr` names a live node.
    pub fn node_exists(&self, ptr: NodePtr) -> bool {
        self.nodes.lock().contains_key(&ptr.0)
    }
}

impl FileSystem for MockFileSystem {
    fn root_ptr(&self) -> NodePtr {
        NodePtr(ROOT_PTR)
    }

    fn get_node_handle(&self, ptr: NodePtr) -> StoreResult<NodeHandle> {
        if !self.nodes.lock().contains_key(&ptr.0) {
            return Err(-libc::ENOENT);
        }
        Ok(self.issue_handle(ptr.0))
    }

    fn free_node_handle(&self, node: &NodeHandle) {
        if self.live_handles.lock().remove(&node.serial) {
            self.handles_freed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lookup_path(&self, dir: &NodeHandle, path: &str) -> StoreResult<NodeHandle> {
        let target = {
            let nodes = self.nodes.lock();
            let mut cur = dir.ptr.0;
            for comp in path.split('/').filter(|c| !c.is_empty()) {
                let node = nodes.get(&cur).ok_or(-libc::ENOENT)?;
                if !node.is_dir() {
                    return Err(-libc::ENOTDIR);
                }
                cur = *node.children.get(comp).ok_or(-libc::ENOENT)?;
            }
            cur
        };
        self.get_node_handle(NodePtr(target))
    }

    fn lookup_key(&self, key: &NodeKey) -> StoreResult<NodeHandle> {
        let found = {
            let nodes = self.nodes.lock();
            nodes.keys().find(|ptr| self.key_for(**ptr) == *key).copied()
        };
        match found {
            Some(ptr) => self.get_node_handle(NodePtr(ptr)),
            None => Err(-libc::ENOENT),
        }
    }

    fn get_attr(&self, node: &NodeHandle) -> StoreResult<NodeAttr> {
        if let Some(errno) = self.take_injected(&self.fail_next_get_attr) {
            return Err(errno);
        }
        let nodes = self.nodes.lock();
        let n = nodes.get(&node.ptr.0).ok_or(-libc::ESTALE)?;
        Ok(n.attr.clone())
    }

    fn set_attr(&self, node: &NodeHandle, attr: &NodeAttr, mask: SetAttrMask) -> StoreResult<()> {
        if let Some(errno) = self.take_injected(&self.fail_next_set_attr) {
            return Err(errno);
        }
        let mut nodes = self.nodes.lock();
        let n = nodes.get_mut(&node.ptr.0).ok_or(-libc::ESTALE)?;
        if mask.contains(SetAttrMask::MODE) {
            n.attr.mode = (n.attr.mode & libc::S_IFMT) | (attr.mode & 0o7777);
        }
        if mask.contains(SetAttrMask::UID) {
            n.attr.uid = attr.uid;
        }
        if mask.contains(SetAttrMask::GID) {
            n.attr.gid = attr.gid;
        }
        if mask.contains(SetAttrMask::ATIME) {
            n.attr.atime = attr.atime;
        }
        if mask.contains(SetAttrMask::MTIME) {
            n.attr.mtime = attr.mtime;
        }
        if mask.contains(SetAttrMask::CTIME) {
            n.attr.ctime = attr.ctime;
        }
        Ok(())
    }

    fn truncate(&self, node: &NodeHandle, size: u64) -> StoreResult<()> {
        let mut nodes = self.nodes.lock();
        let n = nodes.get_mut(&node.ptr.0).ok_or(-libc::ESTALE)?;
        if !n.is_file() {
            return Err(-libc::EISDIR);
        }
        n.data.resize(size as usize, 0);
        n.attr.size = size;
        Ok(())
    }

    fn create(
        &self,
        dir: &NodeHandle,
        name: &str,
        attr: &NodeAttr,
        flags: i32,
    ) -> StoreResult<(NodeHandle, NodeAttr)> {
        let ptr = {
            let mut nodes = self.nodes.lock();
            let parent = nodes.get(&dir.ptr.0).ok_or(-libc::ESTALE)?;
            if !parent.is_dir() {
                return Err(-libc::ENOTDIR);
            }
            if let Some(existing) = parent.children.get(name).copied() {
                if flags & libc::O_EXCL != 0 {
                    return Err(-libc::EEXIST);
                }
                existing
            } else {
                let ptr = self.next_ptr.fetch_add(1, Ordering::SeqCst);
                let now = Timespec::now();
                let node = MockNode {
                    attr: NodeAttr {
                        mode: libc::S_IFREG | (attr.mode & 0o7777),
                        uid: attr.uid,
                        gid: attr.gid,
                        nlink: 1,
                        ino: ptr,
                        dev: self.fsid,
                        atime: now,
                        mtime: now,
                        ctime: now,
                        ..NodeAttr::default()
                    },
                    data: Vec::new(),
                    children: BTreeMap::new(),
                };
                nodes.insert(ptr, node);
                nodes
                    .get_mut(&dir.ptr.0)
                    .ok_or(-libc::ESTALE)?
                    .children
                    .insert(name.to_string(), ptr);
                ptr
            }
        };
        let handle = self.get_node_handle(NodePtr(ptr))?;
        let attr = self.get_attr(&handle)?;
        Ok((handle, attr))
    }

    fn mkdir(
        &self,
        dir: &NodeHandle,
        name: &str,
        attr: &NodeAttr,
    ) -> StoreResult<(NodeHandle, NodeAttr)> {
        let ptr = {
            let mut nodes = self.nodes.lock();
            let parent = nodes.get(&dir.ptr.0).ok_or(-libc::ESTALE)?;
            if !parent.is_dir() {
                return Err(-libc::ENOTDIR);
            }
            if parent.children.contains_key(name) {
                return Err(-libc::EEXIST);
            }
            let ptr = self.next_ptr.fetch_add(1, Ordering::SeqCst);
            let now = Timespec::now();
            let node = MockNode {
                attr: NodeAttr {
                    mode: libc::S_IFDIR | (attr.mode & 0o7777),
                    uid: attr.uid,
                    gid: attr.gid,
                    nlink: 2,
                    ino: ptr,
                    dev: self.fsid,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    ..NodeAttr::default()
                },
                data: Vec::new(),
                children: BTreeMap::new(),
            };
            nodes.insert(ptr, node);
            nodes
                .get_mut(&dir.ptr.0)
                .ok_or(-libc::ESTALE)?
                .children
                .insert(name.to_string(), ptr);
            ptr
        };
        let handle = self.get_node_handle(NodePtr(ptr))?;
        let attr = self.get_attr(&handle)?;
        Ok((handle, attr))
    }

    fn unlink(&self, dir: &NodeHandle, name: &str) -> StoreResult<()> {
        let mut nodes = self.nodes.lock();
        let parent = nodes.get(&dir.ptr.0).ok_or(-libc::ESTALE)?;
        let target = *parent.children.get(name).ok_or(-libc::ENOENT)?;
        if let Some(node) = nodes.get(&target) {
            if node.is_dir() && !node.children.is_empty() {
                return Err(-libc::ENOTEMPTY);
            }
        }
        nodes.remove(&target);
        nodes
            .get_mut(&dir.ptr.0)
            .ok_or(-libc::ESTALE)?
            .children
            .remove(name);
        Ok(())
    }

    fn open(&self, node: &NodeHandle, _flags: i32) -> StoreResult<()> {
        if let Some(errno) = self.take_injected(&self.fail_next_open) {
            return Err(errno);
        }
        if !self.nodes.lock().contains_key(&node.ptr.0) {
            return Err(-libc::ESTALE);
        }
        let mut open = self.open_nodes.lock();
        if !open.insert(node.ptr.0) {
            return Err(-libc::EBUSY);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, node: &NodeHandle) -> StoreResult<()> {
        let mut open = self.open_nodes.lock();
        if !open.remove(&node.ptr.0) {
            return Err(-libc::EBADF);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, node: &NodeHandle, offset: u64, buf: &mut [u8]) -> StoreResult<usize> {
        let nodes = self.nodes.lock();
        let n = nodes.get(&node.ptr.0).ok_or(-libc::ESTALE)?;
        if !n.is_file() {
            return Err(-libc::EISDIR);
        }
        let offset = offset as usize;
        if offset >= n.data.len() {
            return Ok(0);
        }
        let len = buf.len().min(n.data.len() - offset);
        buf[..len].copy_from_slice(&n.data[offset..offset + len]);
        Ok(len)
    }

    fn write(&self, node: &NodeHandle, offset: u64, data: &[u8]) -> StoreResult<usize> {
        let mut nodes = self.nodes.lock();
        let n = nodes.get_mut(&node.ptr.0).ok_or(-libc::ESTALE)?;
        if !n.is_file() {
            return Err(-libc::EISDIR);
        }
        let offset = offset as usize;
        let end = offset + data.len();
        if n.data.len() < end {
            n.data.resize(end, 0);
        }
        n.data[offset..end].copy_from_slice(data);
        n.attr.size = n.data.len() as u64;
        n.attr.mtime = Timespec::now();
        Ok(data.len())
    }

    fn commit(&self, node: &NodeHandle, _offset: u64, _len: u64) -> StoreResult<()> {
        let nodes = self.nodes.lock();
        nodes.get(&node.ptr.0).ok_or(-libc::ESTALE)?;
        Ok(())
    }

    fn read_dir(
        &self,
        dir: &NodeHandle,
        cursor: &mut u64,
        entry: &mut dyn FnMut(&str, u64) -> bool,
    ) -> StoreResult<bool> {
        // Snapshot the names before invoking the callback: the adapter's
        // per-entry work calls back into this filesystem.
        let names: Vec<String> = {
            let nodes = self.nodes.lock();
            let n = nodes.get(&dir.ptr.0).ok_or(-libc::ESTALE)?;
            if !n.is_dir() {
                return Err(-libc::ENOTDIR);
            }
            n.children.keys().cloned().collect()
        };
        for (idx, name) in names.iter().enumerate().skip(*cursor as usize) {
            let cookie = idx as u64 + 1;
            *cursor = cookie;
            if !entry(name, cookie) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn stat_fs(&self) -> StoreResult<FsStat> {
        Ok(FsStat {
            fragment_size: 4096,
            blocks: 1 << 20,
            blocks_free: 1 << 19,
            blocks_avail: 1 << 19,
            files: 1 << 16,
            files_free: 1 << 15,
            files_avail: 1 << 15,
        })
    }

    fn close_filesystem(&self) -> StoreResult<()> {
        self.fs_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory `StoreDriver` handing out one `MockFileSystem`.
pub struct MockStore {
    fs: Arc<MockFileSystem>,
    init_calls: AtomicU64,
    fini_calls: AtomicU64,
    fs_opens: AtomicU64,
    fail_open_filesystem: Mutex<Option<i32>>,
}

impl MockStore {
    /// Builds a driver over a fresh filesystem.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs: MockFileSystem::new(7),
            init_calls: AtomicU64::new(0),
            fini_calls: AtomicU64::new(0),
            fs_opens: AtomicU64::new(0),
            fail_open_filesystem: Mutex::new(None),
        })
    }

    /// Direct access to the backing filesystem for assertions.
    pub fn fs(&self) -> Arc<MockFileSystem> {
        self.fs.clone()
    }

    /// Library init calls performed.
    pub fn init_calls(&self) -> u64 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Library fini calls performed.
    pub fn fini_calls(&self) -> u64 {
        self.fini_calls.load(Ordering::SeqCst)
    }

    /// Filesystem open calls performed.
    pub fn fs_opens(&self) -> u64 {
        self.fs_opens.load(Ordering::SeqCst)
    }

    /// Arranges for the next `open_filesystem` call to fail.
    pub fn fail_open_filesystem(&self, errno: i32) {
        *self.fail_open_filesystem.lock() = Some(errno);
    }
}

impl StoreDriver for MockStore {
    fn init(&self) -> StoreResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fini(&self) {
        self.fini_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn open_filesystem(
        &self,
        _server_group: Option<&str>,
        _pool: &str,
        _container: &str,
    ) -> StoreResult<Arc<dyn FileSystem>> {
        if let Some(errno) = self.fail_open_filesystem.lock().take() {
            return Err(errno);
        }
        self.fs_opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.fs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_open_per_node() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        let (file, _) = fs
            .create(&root, "f", &NodeAttr::default(), libc::O_CREAT)
            .unwrap();
        assert!(fs.open(&file, libc::O_RDWR).is_ok());
        assert_eq!(fs.open(&file, libc::O_RDWR), Err(-libc::EBUSY));
        assert!(fs.close(&file).is_ok());
        assert!(fs.open(&file, libc::O_RDWR).is_ok());
    }

    #[test]
    fn test_close_without_open_is_ebadf() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        assert_eq!(fs.close(&root), Err(-libc::EBADF));
    }

    #[test]
    fn test_free_tracking() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        assert_eq!(fs.live_handle_count(), 1);
        fs.free_node_handle(&root);
        assert_eq!(fs.live_handle_count(), 0);
        assert_eq!(fs.handles_freed(), 1);
        fs.free_node_handle(&root);
        assert_eq!(fs.double_frees(), 1);
    }

    #[test]
    fn test_exclusive_create_collides() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        let excl = libc::O_CREAT | libc::O_EXCL;
        let (h, _) = fs.create(&root, "f", &NodeAttr::default(), excl).unwrap();
        fs.free_node_handle(&h);
        assert_eq!(
            fs.create(&root, "f", &NodeAttr::default(), excl).err(),
            Some(-libc::EEXIST)
        );
        // without O_EXCL the existing file is opened
        let (h2, attr) = fs
            .create(&root, "f", &NodeAttr::default(), libc::O_CREAT)
            .unwrap();
        assert_eq!(attr.kind(), crate::attr::ObjectKind::RegularFile);
        fs.free_node_handle(&h2);
    }

    #[test]
    fn test_lookup_path_walks_components() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        let (d, _) = fs
            .mkdir(&root, "a", &NodeAttr { mode: 0o755, ..NodeAttr::default() })
            .unwrap();
        let (f, _) = fs
            .create(&d, "b", &NodeAttr::default(), libc::O_CREAT)
            .unwrap();
        let found = fs.lookup_path(&root, "a/b").unwrap();
        assert_eq!(found.ptr, f.ptr);
        assert_eq!(fs.lookup_path(&root, "a/missing"), Err(-libc::ENOENT));
    }

    #[test]
    fn test_key_lookup_goes_stale_after_unlink() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        let (f, _) = fs
            .create(&root, "f", &NodeAttr::default(), libc::O_CREAT)
            .unwrap();
        let key = f.key;
        assert!(fs.lookup_key(&key).is_ok());
        fs.unlink(&root, "f").unwrap();
        assert_eq!(fs.lookup_key(&key), Err(-libc::ENOENT));
    }

    #[test]
    fn test_read_dir_cursor_resumes() {
        let fs = MockFileSystem::new(1);
        let root = fs.get_node_handle(fs.root_ptr()).unwrap();
        for name in ["x", "y", "z"] {
            let (h, _) = fs
                .create(&root, name, &NodeAttr::default(), libc::O_CREAT)
                .unwrap();
            fs.free_node_handle(&h);
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        let eof = fs
            .read_dir(&root, &mut cursor, &mut |name, _cookie| {
                seen.push(name.to_string());
                seen.len() < 2
            })
            .unwrap();
        assert!(!eof);
        assert_eq!(seen, ["x", "y"]);
        let eof = fs
            .read_dir(&root, &mut cursor, &mut |name, _cookie| {
                seen.push(name.to_string());
                true
            })
            .unwrap();
        assert!(eof);
        assert_eq!(seen, ["x", "y", "z"]);
    }
}
