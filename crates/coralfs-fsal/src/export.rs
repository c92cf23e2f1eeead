//! Export lifecycle and export-scoped operations
//!
//! One export per mounted filesystem instance. Attach opens the store
//! filesystem and constructs the root handle; detach tears the root down
//! first and then closes the filesystem. The export owns the root node
//! handle; descendant handles own theirs.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::attr::{AttrMask, NodeAttr};
use crate::config::ExportConfig;
use crate::error::{ErrorMajor, FsalError, Result};
use crate::handle::{ExportCtx, Handle};
use crate::session::Session;
use crate::share::ShareMode;
use crate::store::{FileSystem, NodeGuard, NodeHandle};
use crate::wire::NodeKey;

/// Static limits this export reports to the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExportLimits {
    /// Largest supported file size.
    pub max_file_size: u64,
    /// Largest single read.
    pub max_read: u32,
    /// Largest single write.
    pub max_write: u32,
    /// Most hard links to one file.
    pub max_link: u32,
    /// Longest file name.
    pub max_name_len: u32,
    /// Longest path.
    pub max_path_len: u32,
    /// Lease time granted to clients, in seconds.
    pub lease_time_secs: u64,
}

impl Default for ExportLimits {
    fn default() -> Self {
        Self {
            max_file_size: u64::MAX,
            max_read: 0x400000,
            max_write: 0x400000,
            max_link: 1024,
            max_name_len: u32::MAX,
            max_path_len: u32::MAX,
            lease_time_secs: 300,
        }
    }
}

/// Dynamic filesystem usage numbers for an export.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FsDynamicInfo {
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Free bytes.
    pub free_bytes: u64,
    /// Bytes available to unprivileged users.
    pub avail_bytes: u64,
    /// Total file slots.
    pub total_files: u64,
    /// Free file slots.
    pub free_files: u64,
    /// File slots available to unprivileged users.
    pub avail_files: u64,
    /// How long attributes may be considered fresh, in seconds.
    pub time_delta_secs: u64,
}

/// Kinds of upper-layer state that can reference a handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateKind {
    /// NFSv4 open share.
    Share,
    /// NLM share reservation.
    NlmShare,
    /// 9P fid.
    NinePFid,
    /// Byte-range lock state.
    Lock,
    /// Delegation.
    Delegation,
}

impl StateKind {
    /// True for kinds that hold a share reservation.
    pub fn bears_share(self) -> bool {
        matches!(self, StateKind::Share | StateKind::NlmShare | StateKind::NinePFid)
    }
}

/// Upper-layer open state referencing exactly one handle.
///
/// The server owns the state object and passes it back into open and
/// close calls; share-bearing kinds carry a reservation that is released
/// in `close2` before the state itself is freed.
#[derive(Debug)]
pub struct OpenState {
    /// State kind.
    pub kind: StateKind,
    /// Access mode last granted under this state.
    pub mode: ShareMode,
}

/// One mounted filesystem instance.
pub struct Export {
    session: Arc<Session>,
    ctx: Arc<ExportCtx>,
    config: ExportConfig,
    root_node: NodeHandle,
    root: Arc<Handle>,
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Export {
    /// Attaches an export: validates the configuration, opens the store
    /// filesystem, and constructs the root handle. On failure everything
    /// taken so far is undone best-effort.
    pub fn attach(session: Arc<Session>, config: ExportConfig) -> Result<Arc<Export>> {
        config.validate()?;
        debug!(pool = %config.pool, container = %config.container, "attach export");

        let fs = session
            .open_filesystem(&config)
            .map_err(|rc| FsalError::new(ErrorMajor::ServerFault, rc.checked_abs().unwrap_or(0)))?;

        let root_node = match fs.get_node_handle(fs.root_ptr()) {
            Ok(node) => node,
            Err(rc) => {
                undo_filesystem(fs.as_ref());
                return Err(FsalError::from_store(rc));
            }
        };
        let attr = match fs.get_attr(&root_node) {
            Ok(attr) => attr,
            Err(rc) => {
                fs.free_node_handle(&root_node);
                undo_filesystem(fs.as_ref());
                return Err(FsalError::from_store(rc));
            }
        };

        let ctx = Arc::new(ExportCtx {
            fs,
            umask: config.umask,
        });
        let root = Handle::construct_root(&ctx, root_node.clone(), &attr);
        Ok(Arc::new(Export {
            session,
            ctx,
            config,
            root_node,
            root,
        }))
    }

    /// The export's root handle, alive for as long as the export is.
    pub fn root(&self) -> &Arc<Handle> {
        &self.root
    }

    /// The configuration this export was attached with.
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// The store session this export runs on.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Static limits reported to the server.
    pub fn limits(&self) -> ExportLimits {
        ExportLimits::default()
    }

    /// Attributes this export can interpret or supply.
    pub fn supported_attrs(&self) -> AttrMask {
        AttrMask::SUPPORTED
    }

    /// Attributes this export can set.
    pub fn settable_attrs(&self) -> AttrMask {
        AttrMask::SETTABLE
    }

    /// Allocates an upper-layer state object of the given kind.
    pub fn new_state(&self, kind: StateKind) -> OpenState {
        OpenState {
            kind,
            mode: ShareMode::CLOSED,
        }
    }

    /// Resolves a path relative to the export root.
    pub fn lookup_path(&self, path: &str) -> Result<(Arc<Handle>, NodeAttr)> {
        debug!(path, "lookup_path");
        self.root.lookup(path)
    }

    /// Reconstructs a handle from a client-presented wire handle.
    ///
    /// A wrong-size buffer is an invalid argument regardless of content.
    /// A key the store no longer recognizes is stale; staleness may be
    /// transient and retry policy belongs to the server.
    pub fn decode_handle(&self, wire: &[u8]) -> Result<(Arc<Handle>, NodeAttr)> {
        let key = NodeKey::from_wire(wire)?;
        let fs = self.ctx.fs.as_ref();
        let node = match fs.lookup_key(&key) {
            Ok(node) => node,
            Err(_) => return Err(FsalError::stale()),
        };
        let node = NodeGuard::new(fs, node);
        let attr = fs.get_attr(node.node()).map_err(FsalError::from_store)?;
        let obj = Handle::construct(&self.ctx, node.node().ptr, &attr)?;
        Ok((obj, attr))
    }

    /// Dynamic filesystem usage for this export.
    pub fn statfs(&self) -> Result<FsDynamicInfo> {
        let st = self.ctx.fs.stat_fs().map_err(FsalError::from_store)?;
        Ok(FsDynamicInfo {
            total_bytes: st.fragment_size * st.blocks,
            free_bytes: st.fragment_size * st.blocks_free,
            avail_bytes: st.fragment_size * st.blocks_avail,
            total_files: st.files,
            free_files: st.files_free,
            avail_files: st.files_avail,
            time_delta_secs: 1,
        })
    }
}

fn undo_filesystem(fs: &dyn FileSystem) {
    // best-effort undo on the mount failure path
    if let Err(rc) = fs.close_filesystem() {
        warn!(rc, "filesystem close failed while undoing export attach");
    }
}

impl Drop for Export {
    fn drop(&mut self) {
        debug!(pool = %self.config.pool, "detach export");
        // the root handle wraps a node the export owns; release it here,
        // after which the filesystem itself can close
        self.ctx.fs.free_node_handle(&self.root_node);
        if let Err(rc) = self.ctx.fs.close_filesystem() {
            warn!(rc, "filesystem close failed on detach");
        }
    }
}
