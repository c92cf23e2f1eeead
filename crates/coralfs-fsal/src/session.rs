//! Store session lifecycle
//!
//! The CoralFS client library is initialized once per process. The
//! session object owns that initialization: the host server connects a
//! driver before creating the first export and threads the session
//! through `Export::attach`. There is no process-global state; the
//! library is initialized when a session exists and finalized when the
//! last export holding it is gone.

use std::sync::Arc;

use tracing::debug;

use crate::config::ExportConfig;
use crate::error::{FsalError, Result};
use crate::store::{FileSystem, StoreDriver, StoreResult};

/// One process-wide connection to the store, shared by every export.
pub struct Session {
    driver: Arc<dyn StoreDriver>,
}

impl Session {
    /// Connects the store library.
    ///
    /// Runs the driver's one-time initialization; constructing a session
    /// is the only way that happens, so a single `connect` per driver
    /// gives single initialization by construction.
    pub fn connect(driver: Arc<dyn StoreDriver>) -> Result<Arc<Session>> {
        if let Err(rc) = driver.init() {
            return Err(FsalError::from_store(rc));
        }
        debug!("store session connected");
        Ok(Arc::new(Session { driver }))
    }

    pub(crate) fn open_filesystem(&self, cfg: &ExportConfig) -> StoreResult<Arc<dyn FileSystem>> {
        self.driver
            .open_filesystem(cfg.server_group.as_deref(), &cfg.pool, &cfg.container)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("store session closing");
        self.driver.fini();
    }
}
