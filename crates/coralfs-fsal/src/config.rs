//! Export configuration

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FsalError, Result};

/// Longest accepted pool or container identifier (canonical UUID text).
pub const MAX_ID_LEN: usize = 36;

/// Longest accepted server group name.
pub const MAX_SERVER_GROUP_LEN: usize = 63;

/// Parameters for one export, fixed at attach time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Server group the pool lives in; the store default when absent.
    #[serde(default)]
    pub server_group: Option<String>,
    /// Pool identifier (UUID text). Mandatory.
    pub pool: String,
    /// Filesystem container identifier (UUID text). Mandatory.
    pub container: String,
    /// Mode bits cleared from every created object.
    #[serde(default)]
    pub umask: u32,
}

impl ExportConfig {
    /// Builds a config with defaults for the optional fields.
    pub fn new(pool: &str, container: &str) -> Self {
        Self {
            server_group: None,
            pool: pool.to_string(),
            container: container.to_string(),
            umask: 0,
        }
    }

    /// Validates identifier presence, length, and UUID syntax.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.pool)?;
        validate_id(&self.container)?;
        if let Some(group) = &self.server_group {
            if group.is_empty() || group.len() > MAX_SERVER_GROUP_LEN {
                return Err(FsalError::inval());
            }
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(FsalError::inval());
    }
    Uuid::parse_str(id).map_err(|_| FsalError::inval())?;
    Ok(())
}
