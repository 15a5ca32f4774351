//! Client registry interface.
//!
//! The full product keeps registered clients, groups, and policies in an
//! external database; the core only needs a membership check. The flat-file
//! implementation serves the standalone server binary, the in-memory one
//! serves tests.

use bauta_core::{ClientId, Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Membership check for presented client identities.
pub trait ClientRegistry: Send + Sync {
    /// Whether this Common Name may establish sessions.
    fn is_registered(&self, client: &ClientId) -> bool;
}

/// Fixed set of identities, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    members: HashSet<String>,
}

impl MemoryRegistry {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

impl ClientRegistry for MemoryRegistry {
    fn is_registered(&self, client: &ClientId) -> bool {
        self.members.contains(client.as_str())
    }
}

/// One Common Name per line; blank lines and `#` comments ignored.
#[derive(Debug)]
pub struct FileRegistry {
    members: HashSet<String>,
}

impl FileRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read registry {}: {e}", path.display())))?;
        let members = data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(Self { members })
    }
}

impl ClientRegistry for FileRegistry {
    fn is_registered(&self, client: &ClientId) -> bool {
        self.members.contains(client.as_str())
    }
}
