//! Path layout for per-space conversation storage.
//!
//! Every conversation lives in its owning space's directory:
//!
//! ```text
//! {base}/
//! └── {space_id}/
//!     └── conversations/
//!         ├── index.json                 # Listing index for the space
//!         ├── {id}.json                  # Full conversation record
//!         ├── {id}.thoughts.json         # Externalized thought overflow
//!         └── {name}.tmp                 # Transient atomic-write siblings
//! ```
//!
//! The base directory defaults to the platform data dir and is overridable
//! so tests can point the store at a temp directory.

use parley_core::{ParleyError, Result};
use std::path::PathBuf;

/// Resolves file locations for a conversation store rooted at `base`.
#[derive(Debug, Clone)]
pub struct SpacePaths {
    base: PathBuf,
}

impl SpacePaths {
    /// Creates a path resolver rooted at an explicit base directory.
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Creates a path resolver rooted at the platform data directory
    /// (e.g. `~/.local/share/parley/` on Linux).
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| ParleyError::io("Cannot determine platform data directory"))?;
        Ok(Self::new(data_dir.join("parley")))
    }

    /// The base directory all spaces live under.
    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    /// The conversations directory for one space.
    pub fn conversations_dir(&self, space_id: &str) -> PathBuf {
        self.base.join(space_id).join("conversations")
    }

    /// The main record file for one conversation.
    pub fn conversation_file(&self, space_id: &str, conversation_id: &str) -> PathBuf {
        self.conversations_dir(space_id)
            .join(format!("{conversation_id}.json"))
    }

    /// The thought overflow file for one conversation.
    pub fn thoughts_file(&self, space_id: &str, conversation_id: &str) -> PathBuf {
        self.conversations_dir(space_id)
            .join(format!("{conversation_id}.thoughts.json"))
    }

    /// The listing index file for one space.
    pub fn index_file(&self, space_id: &str) -> PathBuf {
        self.conversations_dir(space_id).join("index.json")
    }
}
