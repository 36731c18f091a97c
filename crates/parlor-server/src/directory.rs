//! User directory lookups.
//!
//! Display names live in the platform's account service. The server needs
//! them in two places: stamping a member's name into the roster at join time
//! (which is what mention resolution runs against) and labeling direct
//! conversation peers. [`Directory`] is the seam; [`MemoryDirectory`] is the
//! in-process implementation fed from the credential file.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Resolves user ids to display names.
pub trait Directory: Send + Sync + 'static {
    /// Display name for a user. `None` when the id is unknown.
    fn username(&self, user_id: u64) -> Option<String>;

    /// Resolve a batch of user ids, skipping unknown ones.
    fn resolve_usernames(&self, user_ids: &[u64]) -> HashMap<u64, String> {
        user_ids
            .iter()
            .filter_map(|&user_id| Some((user_id, self.username(user_id)?)))
            .collect()
    }
}

/// In-memory directory, shared across tasks.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    names: Arc<RwLock<HashMap<u64, String>>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a user's display name.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned. Writes happen only at
    /// startup and on credential reload, so a poisoned lock means a startup
    /// thread already panicked.
    #[allow(clippy::expect_used)]
    pub fn insert(&self, user_id: u64, username: impl Into<String>) {
        self.names.write().expect("RwLock poisoned").insert(user_id, username.into());
    }

    /// Number of known users.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.names.read().expect("RwLock poisoned").len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Directory for MemoryDirectory {
    #[allow(clippy::expect_used)]
    fn username(&self, user_id: u64) -> Option<String> {
        self.names.read().expect("RwLock poisoned").get(&user_id).cloned()
    }
}
