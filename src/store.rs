// src/store.rs
// Persistence seam: the playlist core talks to whatever backs the entry list
// (sqlite in the full application) only through the Store trait.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Default gap between adjacent order keys. Generous spacing keeps the
/// integer-midpoint rebalancer from running out of room between neighbors
/// under realistic amounts of reordering.
pub const KEY_SPACING: i64 = 1024;

/// One persisted playlist item (a downloaded video).
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    pub location: String,
    pub watched: bool,
    /// Display position; entries are ordered by descending key, so the
    /// newest entry (largest key) sits at the top of the list.
    pub order_key: i64,
    pub added_at: DateTime<Utc>,
}

/// Operations the persistent store must provide. Errors propagate verbatim
/// to the caller; the core never retries store operations.
pub trait Store: Send + Sync {
    /// All entries, ordered by descending order key.
    fn get_entries(&self) -> Result<Vec<PlaylistEntry>, AppError>;

    /// Persist a new entry and return it with its assigned id and order key.
    fn add_entry(&self, name: &str, url: &str, location: &str)
        -> Result<PlaylistEntry, AppError>;

    /// Set the watched flag and return the updated entry.
    fn set_watched(&self, id: &str, watched: bool) -> Result<PlaylistEntry, AppError>;

    /// Rewrite a single entry's order key.
    fn update_order(&self, id: &str, order_key: i64) -> Result<(), AppError>;

    fn delete_entry(&self, id: &str) -> Result<(), AppError>;
}

/// In-memory store. Backs the test suite and works as a standalone default
/// for embedders that do not persist across runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<PlaylistEntry>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_entries(&self) -> Result<Vec<PlaylistEntry>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut entries = inner.entries.clone();
        entries.sort_by_key(|e| std::cmp::Reverse(e.order_key));
        Ok(entries)
    }

    fn add_entry(
        &self,
        name: &str,
        url: &str,
        location: &str,
    ) -> Result<PlaylistEntry, AppError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;

        // New entries go to the top of the list: key above the current maximum.
        let max_key = inner.entries.iter().map(|e| e.order_key).max().unwrap_or(0);
        let entry = PlaylistEntry {
            id: inner.next_id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            location: location.to_string(),
            watched: false,
            order_key: max_key + KEY_SPACING,
            added_at: Utc::now(),
        };

        inner.entries.push(entry.clone());
        Ok(entry)
    }

    fn set_watched(&self, id: &str, watched: bool) -> Result<PlaylistEntry, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::EntryNotFound(id.to_string()))?;

        entry.watched = watched;
        Ok(entry.clone())
    }

    fn update_order(&self, id: &str, order_key: i64) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::EntryNotFound(id.to_string()))?;

        entry.order_key = order_key;
        Ok(())
    }

    fn delete_entry(&self, id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);

        if inner.entries.len() == before {
            return Err(AppError::EntryNotFound(id.to_string()));
        }

        Ok(())
    }
}
