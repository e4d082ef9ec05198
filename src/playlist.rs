// src/playlist.rs
// Shared ordered playlist cache plus the fractional order-key rebalancer.

use crate::error::AppError;
use crate::events::{Event, EventSink};
use crate::store::{PlaylistEntry, Store, KEY_SPACING};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How long a burst of reorders may continue before the final position is
/// written back to the store.
const PERSIST_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// In-memory ordered view of the store, shared between the presentation
/// layer, the download supervisor and the player glue.
///
/// Reads take the shared lock; every mutation (swap, insert, delete, bulk
/// replacement) takes the exclusive lock, so no reader ever observes a
/// partially updated list.
pub struct Playlist {
    store: Arc<dyn Store>,
    rows: RwLock<Vec<PlaylistEntry>>,
    /// Bumped on every reorder; a scheduled persistence request only fires
    /// if its captured generation is still current.
    generation: AtomicU64,
    sink: EventSink,
    persist_delay: Duration,
}

impl Playlist {
    pub fn new(store: Arc<dyn Store>, sink: EventSink) -> Self {
        Self {
            store,
            rows: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            sink,
            persist_delay: PERSIST_DELAY,
        }
    }

    /// Override the debounce window. Intended for tests.
    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    /// Bulk-replace the cache from the store.
    pub fn refresh(&self) -> Result<(), AppError> {
        let entries = self.store.get_entries()?;
        let mut rows = self.rows.write().unwrap();
        *rows = entries;
        Ok(())
    }

    /// Snapshot of the current entries in display order.
    pub fn entries(&self) -> Vec<PlaylistEntry> {
        self.rows.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }

    pub fn entry_at(&self, index: usize) -> Option<PlaylistEntry> {
        self.rows.read().unwrap().get(index).cloned()
    }

    pub fn entry_by_id(&self, id: &str) -> Option<PlaylistEntry> {
        self.rows.read().unwrap().iter().find(|e| e.id == id).cloned()
    }

    /// Most recent entry that has not been watched yet, if any. Used by the
    /// presentation layer to auto-advance when playback ends.
    pub fn first_unwatched(&self) -> Option<PlaylistEntry> {
        self.rows
            .read()
            .unwrap()
            .iter()
            .find(|e| !e.watched)
            .cloned()
    }

    /// Persist a new entry and place it in the cache at its key position.
    pub fn add_entry(
        &self,
        name: &str,
        url: &str,
        location: &str,
    ) -> Result<PlaylistEntry, AppError> {
        let entry = self.store.add_entry(name, url, location)?;

        let mut rows = self.rows.write().unwrap();
        let pos = rows
            .iter()
            .position(|e| e.order_key < entry.order_key)
            .unwrap_or(rows.len());
        rows.insert(pos, entry.clone());

        Ok(entry)
    }

    /// Flip the watched flag of the entry at `index`.
    pub fn toggle_watched(&self, index: usize) -> Result<PlaylistEntry, AppError> {
        let (id, watched) = {
            let rows = self.rows.read().unwrap();
            let entry = rows
                .get(index)
                .ok_or_else(|| AppError::ValidationError(format!("no row at index {index}")))?;
            (entry.id.clone(), entry.watched)
        };

        let updated = self.store.set_watched(&id, !watched)?;

        let mut rows = self.rows.write().unwrap();
        if let Some(row) = rows.iter_mut().find(|e| e.id == id) {
            *row = updated.clone();
        }

        Ok(updated)
    }

    pub fn delete_entry(&self, index: usize) -> Result<PlaylistEntry, AppError> {
        let id = {
            let rows = self.rows.read().unwrap();
            rows.get(index)
                .ok_or_else(|| AppError::ValidationError(format!("no row at index {index}")))?
                .id
                .clone()
        };

        self.store.delete_entry(&id)?;

        let mut rows = self.rows.write().unwrap();
        let removed = rows
            .iter()
            .position(|e| e.id == id)
            .map(|pos| rows.remove(pos))
            .ok_or_else(|| AppError::EntryNotFound(id))?;

        Ok(removed)
    }

    /// Swap the entry at `index` with its neighbor and schedule a debounced
    /// write-back of the moved entry's order key. Returns the entry's new
    /// index; moving past either end is a no-op, not an error.
    ///
    /// The in-memory order changes immediately; only the final position of a
    /// burst of moves reaches the store.
    pub fn move_entry(
        self: &Arc<Self>,
        index: usize,
        direction: MoveDirection,
    ) -> Result<usize, AppError> {
        let (moved_id, generation) = {
            let mut rows = self.rows.write().unwrap();
            if index >= rows.len() {
                return Err(AppError::ValidationError(format!("no row at index {index}")));
            }

            let target = match direction {
                MoveDirection::Up => index.saturating_sub(1),
                MoveDirection::Down => (index + 1).min(rows.len() - 1),
            };

            if target == index {
                return Ok(index);
            }

            rows.swap(index, target);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (rows[target].id.clone(), generation)
        };

        let playlist = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(playlist.persist_delay).await;

            if playlist.generation.load(Ordering::SeqCst) != generation {
                debug!("reorder generation {generation} superseded, skipping persistence");
                return;
            }

            if let Err(err) = playlist.persist_order(&moved_id) {
                warn!("failed to persist order for entry {moved_id}: {err}");
                playlist
                    .sink
                    .send(Event::Error(format!("failed to persist order: {err}")));
            }
        });

        Ok(match direction {
            MoveDirection::Up => index - 1,
            MoveDirection::Down => index + 1,
        })
    }

    /// Write back the moved entry's key as the midpoint of its current
    /// neighbors, then mirror the new key into the cache.
    fn persist_order(&self, id: &str) -> Result<(), AppError> {
        let key = {
            let rows = self.rows.read().unwrap();
            let pos = rows
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| AppError::EntryNotFound(id.to_string()))?;

            let above = pos.checked_sub(1).map(|i| rows[i].order_key);
            let below = rows.get(pos + 1).map(|e| e.order_key);
            midpoint_key(above, below)
        };

        self.store.update_order(id, key)?;

        let mut rows = self.rows.write().unwrap();
        if let Some(row) = rows.iter_mut().find(|e| e.id == id) {
            row.order_key = key;
        }

        Ok(())
    }
}

/// Integer midpoint of the moved entry's neighbors. Keys descend top to
/// bottom; a missing lower bound falls back to 0, a missing upper bound
/// grows past the neighbor by the default spacing. Only the moved entry is
/// ever rewritten; the list is never renumbered, so sustained halving in one
/// neighborhood can still exhaust the gap (accepted limitation of the key
/// scheme).
fn midpoint_key(above: Option<i64>, below: Option<i64>) -> i64 {
    match (above, below) {
        (Some(above), Some(below)) => below + (above - below) / 2,
        (None, Some(below)) => below + KEY_SPACING,
        (Some(above), None) => above / 2,
        (None, None) => KEY_SPACING,
    }
}
