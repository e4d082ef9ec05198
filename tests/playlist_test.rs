// tests/playlist_test.rs
// Playlist cache, reordering and the debounced order-key rebalancer.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use vidqueue::events::EventSink;
use vidqueue::playlist::{MoveDirection, Playlist};
use vidqueue::store::{MemoryStore, PlaylistEntry, Store};
use vidqueue::AppError;

/// Store wrapper that records every order write-back.
struct CountingStore {
    inner: MemoryStore,
    order_calls: Mutex<Vec<(String, i64)>>,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            order_calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, i64)> {
        self.order_calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.order_calls.lock().unwrap().clear();
    }
}

impl Store for CountingStore {
    fn get_entries(&self) -> Result<Vec<PlaylistEntry>, AppError> {
        self.inner.get_entries()
    }

    fn add_entry(
        &self,
        name: &str,
        url: &str,
        location: &str,
    ) -> Result<PlaylistEntry, AppError> {
        self.inner.add_entry(name, url, location)
    }

    fn set_watched(&self, id: &str, watched: bool) -> Result<PlaylistEntry, AppError> {
        self.inner.set_watched(id, watched)
    }

    fn update_order(&self, id: &str, order_key: i64) -> Result<(), AppError> {
        self.order_calls
            .lock()
            .unwrap()
            .push((id.to_string(), order_key));
        self.inner.update_order(id, order_key)
    }

    fn delete_entry(&self, id: &str) -> Result<(), AppError> {
        self.inner.delete_entry(id)
    }
}

/// Playlist over a counting store, seeded with `names` top to bottom and a
/// short debounce window.
fn seeded_playlist(names: &[&str]) -> (Arc<Playlist>, Arc<CountingStore>) {
    let store = Arc::new(CountingStore::new());

    // MemoryStore keys ascend per add, so insert bottom-up to get the
    // requested top-to-bottom order.
    for name in names.iter().rev() {
        store
            .add_entry(name, &format!("https://x/{name}"), "/videos")
            .unwrap();
    }

    let (sink, _rx) = EventSink::channel();
    let playlist = Arc::new(
        Playlist::new(store.clone() as Arc<dyn Store>, sink)
            .with_persist_delay(Duration::from_millis(50)),
    );
    playlist.refresh().unwrap();

    (playlist, store)
}

fn names(playlist: &Playlist) -> Vec<String> {
    playlist.entries().into_iter().map(|e| e.name).collect()
}

#[tokio::test]
async fn add_entry_goes_to_top() {
    let (playlist, _store) = seeded_playlist(&["a", "b"]);

    playlist.add_entry("c", "https://x/c", "/videos").unwrap();

    assert_eq!(names(&playlist), ["c", "a", "b"]);
    assert_eq!(playlist.len(), 3);
    assert_eq!(playlist.entry_at(0).unwrap().name, "c");
    assert!(playlist.entry_at(3).is_none());
}

#[tokio::test]
async fn move_up_then_down_restores_order() {
    let (playlist, _store) = seeded_playlist(&["a", "b", "c"]);

    let new_index = playlist.move_entry(1, MoveDirection::Up).unwrap();
    assert_eq!(new_index, 0);
    assert_eq!(names(&playlist), ["b", "a", "c"]);

    playlist.move_entry(0, MoveDirection::Down).unwrap();
    assert_eq!(names(&playlist), ["a", "b", "c"]);
}

#[tokio::test]
async fn move_past_either_end_is_a_noop() {
    let (playlist, _store) = seeded_playlist(&["a", "b"]);

    assert_eq!(playlist.move_entry(0, MoveDirection::Up).unwrap(), 0);
    assert_eq!(playlist.move_entry(1, MoveDirection::Down).unwrap(), 1);
    assert_eq!(names(&playlist), ["a", "b"]);

    assert!(playlist.move_entry(5, MoveDirection::Down).is_err());
}

#[tokio::test]
async fn persisted_key_is_midpoint_of_new_neighbors() {
    let (playlist, store) = seeded_playlist(&["a", "b", "c"]);

    // Fix the neighborhood so the moved entry lands between keys 20 and 10.
    let entries = playlist.entries();
    store.update_order(&entries[0].id, 30).unwrap();
    store.update_order(&entries[1].id, 20).unwrap();
    store.update_order(&entries[2].id, 10).unwrap();
    playlist.refresh().unwrap();
    store.clear_calls();

    let moved = playlist.entries()[0].clone();
    playlist.move_entry(0, MoveDirection::Down).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.calls(), vec![(moved.id.clone(), 15)]);
    assert_eq!(playlist.entry_by_id(&moved.id).unwrap().order_key, 15);
}

#[tokio::test]
async fn burst_of_moves_persists_once_with_final_position() {
    let (playlist, store) = seeded_playlist(&["a", "b", "c", "d"]);
    store.clear_calls();

    let moved = playlist.entries()[0].clone();
    playlist.move_entry(0, MoveDirection::Down).unwrap();
    playlist.move_entry(1, MoveDirection::Down).unwrap();
    playlist.move_entry(2, MoveDirection::Down).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = store.calls();
    assert_eq!(calls.len(), 1, "expected exactly one persistence call");
    assert_eq!(calls[0].0, moved.id);
    assert_eq!(names(&playlist), ["b", "c", "d", "a"]);

    // Bottom position: key halves toward zero below the last neighbor.
    let above = playlist.entries()[2].order_key;
    assert_eq!(calls[0].1, above / 2);
}

#[tokio::test]
async fn toggle_watched_round_trips_through_the_store() {
    let (playlist, _store) = seeded_playlist(&["a"]);

    let updated = playlist.toggle_watched(0).unwrap();
    assert!(updated.watched);
    assert!(playlist.entries()[0].watched);

    let updated = playlist.toggle_watched(0).unwrap();
    assert!(!updated.watched);
}

#[tokio::test]
async fn delete_removes_from_store_and_cache() {
    let (playlist, store) = seeded_playlist(&["a", "b"]);

    let removed = playlist.delete_entry(0).unwrap();
    assert_eq!(removed.name, "a");
    assert_eq!(names(&playlist), ["b"]);
    assert_eq!(store.get_entries().unwrap().len(), 1);

    assert!(playlist.delete_entry(7).is_err());
}

#[tokio::test]
async fn first_unwatched_skips_watched_entries() {
    let (playlist, _store) = seeded_playlist(&["a", "b", "c"]);

    playlist.toggle_watched(0).unwrap();

    assert_eq!(playlist.first_unwatched().unwrap().name, "b");
}
