// src/lib.rs
// Control-plane core for a terminal media download queue and player:
// a bounded job queue feeding one download-agent worker, an IPC client
// driving one external player over its control socket, and the shared
// ordered playlist both of them mutate.

pub mod downloader;
pub mod error;
pub mod events;
pub mod ipc;
pub mod player;
pub mod playlist;
pub mod store;

pub use downloader::{DownloadConfig, Downloader, ProgressRecord, ProgressStatus};
pub use error::AppError;
pub use events::{Event, EventSink};
pub use player::{Player, PlayerConfig, PlayerStatus};
pub use playlist::{MoveDirection, Playlist};
pub use store::{MemoryStore, PlaylistEntry, Store};
