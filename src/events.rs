// src/events.rs
// Notification plumbing between the core components and the presentation layer

use crate::downloader::ProgressRecord;
use log::trace;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Asynchronous notifications pushed by the core to the presentation layer.
///
/// Every variant is fire-and-forget; the core never waits for the receiver.
#[derive(Debug, Clone)]
pub enum Event {
    /// A URL was accepted into the download queue
    DownloadQueued { url: String },
    /// The worker picked up a job and is preparing the agent
    DownloadStarted { url: String },
    /// Rate-limited progress snapshot for the in-flight job
    DownloadProgress(ProgressRecord),
    /// The agent finished writing the file
    DownloadFinished {
        filename: String,
        download_path: PathBuf,
        url: String,
    },
    /// The job was abandoned after its last attempt strategy failed
    DownloadFailed { url: String, message: String },
    /// Informational error (stderr line, malformed frame); processing continues
    Error(String),
    /// Player loaded or unloaded a file; callers should re-derive playing state
    PlaybackChanged,
    /// Playback position as a fraction in 0.0..=1.0
    PlaybackProgress(f64),
    /// Playback reached end of file
    PlaybackFinished,
    /// Shutdown started; the in-flight job is being waited on
    ShuttingDown,
}

/// Cloneable sending handle given to every core component at construction.
///
/// Sending never blocks and never fails loudly: once the receiving side is
/// gone the events are dropped, which only happens during teardown.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Create a sink and the receiver the presentation layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped, notification discarded");
        }
    }
}
