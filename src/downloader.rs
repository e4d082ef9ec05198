// src/downloader.rs
// Bounded download queue and the single worker supervising the agent process.

use crate::error::AppError;
use crate::events::{Event, EventSink};
use crate::playlist::Playlist;
use humansize::{format_size, BINARY};
use log::{debug, error, info, warn};
use notify_rust::Notification;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const DEFAULT_AGENT: &str = "yt-dlp";
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const CONCURRENT_FRAGMENTS: &str = "100";
/// Output template with a bounded title length so filenames stay portable.
const TITLE_TEMPLATE: &str = "%(title).50s [%(id)s].%(ext)s";
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

const SPOOFED_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Invocation variants for one job, tried in order. A non-zero exit moves to
/// the next strategy; running out of strategies abandons the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptStrategy {
    Default,
    /// Present a browser identity to hosts that reject the agent's own.
    SpoofUserAgent,
}

const ATTEMPT_STRATEGIES: &[AttemptStrategy] =
    &[AttemptStrategy::Default, AttemptStrategy::SpoofUserAgent];

impl AttemptStrategy {
    fn apply(&self, command: &mut AsyncCommand) {
        match self {
            Self::Default => {}
            Self::SpoofUserAgent => {
                command.arg("--user-agent").arg(SPOOFED_USER_AGENT);
            }
        }
    }
}

/// Settings for the queue and the agent invocation. Collaborators fill this
/// struct; the crate never reads configuration files.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Download agent executable, `yt-dlp` compatible.
    pub agent: String,
    /// Directory finished files land in.
    pub download_dir: PathBuf,
    /// Directory for in-flight fragments, separate from `download_dir`.
    pub temp_dir: PathBuf,
    pub queue_capacity: usize,
    /// Minimum spacing between "downloading" notifications per job.
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let download_dir = dirs_next::download_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidqueue");

        Self {
            agent: DEFAULT_AGENT.to_string(),
            download_dir,
            temp_dir: std::env::temp_dir().join("vidqueue"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

/// Progress states reported on the agent's stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Preparing,
    Downloading,
    Finished,
    Error,
    #[serde(other)]
    #[default]
    Unknown,
}

/// One line of the agent's JSON progress stream. Numeric fields arrive as
/// null while the agent is still probing, hence the options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub status: ProgressStatus,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub downloaded_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes_estimate: Option<f64>,
    /// Bytes per second.
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub elapsed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
}

impl ProgressRecord {
    /// Completed fraction in 0.0..=1.0, against the exact total when the
    /// agent knows it and its estimate otherwise.
    pub fn percent(&self) -> f64 {
        let total = self
            .total_bytes
            .or(self.total_bytes_estimate)
            .unwrap_or(0.0);
        if total <= 0.0 {
            return 0.0;
        }

        (self.downloaded_bytes.unwrap_or(0.0) / total).clamp(0.0, 1.0)
    }

    pub fn format_speed(&self) -> String {
        match self.speed {
            Some(speed) if speed > 0.0 => format!("{}/s", format_size(speed as u64, BINARY)),
            _ => "-".to_string(),
        }
    }
}

/// Parse one stdout line as an independent progress record.
pub fn parse_progress_line(line: &str) -> Result<ProgressRecord, AppError> {
    Ok(serde_json::from_str(line)?)
}

/// One queued download request. Never persisted; lost on crash.
#[derive(Debug)]
struct Job {
    url: String,
    /// Index into [`ATTEMPT_STRATEGIES`] of the next strategy to run.
    attempt: usize,
}

enum AttemptOutcome {
    Success,
    Failed(i32),
    /// Shutdown arrived mid-download; the agent was asked to terminate.
    Interrupted,
}

/// Owner of the bounded job queue and the single worker task.
pub struct Downloader {
    queue_tx: mpsc::Sender<Job>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: EventSink,
}

impl Downloader {
    /// Create the queue directories and start the worker task.
    pub fn spawn(
        config: DownloadConfig,
        playlist: Arc<Playlist>,
        sink: EventSink,
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.download_dir)?;
        std::fs::create_dir_all(&config.temp_dir)?;

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            config,
            playlist,
            sink: sink.clone(),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(worker.run(queue_rx));

        Ok(Self {
            queue_tx,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
            sink,
        })
    }

    /// Queue a URL for download. Waits for queue space when the queue is
    /// full; this backpressure is deliberate, jobs are never dropped.
    pub async fn enqueue(&self, url: &str) -> Result<(), AppError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::ValidationError(
                "download URL must not be empty".to_string(),
            ));
        }

        if *self.shutdown_tx.borrow() {
            return Err(AppError::QueueClosed);
        }

        let job = Job {
            url: url.to_string(),
            attempt: 0,
        };
        self.queue_tx
            .send(job)
            .await
            .map_err(|_| AppError::QueueClosed)?;

        self.sink.send(Event::DownloadQueued {
            url: url.to_string(),
        });
        Ok(())
    }

    /// Stop accepting jobs, ask the in-flight agent to terminate, and wait
    /// for the worker to exit. Queued-but-unstarted jobs are discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("download worker panicked during shutdown: {err}");
            }
        }
    }
}

struct Worker {
    config: DownloadConfig,
    playlist: Arc<Playlist>,
    sink: EventSink,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self, mut queue: mpsc::Receiver<Job>) {
        loop {
            let job = tokio::select! {
                _ = self.shutdown.changed() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.run_job(job).await;
        }

        debug!("download worker exited");
    }

    /// Walk the attempt-strategy list for one job. Exactly one job runs at a
    /// time; the queue waits while this does.
    async fn run_job(&mut self, mut job: Job) {
        info!("starting download: {}", job.url);

        while job.attempt < ATTEMPT_STRATEGIES.len() {
            let strategy = ATTEMPT_STRATEGIES[job.attempt];
            job.attempt += 1;

            match self.run_attempt(&job.url, strategy).await {
                Ok(AttemptOutcome::Success) => {
                    info!("download completed: {}", job.url);
                    return;
                }
                Ok(AttemptOutcome::Interrupted) => return,
                Ok(AttemptOutcome::Failed(code)) => {
                    if job.attempt < ATTEMPT_STRATEGIES.len() {
                        warn!(
                            "download attempt {} failed with status {code}, retrying: {}",
                            job.attempt, job.url
                        );
                        continue;
                    }

                    error!("abandoning download after {} attempts: {}", job.attempt, job.url);
                    self.sink.send(Event::DownloadFailed {
                        url: job.url.clone(),
                        message: format!(
                            "agent exited with status {code} after {} attempts",
                            job.attempt
                        ),
                    });
                    return;
                }
                Err(err) => {
                    error!("failed to run download agent: {err}");
                    self.sink.send(Event::DownloadFailed {
                        url: job.url.clone(),
                        message: err.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn run_attempt(
        &mut self,
        url: &str,
        strategy: AttemptStrategy,
    ) -> Result<AttemptOutcome, AppError> {
        self.sink.send(Event::DownloadStarted {
            url: url.to_string(),
        });

        let mut command = AsyncCommand::new(&self.config.agent);
        command
            .arg("--concurrent-fragments")
            .arg(CONCURRENT_FRAGMENTS)
            .arg("--progress")
            .arg("--progress-template")
            .arg("%(progress)j")
            .arg("--newline")
            .arg("--quiet")
            .arg("--no-warning")
            .arg("--output")
            .arg(TITLE_TEMPLATE)
            .arg("--paths")
            .arg(format!("home:{}", self.config.download_dir.display()))
            .arg("--paths")
            .arg(format!("temp:{}", self.config.temp_dir.display()));
        strategy.apply(&mut command);
        command.arg(url);

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => AppError::MissingDependency(self.config.agent.clone()),
            _ => AppError::IoError(err),
        })?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let reader = StdoutReader {
                sink: self.sink.clone(),
                playlist: Arc::clone(&self.playlist),
                url: url.to_string(),
                download_dir: self.config.download_dir.clone(),
                interval: self.config.progress_interval,
            };
            tokio::spawn(reader.run(stdout))
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!("download agent: {line}");
                    sink.send(Event::Error(format!("download agent: {line}")));
                }
            })
        });

        let mut shutdown = self.shutdown.clone();
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = shutdown.changed() => None,
        };

        let status = match waited {
            Some(status) => status?,
            None => {
                self.sink.send(Event::ShuttingDown);
                terminate(&child);
                let _ = child.wait().await;
                join_readers(stdout_task, stderr_task).await;
                return Ok(AttemptOutcome::Interrupted);
            }
        };

        // Drain both streams so terminal frames are delivered before the
        // attempt outcome is decided.
        join_readers(stdout_task, stderr_task).await;

        if status.success() {
            Ok(AttemptOutcome::Success)
        } else {
            Ok(AttemptOutcome::Failed(status.code().unwrap_or(-1)))
        }
    }
}

/// Reads the agent's progress stream for one attempt.
struct StdoutReader {
    sink: EventSink,
    playlist: Arc<Playlist>,
    url: String,
    download_dir: PathBuf,
    interval: Duration,
}

impl StdoutReader {
    async fn run(self, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut last_progress: Option<Instant> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let record = match parse_progress_line(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!("skipping malformed progress record: {err}");
                    self.sink
                        .send(Event::Error(format!("malformed progress record: {err}")));
                    continue;
                }
            };

            match record.status {
                ProgressStatus::Downloading => {
                    // Intermediate frames are rate-limited; dropping them is
                    // fine, the next frame supersedes.
                    let due = last_progress.map_or(true, |at| at.elapsed() >= self.interval);
                    if due {
                        last_progress = Some(Instant::now());
                        self.sink.send(Event::DownloadProgress(record));
                    }
                }
                ProgressStatus::Finished => self.finish(&record),
                ProgressStatus::Error => {
                    error!("download agent reported an error: {line}");
                    self.sink
                        .send(Event::Error("download agent reported an error".to_string()));
                }
                ProgressStatus::Preparing | ProgressStatus::Unknown => {}
            }
        }
    }

    /// Record the finished file in the playlist and notify. Terminal frames
    /// are never rate-limited.
    fn finish(&self, record: &ProgressRecord) {
        let filename = Path::new(&record.filename)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| record.filename.clone());

        let location = self.download_dir.to_string_lossy().into_owned();
        if let Err(err) = self.playlist.add_entry(&filename, &self.url, &location) {
            error!("failed to record downloaded file {filename}: {err}");
            self.sink
                .send(Event::Error(format!("failed to record download: {err}")));
        }

        if let Err(err) = Notification::new()
            .summary("Download Complete")
            .body(&format!("{filename} downloaded successfully."))
            .show()
        {
            debug!("failed to show desktop notification: {err}");
        }

        self.sink.send(Event::DownloadFinished {
            filename,
            download_path: self.download_dir.clone(),
            url: self.url.clone(),
        });
    }
}

async fn join_readers(stdout: Option<JoinHandle<()>>, stderr: Option<JoinHandle<()>>) {
    if let Some(task) = stdout {
        let _ = task.await;
    }
    if let Some(task) = stderr {
        let _ = task.await;
    }
}

/// Ask the agent to terminate so it can finalize its partial files. The
/// worker still waits for the exit afterwards.
fn terminate(child: &Child) {
    match child.id() {
        Some(pid) => unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        },
        None => debug!("agent already exited before termination request"),
    }
}
