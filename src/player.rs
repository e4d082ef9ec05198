// src/player.rs
// Lazy supervisor for the single external player process.

use crate::error::AppError;
use crate::events::EventSink;
use crate::ipc::{IpcClient, IpcCommand};
use log::{debug, error, info};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;

const DEFAULT_PLAYER: &str = "mpv";
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Player session states. `Paused` is reachable only through an explicit
/// pause command; the supervisor never infers it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayerStatus {
    #[default]
    NotRunning,
    Starting,
    Ready,
    Playing,
    Paused,
    Stopped,
}

/// Mutable session record, shared between the supervisor, the IPC reader
/// and the process monitor. All access goes through the one mutex.
#[derive(Debug, Default)]
pub struct PlayerSession {
    pub status: PlayerStatus,
    pub current_id: Option<String>,
    pub playtime: Duration,
    pub remaining: Duration,
    pub pid: Option<u32>,
}

/// Settings for the player invocation. Collaborators fill this struct; the
/// crate never reads configuration files.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Player executable, `mpv` compatible.
    pub program: String,
    /// Control socket the player is told to serve.
    pub socket_path: PathBuf,
    /// File the player's stdout and stderr are redirected to.
    pub log_path: PathBuf,
    /// Bound on the wait for the control socket after a spawn.
    pub ready_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let state_dir = dirs_next::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vidqueue");

        Self {
            program: DEFAULT_PLAYER.to_string(),
            socket_path: state_dir.join("player.sock"),
            log_path: state_dir.join("player.log"),
            ready_timeout: READY_TIMEOUT,
        }
    }
}

/// Supervisor for one external player process per run, started lazily on the
/// first play request and torn down by `quit`.
pub struct Player {
    config: PlayerConfig,
    session: Arc<Mutex<PlayerSession>>,
    ipc: Arc<Mutex<Option<Arc<IpcClient>>>>,
    sink: EventSink,
}

impl Player {
    pub fn new(config: PlayerConfig, sink: EventSink) -> Result<Self, AppError> {
        if let Some(dir) = config.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = config.socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            config,
            session: Arc::new(Mutex::new(PlayerSession::default())),
            ipc: Arc::new(Mutex::new(None)),
            sink,
        })
    }

    /// Play `path`, starting the player process first if needed. Returns once
    /// the load and resume commands are queued and the session is Playing
    /// with the given id.
    pub async fn play(&self, path: &str, id: &str) -> Result<(), AppError> {
        let ipc = self.ensure_running().await?;

        ipc.send(IpcCommand::Load {
            path: path.to_string(),
        })?;
        ipc.send(IpcCommand::Resume)?;

        let mut session = self.session.lock().unwrap();
        session.status = PlayerStatus::Playing;
        session.current_id = Some(id.to_string());
        info!("playing {id}: {path}");

        Ok(())
    }

    /// Stop playback. A no-op unless the session is currently Playing.
    pub fn stop(&self) -> Result<(), AppError> {
        {
            let session = self.session.lock().unwrap();
            if session.status != PlayerStatus::Playing {
                return Ok(());
            }
        }

        let ipc = self
            .client()
            .ok_or_else(|| AppError::PlayerError("player is not running".to_string()))?;
        ipc.send(IpcCommand::Stop)?;

        let mut session = self.session.lock().unwrap();
        session.status = PlayerStatus::Stopped;
        session.playtime = Duration::ZERO;
        session.remaining = Duration::ZERO;

        Ok(())
    }

    /// Ask the player process to exit. Does not wait for it; the monitor
    /// task flips the session to NotRunning once the process is gone.
    pub fn quit(&self) -> Result<(), AppError> {
        if !self.is_running() {
            return Ok(());
        }

        if let Some(ipc) = self.client() {
            ipc.send(IpcCommand::Quit)?;
        }

        Ok(())
    }

    pub fn status(&self) -> PlayerStatus {
        self.session.lock().unwrap().status
    }

    /// The id loaded into the player, reported only while Playing.
    pub fn currently_playing(&self) -> Option<String> {
        let session = self.session.lock().unwrap();
        match session.status {
            PlayerStatus::Playing => session.current_id.clone(),
            _ => None,
        }
    }

    /// Elapsed and remaining playback time as last reported by the player.
    pub fn playtime(&self) -> (Duration, Duration) {
        let session = self.session.lock().unwrap();
        (session.playtime, session.remaining)
    }

    /// Liveness of the player process, probed with signal 0.
    pub fn is_running(&self) -> bool {
        let session = self.session.lock().unwrap();
        match session.pid {
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
            None => false,
        }
    }

    fn client(&self) -> Option<Arc<IpcClient>> {
        self.ipc.lock().unwrap().clone()
    }

    /// Start the player process and its control connection unless a live one
    /// exists. Blocks until the control socket is dialable and subscribed.
    async fn ensure_running(&self) -> Result<Arc<IpcClient>, AppError> {
        if self.is_running() {
            if let Some(ipc) = self.client() {
                return Ok(ipc);
            }
            // Process alive but the connection is gone: dial its socket again.
            return self.connect().await;
        }

        self.session.lock().unwrap().status = PlayerStatus::Starting;

        // A stale socket from a previous run would satisfy the dialer before
        // the fresh process serves it.
        let _ = std::fs::remove_file(&self.config.socket_path);

        let log = File::create(&self.config.log_path)?;
        let mut command = AsyncCommand::new(&self.config.program);
        command
            .arg("--save-position-on-quit")
            .arg("--keep-open=yes")
            .arg("--idle=yes")
            .arg(format!(
                "--input-ipc-server={}",
                self.config.socket_path.display()
            ))
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        let mut child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => AppError::MissingDependency(self.config.program.clone()),
            _ => AppError::IoError(err),
        })?;

        let pid = child.id();
        debug!("player started, pid {pid:?}");

        {
            let mut session = self.session.lock().unwrap();
            session.pid = pid;
        }

        // Monitor task: reap the child and tear the session down on exit.
        let session = Arc::clone(&self.session);
        let ipc_slot = Arc::clone(&self.ipc);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("player exited"),
                Ok(status) => error!("player exited with {status}"),
                Err(err) => error!("failed to wait on player process: {err}"),
            }

            if let Some(client) = ipc_slot.lock().unwrap().take() {
                client.shutdown();
            }

            let mut session = session.lock().unwrap();
            session.status = PlayerStatus::NotRunning;
            session.current_id = None;
            session.pid = None;
            session.playtime = Duration::ZERO;
            session.remaining = Duration::ZERO;
        });

        self.connect().await
    }

    /// Dial the control socket and install the client once it is ready. A
    /// client that never becomes ready is torn down again so a later play
    /// request starts from a clean slate.
    async fn connect(&self) -> Result<Arc<IpcClient>, AppError> {
        let ipc = Arc::new(IpcClient::spawn(
            self.config.socket_path.clone(),
            Arc::clone(&self.session),
            self.sink.clone(),
        ));

        match ipc.wait_connected(self.config.ready_timeout).await {
            Ok(()) => {
                let previous = self.ipc.lock().unwrap().replace(Arc::clone(&ipc));
                if let Some(previous) = previous {
                    previous.shutdown();
                }

                self.session.lock().unwrap().status = PlayerStatus::Ready;
                Ok(ipc)
            }
            Err(err) => {
                ipc.shutdown();
                Err(err)
            }
        }
    }
}
