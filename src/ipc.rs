// src/ipc.rs
// Typed protocol and connection plumbing for the player's control socket.
// Commands and events are newline-delimited JSON records; both are decoded
// exactly once at this boundary.

use crate::error::AppError;
use crate::events::{Event, EventSink};
use crate::player::{PlayerSession, PlayerStatus};
use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

/// Pause after a successful dial before using the socket; the player accepts
/// the connection slightly before it serves it.
const POST_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Properties the client observes on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedProperty {
    EofReached,
    TimePos,
    TimeRemaining,
    PercentPos,
}

impl ObservedProperty {
    pub const ALL: [Self; 4] = [
        Self::EofReached,
        Self::TimePos,
        Self::TimeRemaining,
        Self::PercentPos,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::EofReached => "eof-reached",
            Self::TimePos => "time-pos",
            Self::TimeRemaining => "time-remaining",
            Self::PercentPos => "percent-pos",
        }
    }
}

/// Commands accepted by the player, one variant per verb. Fire-and-forget;
/// the observe id is a correlation identifier for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    Load { path: String },
    Resume,
    Pause,
    Stop,
    Quit,
    Observe { id: u64, property: ObservedProperty },
}

impl IpcCommand {
    fn to_wire(&self) -> Value {
        let command = match self {
            Self::Load { path } => json!(["loadfile", path]),
            Self::Resume => json!(["set_property", "pause", false]),
            Self::Pause => json!(["set_property", "pause", true]),
            Self::Stop => json!(["stop"]),
            Self::Quit => json!(["quit"]),
            Self::Observe { id, property } => json!(["observe_property", id, property.name()]),
        };

        json!({ "command": command })
    }

    /// Newline-terminated wire frame.
    pub fn encode(&self) -> String {
        format!("{}\n", self.to_wire())
    }
}

/// Raw frame shape pushed by the player.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    request_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

/// Events pushed by the player, decoded from the wire exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcEvent {
    FileLoaded,
    Property(PropertyValue),
    EndFile { reason: Option<String> },
    Reply { request_id: i64, error: Option<String> },
    ProtocolError { event: String, message: String },
    Other { event: String },
}

/// Decoded payload of a property-change frame. Values arrive as null while
/// no file is loaded; those fall through to `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    EofReached(bool),
    TimePos(f64),
    TimeRemaining(f64),
    PercentPos(f64),
    Other { name: String },
}

pub fn decode_event(line: &str) -> Result<IpcEvent, AppError> {
    let wire: WireEvent = serde_json::from_str(line)?;

    if let Some(request_id) = wire.request_id {
        return Ok(IpcEvent::Reply {
            request_id,
            error: wire.error.filter(|e| e != "success"),
        });
    }

    if let Some(message) = wire.error {
        return Ok(IpcEvent::ProtocolError {
            event: wire.event.unwrap_or_default(),
            message,
        });
    }

    let event = wire
        .event
        .ok_or_else(|| AppError::IpcError("frame carries neither event nor request_id".to_string()))?;

    Ok(match event.as_str() {
        "file-loaded" => IpcEvent::FileLoaded,
        "property-change" => IpcEvent::Property(decode_property(wire.name, wire.data)),
        "end-file" => IpcEvent::EndFile {
            reason: wire.reason,
        },
        _ => IpcEvent::Other { event },
    })
}

fn decode_property(name: Option<String>, data: Option<Value>) -> PropertyValue {
    let name = name.unwrap_or_default();
    let number = data.as_ref().and_then(Value::as_f64);

    match (name.as_str(), number) {
        ("eof-reached", _) => {
            PropertyValue::EofReached(data.as_ref().and_then(Value::as_bool).unwrap_or(false))
        }
        ("time-pos", Some(value)) => PropertyValue::TimePos(value),
        ("time-remaining", Some(value)) => PropertyValue::TimeRemaining(value),
        ("percent-pos", Some(value)) => PropertyValue::PercentPos(value),
        _ => PropertyValue::Other { name },
    }
}

/// Bounded retry schedule for dialing the control socket. The player offers
/// no readiness signal, so the connector polls with growing delays until the
/// schedule is exhausted. Kept as an explicit state machine so the schedule
/// is testable without a socket.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: initial_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the schedule is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        self.attempt += 1;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        Some(delay)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(50, Duration::from_millis(20), Duration::from_millis(500))
    }
}

/// Handle over one player connection lifecycle: an in-process command queue
/// serviced by a writer task, an event reader, and a supervisor that redials
/// the socket when an epoch ends.
pub struct IpcClient {
    command_tx: mpsc::UnboundedSender<IpcCommand>,
    connected_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl IpcClient {
    pub fn spawn(
        socket_path: PathBuf,
        session: Arc<Mutex<PlayerSession>>,
        sink: EventSink,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = Connection {
            socket_path,
            session,
            sink,
            command_tx: command_tx.clone(),
            connected_tx,
            shutdown: shutdown_rx,
            observe_id: AtomicU64::new(1),
        };
        tokio::spawn(connection.run(command_rx));

        Self {
            command_tx,
            connected_rx,
            shutdown_tx,
        }
    }

    /// Queue a command. Delivery is at-least-once: a command whose write hits
    /// a closed socket is retried against the next connection.
    pub fn send(&self, command: IpcCommand) -> Result<(), AppError> {
        self.command_tx
            .send(command)
            .map_err(|_| AppError::IpcError("command queue closed".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Wait until the socket is connected and the property subscriptions are
    /// queued, bounded by `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), AppError> {
        let mut connected = self.connected_rx.clone();

        let wait = async {
            while !*connected.borrow() {
                connected.changed().await.map_err(|_| {
                    AppError::PlayerError("control connection task exited".to_string())
                })?;
            }
            Ok(())
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AppError::PlayerError("control socket did not become ready".to_string()))?
    }

    /// End the connection lifecycle. Pending commands are discarded; the
    /// player process itself is not touched.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Connection {
    socket_path: PathBuf,
    session: Arc<Mutex<PlayerSession>>,
    sink: EventSink,
    /// Used to re-enqueue a command whose write failed.
    command_tx: mpsc::UnboundedSender<IpcCommand>,
    connected_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    observe_id: AtomicU64,
}

impl Connection {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<IpcCommand>) {
        loop {
            let stream = match self.connect().await {
                Ok(stream) => stream,
                Err(err) => {
                    if !*self.shutdown.borrow() {
                        error!("player control socket unavailable: {err}");
                        self.sink
                            .send(Event::Error(format!("player control socket: {err}")));
                    }
                    break;
                }
            };

            debug!("connected to player control socket");
            self.subscribe();
            let _ = self.connected_tx.send(true);

            self.serve(stream, &mut command_rx).await;
            let _ = self.connected_tx.send(false);

            if *self.shutdown.borrow() {
                break;
            }
            // The socket dropped under us; dial the next epoch. Commands
            // queued meanwhile stay in the queue.
        }

        debug!("player connection task exited");
    }

    async fn connect(&mut self) -> Result<UnixStream, AppError> {
        let mut policy = RetryPolicy::default();

        loop {
            if *self.shutdown.borrow() {
                return Err(AppError::IpcError("shutdown during connect".to_string()));
            }

            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    tokio::time::sleep(POST_CONNECT_DELAY).await;
                    return Ok(stream);
                }
                Err(err) => match policy.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(AppError::PlayerError(format!(
                            "control socket {} not dialable after {} attempts: {err}",
                            self.socket_path.display(),
                            policy.attempts_made(),
                        )))
                    }
                },
            }
        }
    }

    /// Queue the property subscriptions for this epoch. Correlation ids grow
    /// monotonically for the lifetime of the client, never reused.
    fn subscribe(&self) {
        for property in ObservedProperty::ALL {
            let id = self.observe_id.fetch_add(1, Ordering::SeqCst);
            let _ = self.command_tx.send(IpcCommand::Observe { id, property });
        }
    }

    /// Service one connection epoch: the writer half drains the command
    /// queue, the reader half dispatches events, and either side ending the
    /// epoch returns control to the redial loop.
    async fn serve(
        &mut self,
        stream: UnixStream,
        command_rx: &mut mpsc::UnboundedReceiver<IpcCommand>,
    ) {
        let (read_half, mut write_half) = stream.into_split();

        let session = Arc::clone(&self.session);
        let sink = self.sink.clone();
        let mut reader = tokio::spawn(read_events(read_half, session, sink));
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    reader.abort();
                    return;
                }
                _ = &mut reader => {
                    debug!("player event stream closed");
                    return;
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        reader.abort();
                        return;
                    };

                    let frame = command.encode();
                    if let Err(err) = write_half.write_all(frame.as_bytes()).await {
                        // Never dropped: the same command goes out on the
                        // next connection.
                        debug!("re-enqueueing command after write failure: {err}");
                        let _ = self.command_tx.send(command);
                        reader.abort();
                        return;
                    }

                    debug!("player command sent: {}", frame.trim_end());
                }
            }
        }
    }
}

async fn read_events(
    read_half: OwnedReadHalf,
    session: Arc<Mutex<PlayerSession>>,
    sink: EventSink,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_event(&line, &session, &sink),
            Ok(None) => break,
            Err(err) => {
                error!("error reading from player control socket: {err}");
                break;
            }
        }
    }
}

fn dispatch_event(line: &str, session: &Mutex<PlayerSession>, sink: &EventSink) {
    let event = match decode_event(line) {
        Ok(event) => event,
        Err(err) => {
            warn!("skipping malformed player frame: {err} ({line})");
            return;
        }
    };

    match event {
        IpcEvent::Reply { request_id, error } => match error {
            Some(message) => warn!("player rejected command {request_id}: {message}"),
            None => debug!("player acknowledged command {request_id}"),
        },
        IpcEvent::ProtocolError { event, message } => {
            error!("player event error: {event}: {message}");
        }
        IpcEvent::FileLoaded => sink.send(Event::PlaybackChanged),
        IpcEvent::Property(PropertyValue::EofReached(reached)) => {
            if reached {
                sink.send(Event::PlaybackFinished);
            }
        }
        IpcEvent::Property(PropertyValue::TimePos(secs)) => {
            session.lock().unwrap().playtime = Duration::from_secs_f64(secs.max(0.0));
        }
        IpcEvent::Property(PropertyValue::TimeRemaining(secs)) => {
            session.lock().unwrap().remaining = Duration::from_secs_f64(secs.max(0.0));
        }
        IpcEvent::Property(PropertyValue::PercentPos(percent)) => {
            sink.send(Event::PlaybackProgress((percent / 100.0).clamp(0.0, 1.0)));
        }
        IpcEvent::Property(PropertyValue::Other { name }) => {
            debug!("unobserved property change: {name}");
        }
        IpcEvent::EndFile { reason } => match reason.as_deref() {
            Some("quit") => {
                let mut session = session.lock().unwrap();
                session.status = PlayerStatus::Stopped;
            }
            other => {
                debug!("playback ended: {}", other.unwrap_or("unknown"));
                sink.send(Event::PlaybackChanged);
            }
        },
        IpcEvent::Other { event } => debug!("unhandled player event: {event}"),
    }
}
