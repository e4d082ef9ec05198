// tests/player_test.rs
// Player supervisor and IPC client against a scripted fake player: a process
// that only stays alive, plus a test-owned listener on the control socket.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use vidqueue::events::{Event, EventSink};
use vidqueue::ipc::{IpcClient, IpcCommand};
use vidqueue::player::{Player, PlayerConfig, PlayerSession, PlayerStatus};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    path
}

struct FakeSession {
    player: Arc<Player>,
    events: UnboundedReceiver<Event>,
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    _dir: TempDir,
}

impl FakeSession {
    async fn next_frame(&mut self) -> String {
        timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a command frame")
            .unwrap()
            .expect("player connection closed")
    }

    async fn push_event(&mut self, frame: &str) {
        self.writer
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();
    }
}

/// Start a play request against the fake player and consume the handshake:
/// the four property subscriptions, the load, and the resume.
async fn start_playing(path: &str, id: &str) -> FakeSession {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = TempDir::new().unwrap();
    let program = write_script(dir.path(), "player.sh", "exec sleep 30");
    let socket_path = dir.path().join("player.sock");

    let config = PlayerConfig {
        program: program.to_string_lossy().into_owned(),
        socket_path: socket_path.clone(),
        log_path: dir.path().join("player.log"),
        ready_timeout: Duration::from_secs(5),
    };

    let (sink, events) = EventSink::channel();
    let player = Arc::new(Player::new(config, sink).unwrap());
    assert_eq!(player.status(), PlayerStatus::NotRunning);

    let play = {
        let player = Arc::clone(&player);
        let path = path.to_string();
        let id = id.to_string();
        tokio::spawn(async move { player.play(&path, &id).await })
    };

    // The supervisor clears stale sockets before spawning, so the fake
    // listener binds only once the connector is already retrying.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let listener = UnixListener::bind(&socket_path).unwrap();

    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("player never dialed the control socket")
        .unwrap();
    let (read_half, writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut observe_ids = Vec::new();
    for _ in 0..4 {
        let frame = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["command"][0], "observe_property");
        observe_ids.push(value["command"][1].as_u64().unwrap());
    }
    assert!(
        observe_ids.windows(2).all(|w| w[0] < w[1]),
        "correlation ids must increase: {observe_ids:?}"
    );

    let mut session = FakeSession {
        player,
        events,
        lines,
        writer,
        _dir: dir,
    };

    let load = session.next_frame().await;
    assert_eq!(load, format!("{{\"command\":[\"loadfile\",\"{path}\"]}}"));
    let resume = session.next_frame().await;
    assert_eq!(resume, "{\"command\":[\"set_property\",\"pause\",false]}");

    timeout(Duration::from_secs(5), play)
        .await
        .expect("play did not return")
        .unwrap()
        .unwrap();

    session
}

async fn wait_for<F>(events: &mut UnboundedReceiver<Event>, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never became true")
}

#[tokio::test]
async fn play_starts_process_waits_for_socket_then_loads_and_resumes() {
    let session = start_playing("/videos/a.mp4", "v1").await;

    assert_eq!(session.player.status(), PlayerStatus::Playing);
    assert_eq!(session.player.currently_playing().as_deref(), Some("v1"));
    assert!(session.player.is_running());
}

#[tokio::test]
async fn stop_sends_the_command_and_clears_the_active_id() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session.player.stop().unwrap();
    assert_eq!(session.next_frame().await, "{\"command\":[\"stop\"]}");
    assert_eq!(session.player.status(), PlayerStatus::Stopped);
    assert_eq!(session.player.currently_playing(), None);

    // Stopping again is a no-op.
    session.player.stop().unwrap();
}

#[tokio::test]
async fn file_loaded_and_percent_pos_events_reach_the_sink() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session.push_event(r#"{"event":"file-loaded"}"#).await;
    wait_for(&mut session.events, |e| matches!(e, Event::PlaybackChanged)).await;

    session
        .push_event(r#"{"event":"property-change","name":"percent-pos","data":50.0}"#)
        .await;
    let progress = wait_for(&mut session.events, |e| {
        matches!(e, Event::PlaybackProgress(_))
    })
    .await;
    match progress {
        Event::PlaybackProgress(fraction) => assert!((fraction - 0.5).abs() < 1e-9),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn time_properties_update_the_session_clock() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session
        .push_event(r#"{"event":"property-change","name":"time-pos","data":30.0}"#)
        .await;
    session
        .push_event(r#"{"event":"property-change","name":"time-remaining","data":12.0}"#)
        .await;

    let player = Arc::clone(&session.player);
    wait_until(move || player.playtime() == (Duration::from_secs(30), Duration::from_secs(12)))
        .await;
}

#[tokio::test]
async fn eof_reached_raises_playback_finished() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session
        .push_event(r#"{"event":"property-change","name":"eof-reached","data":true}"#)
        .await;
    wait_for(&mut session.events, |e| matches!(e, Event::PlaybackFinished)).await;
}

#[tokio::test]
async fn end_file_quit_stops_the_session() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session.push_event(r#"{"event":"end-file","reason":"quit"}"#).await;

    let player = Arc::clone(&session.player);
    wait_until(move || player.status() == PlayerStatus::Stopped).await;
    assert_eq!(session.player.currently_playing(), None);
}

#[tokio::test]
async fn end_file_for_other_reasons_reports_playback_changed() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session.push_event(r#"{"event":"end-file","reason":"eof"}"#).await;
    wait_for(&mut session.events, |e| matches!(e, Event::PlaybackChanged)).await;
    // The caller decides what plays next; the session is untouched.
    assert_eq!(session.player.status(), PlayerStatus::Playing);
}

#[tokio::test]
async fn quit_asks_the_player_to_exit_without_blocking() {
    let mut session = start_playing("/videos/a.mp4", "v1").await;

    session.player.quit().unwrap();
    assert_eq!(session.next_frame().await, "{\"command\":[\"quit\"]}");
}

#[tokio::test]
async fn commands_survive_a_reconnect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("player.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let (sink, _events) = EventSink::channel();
    let session = Arc::new(Mutex::new(PlayerSession::default()));
    let client = IpcClient::spawn(socket_path.clone(), session, sink);
    client
        .wait_connected(Duration::from_secs(5))
        .await
        .unwrap();

    // First epoch: the four subscriptions, then the connection dies.
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (read_half, _writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut first_ids = Vec::new();
    for _ in 0..4 {
        let frame = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        first_ids.push(value["command"][1].as_u64().unwrap());
    }
    drop(lines);
    drop(_writer);

    // Sent into the gap between epochs: must not be lost.
    client.send(IpcCommand::Stop).unwrap();

    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client never redialed")
        .unwrap();
    let (read_half, _writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut frames = Vec::new();
    for _ in 0..5 {
        let frame = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        frames.push(frame);
    }

    assert!(
        frames.iter().any(|f| f == "{\"command\":[\"stop\"]}"),
        "queued command must be delivered on the next connection: {frames:?}"
    );

    let second_ids: Vec<u64> = frames
        .iter()
        .filter_map(|f| {
            let value: serde_json::Value = serde_json::from_str(f).ok()?;
            if value["command"][0] == "observe_property" {
                value["command"][1].as_u64()
            } else {
                None
            }
        })
        .collect();
    assert_eq!(second_ids.len(), 4);
    let max_first = *first_ids.iter().max().unwrap();
    assert!(
        second_ids.iter().all(|id| *id > max_first),
        "correlation ids are never reused: {first_ids:?} then {second_ids:?}"
    );

    client.shutdown();
}
