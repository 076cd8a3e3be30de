//! End-to-end engine tests: a real TCP connection to an in-process fake
//! server, a fake player servicing the capability handle, and the engine
//! loop in between.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use telecast_client::connection::{ConnEvent, ConnectionManager, ConnectionState};
use telecast_client::engine::{EngineCommand, SyncEngine};
use telecast_client::player::{PlayerHandle, PlayerRequest};
use telecast_client::view::{Notice, SignalState, ViewState};
use telecast_proto::config::SyncConfig;
use telecast_proto::protocol::{self, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use telecast_proto::schedule::{GradeUpdate, ItemKind, PlaylistItem};

#[derive(Debug, Default)]
struct FakePlayerState {
    loaded: Option<String>,
    time: Option<f64>,
    playing: bool,
    seeks: Vec<f64>,
}

fn fake_player(state: Arc<Mutex<FakePlayerState>>) -> PlayerHandle {
    let (handle, mut rx) = PlayerHandle::channel();
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let mut s = state.lock().unwrap();
            match req {
                PlayerRequest::Load { src, reply } => {
                    s.loaded = Some(src);
                    s.time = Some(0.0);
                    s.playing = true;
                    let _ = reply.send(Ok(()));
                }
                PlayerRequest::SeekTo { secs, reply } => {
                    if s.loaded.is_none() {
                        let _ = reply.send(Err(anyhow::anyhow!("nothing loaded")));
                    } else {
                        s.seeks.push(secs);
                        s.time = Some(secs);
                        let _ = reply.send(Ok(()));
                    }
                }
                PlayerRequest::Play { reply } => {
                    s.playing = true;
                    let _ = reply.send(Ok(()));
                }
                PlayerRequest::Pause { reply } => {
                    s.playing = false;
                    let _ = reply.send(Ok(()));
                }
                PlayerRequest::CurrentTime { reply } => {
                    let _ = reply.send(Ok(s.time));
                }
            }
        }
    });
    handle
}

fn item(name: &str, duration: f64) -> PlaylistItem {
    PlaylistItem {
        src: format!("media/{name}.mp4"),
        name: name.to_string(),
        kind: ItemKind::Feature,
        duration_secs: duration,
        start_secs: None,
        meta: None,
    }
}

fn grade_update(channel: &str, items: Vec<PlaylistItem>, started_secs_ago: i64) -> GradeUpdate {
    GradeUpdate {
        channel: channel.to_string(),
        grade: items,
        current_item_index: 0,
        item_start_time: Utc::now() - chrono::Duration::seconds(started_secs_ago),
        channel_mode: "linear".to_string(),
        available_channels: vec![],
    }
}

fn test_sync_config() -> SyncConfig {
    SyncConfig {
        tick_ms: 50,
        switch_timeout_secs: 1,
        backoff_floor_secs: 1,
        backoff_cap_secs: 2,
        ..SyncConfig::default()
    }
}

struct Harness {
    listener: TcpListener,
    state: Arc<Mutex<FakePlayerState>>,
    view: watch::Receiver<ViewState>,
    notices: tokio::sync::broadcast::Receiver<Notice>,
    commands: mpsc::Sender<EngineCommand>,
    engine_task: tokio::task::JoinHandle<()>,
}

async fn start_harness() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let state = Arc::new(Mutex::new(FakePlayerState::default()));
    let player = fake_player(Arc::clone(&state));

    let (events_tx, events_rx) = mpsc::channel::<ConnEvent>(64);
    let conn = ConnectionManager::spawn(addr, "secret".to_string(), &test_sync_config(), events_tx);

    let engine = SyncEngine::new(test_sync_config(), conn, player);
    let view = engine.subscribe_view();
    let notices = engine.subscribe_notices();
    let (commands, command_rx) = mpsc::channel::<EngineCommand>(16);
    let engine_task = tokio::spawn(engine.run(events_rx, command_rx));

    Harness {
        listener,
        state,
        view,
        notices,
        commands,
        engine_task,
    }
}

async fn read_msg(stream: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<ClientMessage> {
    loop {
        if let Some((msg, consumed)) = protocol::decode::<ClientMessage>(buf)? {
            buf.drain(..consumed);
            return Ok(msg);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("client closed");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Accept a client, answer its auth, and consume its subscription.
/// Returns the live stream, the leftover read buffer, and the channel the
/// client subscribed to.
async fn accept_and_handshake(listener: &TcpListener) -> (TcpStream, Vec<u8>, Option<String>) {
    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no client connected")
        .unwrap();
    let mut buf = Vec::new();

    let auth = read_msg(&mut stream, &mut buf).await.unwrap();
    assert!(matches!(auth, ClientMessage::Auth { .. }));
    let hello = protocol::encode(&ServerMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
    })
    .unwrap();
    stream.write_all(&hello).await.unwrap();

    let channel = match read_msg(&mut stream, &mut buf).await.unwrap() {
        ClientMessage::Subscribe { channel } => channel,
        other => panic!("expected subscribe, got {other:?}"),
    };
    (stream, buf, channel)
}

async fn send_update(stream: &mut TcpStream, update: GradeUpdate) {
    let frame = protocol::encode(&ServerMessage::GradeUpdate(update)).unwrap();
    stream.write_all(&frame).await.unwrap();
}

async fn wait_view(view: &mut watch::Receiver<ViewState>, pred: impl Fn(&ViewState) -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if pred(&view.borrow()) {
                return;
            }
            view.changed().await.unwrap();
        }
    })
    .await
    .expect("view condition not reached in time");
}

#[tokio::test]
async fn engine_loads_and_seeks_to_the_scheduled_position() {
    let mut h = start_harness().await;
    let (mut stream, _buf, channel) = accept_and_handshake(&h.listener).await;
    assert_eq!(channel, None, "first subscription targets the default channel");

    // Grade [30, 45] that started 40 s ago: item 1, 10 s in.
    send_update(
        &mut stream,
        grade_update("a", vec![item("a1", 30.0), item("a2", 45.0)], 40),
    )
    .await;

    wait_view(&mut h.view, |v| {
        v.signal == SignalState::Ok
            && v.now_playing.as_ref().map(|n| n.name.as_str()) == Some("a2")
    })
    .await;

    let s = h.state.lock().unwrap();
    assert_eq!(s.loaded.as_deref(), Some("media/a2.mp4"));
    assert!(
        (s.seeks[0] - 10.0).abs() < 1.0,
        "expected a seek near 10 s, got {:?}",
        s.seeks
    );
    assert!(s.playing);

    h.engine_task.abort();
}

#[tokio::test]
async fn reconnect_resubscribes_and_uses_only_fresh_snapshots() {
    let mut h = start_harness().await;
    let (mut stream, _buf, channel) = accept_and_handshake(&h.listener).await;
    assert_eq!(channel, None);

    send_update(&mut stream, grade_update("a", vec![item("a1", 600.0)], 0)).await;
    wait_view(&mut h.view, |v| v.channel.as_deref() == Some("a")).await;
    wait_view(&mut h.view, |v| v.connection == ConnectionState::Connected).await;

    // Kill the transport; the manager must reconnect and resubscribe to
    // the channel that was confirmed before the loss.
    drop(stream);
    wait_view(&mut h.view, |v| {
        v.connection == ConnectionState::Disconnected
    })
    .await;
    // The stale snapshot keeps driving playback meanwhile.
    assert_eq!(h.view.borrow().signal, SignalState::Ok);

    let (mut stream2, _buf2, channel2) = accept_and_handshake(&h.listener).await;
    assert_eq!(channel2.as_deref(), Some("a"));

    send_update(&mut stream2, grade_update("a", vec![item("a2", 600.0)], 0)).await;
    wait_view(&mut h.view, |v| {
        v.now_playing.as_ref().map(|n| n.name.as_str()) == Some("a2")
    })
    .await;

    h.engine_task.abort();
}

#[tokio::test]
async fn auth_rejection_parks_without_retry() {
    let mut h = start_harness().await;

    let (mut stream, _) = timeout(Duration::from_secs(5), h.listener.accept())
        .await
        .expect("no client connected")
        .unwrap();
    let mut buf = Vec::new();
    let auth = read_msg(&mut stream, &mut buf).await.unwrap();
    assert!(matches!(auth, ClientMessage::Auth { .. }));
    let rejected = protocol::encode(&ServerMessage::AuthRejected {
        reason: "bad token".to_string(),
    })
    .unwrap();
    stream.write_all(&rejected).await.unwrap();

    let notice = timeout(Duration::from_secs(5), h.notices.recv())
        .await
        .expect("no notice")
        .unwrap();
    assert_eq!(
        notice,
        Notice::AuthRejected {
            reason: "bad token".to_string()
        }
    );
    wait_view(&mut h.view, |v| v.connection == ConnectionState::AuthFailed).await;

    // No automatic retry: nothing reconnects while the credential is bad.
    let second = timeout(Duration::from_millis(1500), h.listener.accept()).await;
    assert!(second.is_err(), "must not reconnect after an auth rejection");

    // A fresh token unparks the manager.
    h.commands
        .send(EngineCommand::SetToken("better".to_string()))
        .await
        .unwrap();
    let (_stream2, _buf2, _) = accept_and_handshake(&h.listener).await;

    h.engine_task.abort();
}

#[tokio::test]
async fn channel_switch_confirms_on_matching_snapshot() {
    let mut h = start_harness().await;
    let (mut stream, mut buf, _) = accept_and_handshake(&h.listener).await;

    send_update(&mut stream, grade_update("a", vec![item("a1", 600.0)], 0)).await;
    wait_view(&mut h.view, |v| v.channel.as_deref() == Some("a")).await;

    h.commands
        .send(EngineCommand::SwitchChannel("b".to_string()))
        .await
        .unwrap();
    match read_msg(&mut stream, &mut buf).await.unwrap() {
        ClientMessage::SwitchChannel { channel } => assert_eq!(channel, "b"),
        other => panic!("expected switch request, got {other:?}"),
    }

    // Until the confirming snapshot lands, the old channel stays on air.
    assert_eq!(h.view.borrow().channel.as_deref(), Some("a"));

    send_update(&mut stream, grade_update("b", vec![item("b1", 600.0)], 0)).await;
    wait_view(&mut h.view, |v| {
        v.channel.as_deref() == Some("b")
            && v.signal == SignalState::Ok
            && v.now_playing.as_ref().map(|n| n.name.as_str()) == Some("b1")
    })
    .await;
    assert_eq!(
        h.state.lock().unwrap().loaded.as_deref(),
        Some("media/b1.mp4")
    );

    h.engine_task.abort();
}

#[tokio::test]
async fn switch_timeout_reverts_and_notifies_once() {
    let mut h = start_harness().await;
    let (mut stream, mut buf, _) = accept_and_handshake(&h.listener).await;

    send_update(&mut stream, grade_update("a", vec![item("a1", 600.0)], 0)).await;
    wait_view(&mut h.view, |v| v.channel.as_deref() == Some("a")).await;

    h.commands
        .send(EngineCommand::SwitchChannel("b".to_string()))
        .await
        .unwrap();
    let _ = read_msg(&mut stream, &mut buf).await.unwrap();
    // The server never confirms; the 1 s test timeout expires.

    let notice = timeout(Duration::from_secs(5), h.notices.recv())
        .await
        .expect("no notice")
        .unwrap();
    assert_eq!(
        notice,
        Notice::SwitchFailed {
            channel: "b".to_string()
        }
    );
    assert!(
        h.notices.try_recv().is_err(),
        "switch failure fires exactly once"
    );

    // The previous channel's content keeps playing.
    assert_eq!(h.view.borrow().channel.as_deref(), Some("a"));
    assert_eq!(h.view.borrow().signal, SignalState::Ok);

    h.engine_task.abort();
}
