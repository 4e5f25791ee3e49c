//! End-to-end session scenarios against an in-process mock server
//!
//! The mock accepts WebSocket connections on a loopback port, answers
//! `client/hello` and `client/time` automatically (its loop timeline is
//! the elapsed time since the server started), and lets each test drive
//! stream lifecycle, commands and chunks explicitly. Buffer depths are
//! scaled down so scenarios complete in test time.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use sendspin_player::protocol::frame;
use sendspin_player::{
    Discovery, NullSink, PcmDecoder, Player, PlayerConfig, PlayerEvent, Result,
};

/// What the mock server observed from the client
#[derive(Debug)]
enum Seen {
    Hello {
        conn: usize,
        at: Instant,
        payload: serde_json::Value,
    },
    TimeRequest {
        conn: usize,
        at: Instant,
    },
    State {
        conn: usize,
        payload: serde_json::Value,
    },
    Goodbye {
        conn: usize,
        payload: serde_json::Value,
    },
    Binary {
        conn: usize,
    },
    Closed {
        conn: usize,
        at: Instant,
    },
}

/// Instructions from the test body to the active connection
enum SendCmd {
    Msg(Message),
    /// Kill the connection without a close frame
    Drop,
}

struct MockServer {
    addr: String,
    start: Instant,
    send_tx: mpsc::UnboundedSender<SendCmd>,
    seen_rx: mpsc::UnboundedReceiver<Seen>,
}

impl MockServer {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let start = Instant::now();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SendCmd>();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel::<Seen>();

        tokio::spawn(async move {
            let mut conn = 0usize;
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                conn += 1;

                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                let (mut write, mut read) = ws.split();

                loop {
                    tokio::select! {
                        cmd = send_rx.recv() => match cmd {
                            Some(SendCmd::Msg(msg)) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Some(SendCmd::Drop) => break,
                            None => return,
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                handle_client_text(
                                    &text, conn, start, &mut write, &seen_tx,
                                )
                                .await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = seen_tx.send(Seen::Binary { conn });
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = seen_tx.send(Seen::Closed { conn, at: Instant::now() });
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) => {
                                let _ = seen_tx.send(Seen::Closed { conn, at: Instant::now() });
                                break;
                            }
                        },
                    }
                }
            }
        });

        Self {
            addr,
            start,
            send_tx,
            seen_rx,
        }
    }

    /// Server loop timeline, microseconds since the server started
    fn server_now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn send_json(&self, value: serde_json::Value) {
        let _ = self.send_tx.send(SendCmd::Msg(Message::Text(value.to_string())));
    }

    fn send_binary(&self, data: Vec<u8>) {
        let _ = self.send_tx.send(SendCmd::Msg(Message::Binary(data)));
    }

    fn send_chunk(&self, server_ts_us: u64, pcm: &[u8]) {
        self.send_binary(frame::encode_audio_chunk(server_ts_us, pcm));
    }

    fn drop_connection(&self) {
        let _ = self.send_tx.send(SendCmd::Drop);
    }

    fn send_stream_start_pcm(&self) {
        self.send_json(json!({
            "type": "stream/start",
            "payload": {
                "player": {
                    "codec": "pcm",
                    "sample_rate": 48_000,
                    "channels": 2,
                    "bit_depth": 16
                }
            }
        }));
    }

    /// Wait for the next observation matching `pick`
    async fn wait_seen<T>(
        &mut self,
        timeout: Duration,
        pick: impl Fn(Seen) -> Option<T>,
    ) -> T {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.seen_rx.recv()).await {
                Ok(Some(seen)) => {
                    if let Some(found) = pick(seen) {
                        return found;
                    }
                }
                Ok(None) => panic!("mock server gone"),
                Err(_) => panic!("timed out waiting for client traffic"),
            }
        }
    }
}

type WsWriter = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    Message,
>;

/// Answer handshake and time requests the way a real server would
async fn handle_client_text(
    text: &str,
    conn: usize,
    start: Instant,
    write: &mut WsWriter,
    seen_tx: &mpsc::UnboundedSender<Seen>,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return,
    };

    match value["type"].as_str().unwrap_or("") {
        "client/hello" => {
            let _ = seen_tx.send(Seen::Hello {
                conn,
                at: Instant::now(),
                payload: value["payload"].clone(),
            });
            let hello = json!({
                "type": "server/hello",
                "payload": {
                    "server_id": "mock-server",
                    "name": "Mock",
                    "version": 1,
                    "active_roles": ["player@v1", "metadata@v1"]
                }
            });
            let _ = write.send(Message::Text(hello.to_string())).await;
        }
        "client/time" => {
            let _ = seen_tx.send(Seen::TimeRequest {
                conn,
                at: Instant::now(),
            });
            let server_us = start.elapsed().as_micros() as u64;
            let reply = json!({
                "type": "server/time",
                "payload": {
                    "client_transmitted": value["payload"]["client_transmitted"],
                    "server_received": server_us,
                    "server_transmitted": server_us
                }
            });
            let _ = write.send(Message::Text(reply.to_string())).await;
        }
        "client/state" => {
            let _ = seen_tx.send(Seen::State {
                conn,
                payload: value["payload"].clone(),
            });
        }
        "client/goodbye" => {
            let _ = seen_tx.send(Seen::Goodbye {
                conn,
                payload: value["payload"].clone(),
            });
        }
        _ => {}
    }
}

struct StubDiscovery;

#[async_trait::async_trait]
impl Discovery for StubDiscovery {
    async fn discover(&self, _timeout_ms: u64) -> Result<Option<String>> {
        Ok(None)
    }
}

async fn spawn_player(
    addr: &str,
    buffer_ms: u64,
) -> (Player, mpsc::UnboundedReceiver<PlayerEvent>) {
    let mut config = PlayerConfig::new("test-player", "client-test-1");
    config.server_addr = Some(addr.to_string());
    config.buffer_ms = buffer_ms;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(move |event: PlayerEvent| {
        let _ = events_tx.send(event);
    });

    let player = Player::new(
        config,
        observer,
        Arc::new(StubDiscovery),
        Box::new(PcmDecoder::new()),
        Arc::new(NullSink::new()),
    )
    .unwrap();

    player.start().await.unwrap();
    (player, events_rx)
}

async fn wait_event<T>(
    events: &mut mpsc::UnboundedReceiver<PlayerEvent>,
    timeout: Duration,
    pick: impl Fn(PlayerEvent) -> Option<T>,
) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => {
                if let Some(found) = pick(event) {
                    return found;
                }
            }
            Ok(None) => panic!("player gone"),
            Err(_) => panic!("timed out waiting for player event"),
        }
    }
}

/// Wait until the scheduler stats satisfy `pred`, polling
async fn wait_stats(player: &Player, timeout: Duration, pred: impl Fn(&sendspin_player::SchedulerSnapshot) -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = player.stats();
        if pred(&snapshot) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("stats never converged: {:?}", snapshot);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_handshake_sync_burst_and_clean_shutdown() {
    let mut server = MockServer::spawn().await;
    let (player, mut events) = spawn_player(&server.addr, 200).await;

    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::ConnectionStateChanged { connected: true } => Some(()),
        _ => None,
    })
    .await;

    let (hello_at, hello) = server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::Hello { at, payload, .. } => Some((at, payload)),
            _ => None,
        })
        .await;

    let roles: Vec<&str> = hello["supported_roles"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r.as_str())
        .collect();
    assert!(roles.contains(&"player@v1"));
    assert_eq!(hello["client_id"], "client-test-1");
    assert!(hello.get("player@v1_support").is_some());
    assert!(hello.get("player_support").is_some());

    // the initial state report follows the server hello
    let state = server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::State { payload, .. } => Some(payload),
            _ => None,
        })
        .await;
    assert_eq!(state["player"]["state"], "synchronized");
    assert_eq!(state["player"]["volume"], 100);

    // five-round burst, roughly 100 ms apart, within the first second
    let mut burst = Vec::new();
    for _ in 0..5 {
        let at = server
            .wait_seen(Duration::from_secs(2), |seen| match seen {
                Seen::TimeRequest { at, .. } => Some(at),
                _ => None,
            })
            .await;
        burst.push(at);
    }
    assert!(burst[4].duration_since(hello_at) < Duration::from_millis(1_000));
    for pair in burst.windows(2) {
        assert!(pair[1].duration_since(pair[0]) < Duration::from_millis(400));
    }

    // the continuous loop keeps requesting after the burst
    server
        .wait_seen(Duration::from_secs(3), |seen| match seen {
            Seen::TimeRequest { at, .. } => Some(at),
            _ => None,
        })
        .await;

    // clean stop: goodbye strictly before the socket closes
    player.stop().await;

    let goodbye = server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::Goodbye { payload, .. } => Some(payload),
            Seen::Closed { .. } => panic!("socket closed before goodbye"),
            _ => None,
        })
        .await;
    assert_eq!(goodbye["reason"], "shutdown");

    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::Closed { .. } => Some(()),
            Seen::Binary { .. } => panic!("player sent a binary frame"),
            _ => None,
        })
        .await;
}

#[tokio::test]
async fn test_stream_playback_happy_path() {
    let mut server = MockServer::spawn().await;
    let (player, mut events) = spawn_player(&server.addr, 200).await; // target 10 chunks

    // let the sync bootstrap anchor the clock
    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::TimeRequest { at, .. } => Some(at),
            _ => None,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_stream_start_pcm();

    let format = wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::StreamStarted(format) => Some(format),
        _ => None,
    })
    .await;
    assert_eq!(format.sample_rate, 48_000);

    // 30 chunks of PCM silence, 20 ms apart, starting 300 ms out
    let pcm = vec![0u8; 1_920];
    let base = server.server_now_us() + 300_000;
    for i in 0..30u64 {
        server.send_chunk(base + i * 20_000, &pcm);
    }

    // first ten absorbed into the buffer, then playback begins
    for _ in 0..30 {
        wait_event(&mut events, Duration::from_secs(5), |e| match e {
            PlayerEvent::AudioChunk { pcm, .. } => {
                assert_eq!(pcm.len(), 1_920);
                Some(())
            }
            _ => None,
        })
        .await;
    }

    let snapshot = player.stats();
    assert_eq!(snapshot.stats.received, 30);
    assert_eq!(snapshot.stats.played, 30);
    assert_eq!(snapshot.stats.dropped, 0);
    assert!(!snapshot.buffering);

    player.stop().await;
}

#[tokio::test]
async fn test_late_chunk_dropped_at_ingress() {
    let mut server = MockServer::spawn().await;
    let (player, mut events) = spawn_player(&server.addr, 200).await;

    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::TimeRequest { at, .. } => Some(at),
            _ => None,
        })
        .await;
    // let the server timeline get well past the late window
    tokio::time::sleep(Duration::from_millis(300)).await;

    server.send_stream_start_pcm();
    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::StreamStarted(_) => Some(()),
        _ => None,
    })
    .await;

    // 200 ms in the past: far beyond the late window
    server.send_chunk(server.server_now_us() - 200_000, &[0u8; 64]);

    wait_stats(&player, Duration::from_secs(2), |s| s.stats.received == 1).await;

    let snapshot = player.stats();
    assert_eq!(snapshot.stats.dropped, 1);
    assert_eq!(snapshot.stats.played, 0);
    assert_eq!(snapshot.queue_len, 0);

    player.stop().await;
}

#[tokio::test]
async fn test_volume_command_roundtrip_survives_bad_frames() {
    let mut server = MockServer::spawn().await;
    let (player, _events) = spawn_player(&server.addr, 200).await;

    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::Hello { at, .. } => Some(at),
            _ => None,
        })
        .await;

    // hostile traffic first: a truncated audio frame, an unknown binary
    // kind and an unknown text type must all be invisible
    server.send_binary(vec![0x04; 8]);
    server.send_binary(vec![0x99, 1, 2, 3]);
    server.send_json(json!({"type": "server/surprise", "payload": {"x": 1}}));

    server.send_json(json!({
        "type": "server/command",
        "payload": {"player": {"command": "volume", "volume": 37}}
    }));

    let sent_at = Instant::now();
    let state = server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::State { payload, .. } if payload["player"]["volume"] == 37 => Some(payload),
            _ => None,
        })
        .await;

    assert!(sent_at.elapsed() < Duration::from_millis(500));
    assert_eq!(state["player"]["muted"], false);

    player.stop().await;
}

#[tokio::test]
async fn test_seek_flushes_queue_and_rebuffers() {
    let mut server = MockServer::spawn().await;
    let (player, mut events) = spawn_player(&server.addr, 100).await; // target 5

    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::TimeRequest { at, .. } => Some(at),
            _ => None,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_stream_start_pcm();
    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::StreamStarted(_) => Some(()),
        _ => None,
    })
    .await;

    // three chunks, under the buffering target, parked well in the future
    let base = server.server_now_us() + 2_000_000;
    for i in 0..3u64 {
        server.send_chunk(base + i * 20_000, &[0u8; 64]);
    }
    wait_stats(&player, Duration::from_secs(2), |s| s.queue_len == 3).await;

    server.send_json(json!({"type": "stream/clear", "payload": {}}));

    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::StreamCleared => Some(()),
        _ => None,
    })
    .await;

    wait_stats(&player, Duration::from_secs(2), |s| {
        s.queue_len == 0 && s.buffering && s.stats.dropped == 3
    })
    .await;

    // playback resumes once the refilled buffer reaches the target
    let base = server.server_now_us() + 200_000;
    for i in 0..5u64 {
        server.send_chunk(base + i * 20_000, &[0u8; 64]);
    }

    wait_event(&mut events, Duration::from_secs(5), |e| match e {
        PlayerEvent::AudioChunk { .. } => Some(()),
        _ => None,
    })
    .await;

    player.stop().await;
}

#[tokio::test]
async fn test_reconnect_after_socket_drop() {
    let mut server = MockServer::spawn().await;
    let (player, mut events) = spawn_player(&server.addr, 200).await;

    let first_conn = server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::Hello { conn, .. } => Some(conn),
            _ => None,
        })
        .await;
    assert_eq!(first_conn, 1);

    // wait until the session is synchronizing, then yank the socket
    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::TimeRequest { at, .. } => Some(at),
            _ => None,
        })
        .await;

    let dropped_at = Instant::now();
    server.drop_connection();

    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::ConnectionStateChanged { connected: false } => Some(()),
        _ => None,
    })
    .await;

    // attempt #1 lands after the initial one-second backoff, with a fresh
    // handshake before any streaming
    let (second_conn, second_hello_at) = server
        .wait_seen(Duration::from_secs(6), |seen| match seen {
            Seen::Hello { conn, at, .. } => Some((conn, at)),
            _ => None,
        })
        .await;
    assert_eq!(second_conn, 2);

    let elapsed = second_hello_at.duration_since(dropped_at);
    assert!(elapsed >= Duration::from_millis(800), "reconnected after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "reconnected after {:?}", elapsed);

    wait_event(&mut events, Duration::from_secs(2), |e| match e {
        PlayerEvent::ConnectionStateChanged { connected: true } => Some(()),
        _ => None,
    })
    .await;

    // fresh sync bootstrap on the new connection
    server
        .wait_seen(Duration::from_secs(2), |seen| match seen {
            Seen::TimeRequest { conn, .. } if conn == 2 => Some(()),
            _ => None,
        })
        .await;

    player.stop().await;
}
