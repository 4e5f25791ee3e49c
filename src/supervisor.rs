//! Session supervisor
//!
//! [`Player`] owns the whole receive pipeline: the connection, the session
//! state machine, the clock filter, the jitter scheduler and the wiring to
//! the external collaborators (discovery, decoder, sink). All shared state
//! is mutated from one task; timers and the socket reader feed that task
//! through channels, and every outbound send goes through one serialized
//! path. A protocol peer's misbehavior, a malformed frame or a slow
//! decoder never propagates out of here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PlayerConfig;
use crate::connection::{self, Connection, ConnectionEvent};
use crate::decoder::AudioDecoder;
use crate::discovery::Discovery;
use crate::protocol::frame::{self, BinaryFrame};
use crate::protocol::messages::{ClientMessage, Metadata, PlaybackState, StreamFormat};
use crate::protocol::parse_server_message;
use crate::scheduler::{ChunkCallback, JitterScheduler, SchedulerSnapshot, StatsCell};
use crate::session::{
    Session, SessionEffect, SessionState, INITIAL_SYNC_ROUNDS, INITIAL_SYNC_ROUND_TIMEOUT_MS,
    INITIAL_SYNC_SPACING_MS, SYNC_LOOP_INTERVAL_MS,
};
use crate::sink::AudioSink;
use crate::sync::SharedClock;
use crate::time::now_unix_us;
use crate::{Error, Result};

/// Bound on a single decoder call
pub const DECODE_TIMEOUT_MS: u64 = 1_000;

/// Everything the host can observe about the player
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// A stream started with the given format
    StreamStarted(StreamFormat),
    /// The stream ended
    StreamEnded,
    /// The stream was flushed (seek)
    StreamCleared,
    /// A decoded chunk was released to the sink
    AudioChunk {
        /// Decoded interleaved PCM bytes
        pcm: Vec<u8>,
        /// Format of the active stream
        format: StreamFormat,
    },
    /// The server replaced the track metadata
    MetadataChanged(Metadata),
    /// The server's transport state changed
    PlaybackStateChanged(PlaybackState),
    /// The connection came up or went down
    ConnectionStateChanged {
        /// Whether a session is currently established
        connected: bool,
    },
}

/// Host-facing observer for player events
pub trait PlayerObserver: Send + Sync {
    /// Called from the player's tasks; implementations should return fast
    fn on_event(&self, event: PlayerEvent);
}

impl<F> PlayerObserver for F
where
    F: Fn(PlayerEvent) + Send + Sync,
{
    fn on_event(&self, event: PlayerEvent) {
        self(event)
    }
}

/// Why a session loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutcome {
    /// stop() was called
    Shutdown,
    /// The socket closed or failed
    ConnectionLost,
}

/// Where the initial sync burst stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    /// Waiting for `server/hello`
    AwaitingHello,
    /// Sending the five-round burst
    Bootstrap,
    /// 1 s continuous loop
    Continuous,
}

/// The server address in use and how it was obtained
#[derive(Debug, Clone)]
struct ServerAddress {
    addr: String,
    /// Discovered addresses are re-resolved before each reconnect
    discovered: bool,
}

/// Per-stream resources owned by the session loop
struct StreamCtx {
    scheduler: Option<JitterScheduler>,
    active: bool,
}

/// The player endpoint supervisor
pub struct Player {
    config: PlayerConfig,
    observer: Arc<dyn PlayerObserver>,
    discovery: Arc<dyn Discovery>,
    sink: Arc<dyn AudioSink>,
    decoder_slot: Mutex<Option<Box<dyn AudioDecoder>>>,
    stats: Arc<StatsCell>,
    should_reconnect: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Create a player; validates the configuration
    pub fn new(
        config: PlayerConfig,
        observer: Arc<dyn PlayerObserver>,
        discovery: Arc<dyn Discovery>,
        decoder: Box<dyn AudioDecoder>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            observer,
            discovery,
            sink,
            decoder_slot: Mutex::new(Some(decoder)),
            stats: Arc::new(StatsCell::default()),
            should_reconnect: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            run_handle: Mutex::new(None),
        })
    }

    /// Resolve the server, connect and run the session in the background
    ///
    /// Fails fast with [`Error::DiscoveryTimeout`] when no address is
    /// configured and none is discovered. A connect failure propagates
    /// only when reconnect is disabled; otherwise a retry is scheduled
    /// and `Ok` is returned.
    pub async fn start(&self) -> Result<()> {
        if self.run_handle.lock().await.is_some() {
            return Err(Error::AlreadyStarted);
        }

        self.should_reconnect
            .store(self.config.reconnect, Ordering::SeqCst);

        let address = match &self.config.server_addr {
            Some(addr) => ServerAddress {
                addr: addr.clone(),
                discovered: false,
            },
            None => {
                info!("no server configured, browsing");
                match self
                    .discovery
                    .discover(self.config.discovery_timeout_ms)
                    .await?
                {
                    Some(addr) => ServerAddress {
                        addr,
                        discovered: true,
                    },
                    None => {
                        return Err(Error::DiscoveryTimeout(self.config.discovery_timeout_ms))
                    }
                }
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = match Connection::connect(&address.addr, events_tx).await {
            Ok(conn) => Some((conn, events_rx)),
            Err(e) => {
                if !self.config.reconnect {
                    return Err(e);
                }
                warn!("initial connect failed ({}), will retry", e);
                None
            }
        };

        let decoder = self
            .decoder_slot
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let runner = SessionRunner {
            config: self.config.clone(),
            observer: Arc::clone(&self.observer),
            discovery: Arc::clone(&self.discovery),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            should_reconnect: Arc::clone(&self.should_reconnect),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        *self.run_handle.lock().await = Some(tokio::spawn(runner.run(initial, address, decoder)));

        Ok(())
    }

    /// Stop the player: goodbye, close, cancel every task and timer
    pub async fn stop(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.run_handle.lock().await.take() {
            let _ = handle.await;
        }

        info!("player stopped");
    }

    /// Last published scheduler statistics
    pub fn stats(&self) -> SchedulerSnapshot {
        self.stats.snapshot()
    }
}

/// The background task driving connect, session and reconnect cycles
struct SessionRunner {
    config: PlayerConfig,
    observer: Arc<dyn PlayerObserver>,
    discovery: Arc<dyn Discovery>,
    sink: Arc<dyn AudioSink>,
    stats: Arc<StatsCell>,
    should_reconnect: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionRunner {
    async fn run(
        self,
        initial: Option<(Connection, mpsc::UnboundedReceiver<ConnectionEvent>)>,
        mut address: ServerAddress,
        mut decoder: Box<dyn AudioDecoder>,
    ) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut attempt: u32 = 0;
        let mut current = initial;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some((conn, events)) = current.take() {
                attempt = 0;
                self.observer
                    .on_event(PlayerEvent::ConnectionStateChanged { connected: true });

                let outcome = self
                    .run_session(conn, events, &mut decoder, &mut shutdown)
                    .await;

                self.observer
                    .on_event(PlayerEvent::ConnectionStateChanged { connected: false });

                if outcome == SessionOutcome::Shutdown {
                    break;
                }
            }

            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }

            attempt += 1;
            let delay = connection::reconnect_delay_ms(attempt);
            info!(attempt, delay_ms = delay, "scheduling reconnect");

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if address.discovered {
                let rediscovered = tokio::select! {
                    _ = shutdown.changed() => break,
                    r = self.discovery.discover(self.config.discovery_timeout_ms) => r,
                };
                match rediscovered {
                    Ok(Some(addr)) => address.addr = addr,
                    Ok(None) => {
                        warn!("rediscovery found no server");
                        continue;
                    }
                    Err(e) => {
                        warn!("rediscovery failed: {}", e);
                        continue;
                    }
                }
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            match Connection::connect(&address.addr, events_tx).await {
                Ok(conn) => current = Some((conn, events_rx)),
                Err(e) => warn!(attempt, "reconnect failed: {}", e),
            }
        }

        debug!("session runner terminated");
    }

    /// Drive one connected session until shutdown or socket loss
    async fn run_session(
        &self,
        conn: Connection,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        decoder: &mut Box<dyn AudioDecoder>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        let clock = SharedClock::new();
        let mut session = Session::new(&self.config, clock.clone());
        let mut ctx = StreamCtx {
            scheduler: None,
            active: false,
        };

        session.on_connecting();
        for effect in session.on_transport_open() {
            self.apply_effect(effect, &conn, &clock, &mut ctx, decoder).await;
        }

        let mut phase = SyncPhase::AwaitingHello;
        let mut bootstrap_sent: u32 = 0;
        let mut bootstrap_deadline = tokio::time::Instant::now();

        let mut sync_interval =
            tokio::time::interval(Duration::from_millis(SYNC_LOOP_INTERVAL_MS));
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => break SessionOutcome::Shutdown,

                event = events.recv() => match event {
                    Some(ConnectionEvent::Text(text)) => {
                        self.handle_text(&text, &mut session, &conn, &clock, &mut ctx, decoder)
                            .await;

                        if phase == SyncPhase::AwaitingHello
                            && session.state() == SessionState::SyncBootstrapping
                        {
                            self.send(&conn, session.make_time_request(now_unix_us()));
                            bootstrap_sent = 1;
                            bootstrap_deadline = tokio::time::Instant::now()
                                + Duration::from_millis(INITIAL_SYNC_SPACING_MS);
                            phase = SyncPhase::Bootstrap;
                        }
                    }
                    Some(ConnectionEvent::Binary(data)) => {
                        self.handle_binary(&data, &mut ctx, decoder).await;
                    }
                    Some(ConnectionEvent::Closed { reason }) => {
                        warn!(%reason, "connection lost");
                        break SessionOutcome::ConnectionLost;
                    }
                    None => break SessionOutcome::ConnectionLost,
                },

                _ = tokio::time::sleep_until(bootstrap_deadline), if phase == SyncPhase::Bootstrap => {
                    if bootstrap_sent < INITIAL_SYNC_ROUNDS {
                        self.send(&conn, session.make_time_request(now_unix_us()));
                        bootstrap_sent += 1;
                        let spacing = if bootstrap_sent == INITIAL_SYNC_ROUNDS {
                            INITIAL_SYNC_ROUND_TIMEOUT_MS
                        } else {
                            INITIAL_SYNC_SPACING_MS
                        };
                        bootstrap_deadline =
                            tokio::time::Instant::now() + Duration::from_millis(spacing);
                    } else {
                        session.bootstrap_complete();
                        phase = SyncPhase::Continuous;
                        info!(
                            samples = clock.samples_accepted(),
                            "initial sync complete, session idle"
                        );
                    }
                }

                _ = sync_interval.tick(), if phase == SyncPhase::Continuous => {
                    for effect in session.sync_tick(now_unix_us()) {
                        self.apply_effect(effect, &conn, &clock, &mut ctx, decoder).await;
                    }
                }
            }
        };

        if outcome == SessionOutcome::Shutdown {
            for effect in session.begin_close() {
                self.apply_effect(effect, &conn, &clock, &mut ctx, decoder).await;
            }
        }

        if let Some(mut scheduler) = ctx.scheduler.take() {
            scheduler.stop().await;
        }
        if ctx.active {
            self.sink.stop().await;
            decoder.cleanup().await;
        }
        session.on_disconnected();

        // goodbye, if any, gets the flush window before the socket closes
        conn.close().await;

        outcome
    }

    /// Parse and dispatch one text frame
    async fn handle_text(
        &self,
        text: &str,
        session: &mut Session,
        conn: &Connection,
        clock: &SharedClock,
        ctx: &mut StreamCtx,
        decoder: &mut Box<dyn AudioDecoder>,
    ) {
        let msg = match parse_server_message(text) {
            Ok(msg) => msg,
            Err(Error::UnknownMessageType(kind)) => {
                debug!(r#type = %kind, "ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!("dropping unparseable text message: {}", e);
                return;
            }
        };

        for effect in session.handle_message(msg, now_unix_us()) {
            self.apply_effect(effect, conn, clock, ctx, decoder).await;
        }
    }

    /// Parse and dispatch one binary frame
    async fn handle_binary(
        &self,
        data: &[u8],
        ctx: &mut StreamCtx,
        decoder: &mut Box<dyn AudioDecoder>,
    ) {
        match frame::parse_binary_frame(data) {
            Ok(BinaryFrame::AudioChunk {
                server_timestamp_us,
                payload,
            }) => {
                let Some(scheduler) = &ctx.scheduler else {
                    debug!("audio chunk with no active stream");
                    return;
                };

                let decoded = match tokio::time::timeout(
                    Duration::from_millis(DECODE_TIMEOUT_MS),
                    decoder.decode(payload),
                )
                .await
                {
                    Ok(Ok(pcm)) => pcm,
                    Ok(Err(e)) => {
                        warn!("dropping chunk, decode failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!("dropping chunk, decode timed out after {}ms", DECODE_TIMEOUT_MS);
                        return;
                    }
                };

                match scheduler.enqueue(server_timestamp_us, decoded) {
                    Ok(()) => {}
                    Err(Error::ChunkTooLate(delta)) => {
                        debug!(late_us = -delta, "dropped late chunk at ingress")
                    }
                    Err(Error::SchedulerQueueFull(len)) => {
                        debug!(queued = len, "dropped chunk, queue full")
                    }
                    Err(e) => warn!("enqueue failed: {}", e),
                }
            }
            Ok(BinaryFrame::Auxiliary { payload }) => {
                debug!(len = payload.len(), "ignoring auxiliary binary message");
            }
            Ok(BinaryFrame::Unknown { kind }) => {
                debug!(kind, "ignoring unknown binary message kind");
            }
            Err(e) => warn!("dropping malformed frame: {}", e),
        }
    }

    /// Execute one state-machine effect
    async fn apply_effect(
        &self,
        effect: SessionEffect,
        conn: &Connection,
        clock: &SharedClock,
        ctx: &mut StreamCtx,
        decoder: &mut Box<dyn AudioDecoder>,
    ) {
        match effect {
            SessionEffect::Send(msg) => self.send(conn, msg),

            SessionEffect::StartStream(format) => {
                if let Some(mut old) = ctx.scheduler.take() {
                    warn!("stream restarted without stream/end");
                    old.stop().await;
                }

                if let Err(e) = decoder.initialize(&format).await {
                    error!("decoder rejected stream format: {}", e);
                    return;
                }

                if let Err(e) = self.sink.start(&format).await {
                    warn!("sink failed to start: {}", e);
                }

                let mut scheduler = JitterScheduler::new(
                    self.config.buffer_ms,
                    clock.clone(),
                    Arc::clone(&self.stats),
                );

                let observer = Arc::clone(&self.observer);
                let chunk_format = format.clone();
                let on_chunk: ChunkCallback = Arc::new(move |pcm: &[u8]| {
                    observer.on_event(PlayerEvent::AudioChunk {
                        pcm: pcm.to_vec(),
                        format: chunk_format.clone(),
                    });
                });

                scheduler.start(Arc::clone(&self.sink), on_chunk);
                ctx.scheduler = Some(scheduler);
                ctx.active = true;

                info!(
                    codec = %format.codec,
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    bit_depth = format.bit_depth,
                    "stream started"
                );
                self.observer.on_event(PlayerEvent::StreamStarted(format));
            }

            SessionEffect::EndStream => {
                if let Some(mut scheduler) = ctx.scheduler.take() {
                    scheduler.stop().await;
                }
                if ctx.active {
                    self.sink.stop().await;
                    decoder.cleanup().await;
                    ctx.active = false;
                }
                info!("stream ended");
                self.observer.on_event(PlayerEvent::StreamEnded);
            }

            SessionEffect::ClearStream => {
                if let Some(scheduler) = &ctx.scheduler {
                    scheduler.clear();
                }
                self.sink.clear_buffer().await;
                self.observer.on_event(PlayerEvent::StreamCleared);
            }

            SessionEffect::MetadataChanged(metadata) => {
                self.observer.on_event(PlayerEvent::MetadataChanged(metadata));
            }

            SessionEffect::PlaybackChanged(playback) => {
                self.observer
                    .on_event(PlayerEvent::PlaybackStateChanged(playback));
            }
        }
    }

    /// The single outbound send path
    fn send(&self, conn: &Connection, msg: ClientMessage) {
        match msg.to_json() {
            Ok(json) => {
                if let Err(e) = conn.send_text(json) {
                    warn!("dropping outbound message: {}", e);
                }
            }
            Err(e) => error!("failed to serialize outbound message: {}", e),
        }
    }
}
