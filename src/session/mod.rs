//! Session state machine
//!
//! Drives the handshake, the sync exchanges, the stream lifecycle and
//! server commands. The machine itself performs no I/O: every inbound
//! message produces a list of [`SessionEffect`]s that the supervisor
//! executes in order, which keeps the single-writer guarantee (command
//! echoes happen before any further inbound processing) in one place.

pub mod hello;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::PlayerConfig;
use crate::protocol::messages::{
    ClientGoodbye, ClientMessage, ClientState, ClientTime, Metadata, PlaybackState, PlayerState,
    ServerHello, ServerMessage, StreamFormat,
};
use crate::sync::SharedClock;

/// Pending sync entries older than this are dropped by the sync loop
pub const PENDING_SYNC_MAX_AGE_US: u64 = 2_000_000;

/// Requests in the initial sync burst
pub const INITIAL_SYNC_ROUNDS: u32 = 5;

/// Spacing between initial sync requests
pub const INITIAL_SYNC_SPACING_MS: u64 = 100;

/// Grace wait for the final initial sync response
pub const INITIAL_SYNC_ROUND_TIMEOUT_MS: u64 = 500;

/// Continuous sync loop period
pub const SYNC_LOOP_INTERVAL_MS: u64 = 1_000;

/// Sync status string reported in `client/state`
const STATE_SYNCHRONIZED: &str = "synchronized";

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Transport open, waiting for `server/hello`
    HandshakePending,
    /// Initial sync burst in progress
    SyncBootstrapping,
    /// Synchronized, no stream active
    Idle,
    /// Synchronized with an active stream
    Streaming,
    /// Goodbye sent, socket closing
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::HandshakePending => "handshake-pending",
            SessionState::SyncBootstrapping => "sync-bootstrapping",
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        };
        write!(f, "{}", name)
    }
}

/// Work the supervisor performs on behalf of the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Serialize and send a text message on the socket
    Send(ClientMessage),
    /// Wire up decoder, scheduler and sink for a new stream
    StartStream(StreamFormat),
    /// Tear down the active stream
    EndStream,
    /// Flush the scheduler and the sink's internal buffer (seek)
    ClearStream,
    /// Pass new metadata to the host
    MetadataChanged(Metadata),
    /// Pass a transport-state change to the host
    PlaybackChanged(PlaybackState),
}

/// Outstanding `client/time` requests keyed by their transmit timestamp
#[derive(Debug, Default)]
pub struct PendingSyncTable {
    entries: HashMap<u64, u64>,
}

impl PendingSyncTable {
    /// Record a request sent at `sent_at_unix_us`
    pub fn record(&mut self, client_transmitted: u64, sent_at_unix_us: u64) {
        self.entries.insert(client_transmitted, sent_at_unix_us);
    }

    /// Claim the entry matching a response; `None` means the response is
    /// stale or was never ours
    pub fn take(&mut self, client_transmitted: u64) -> Option<u64> {
        self.entries.remove(&client_transmitted)
    }

    /// Drop entries older than [`PENDING_SYNC_MAX_AGE_US`]
    pub fn drain_stale(&mut self, now_unix_us: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, sent_at| now_unix_us.saturating_sub(*sent_at) <= PENDING_SYNC_MAX_AGE_US);
        before - self.entries.len()
    }

    /// Outstanding request count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything (disconnect)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The session state machine
pub struct Session {
    state: SessionState,
    clock: SharedClock,
    pending: PendingSyncTable,
    volume: u8,
    muted: bool,
    playback_state: PlaybackState,
    metadata: Option<Metadata>,
    format: Option<StreamFormat>,
    server: Option<ServerHello>,
    hello: ClientMessage,
}

impl Session {
    /// Create a machine in the disconnected state
    pub fn new(config: &PlayerConfig, clock: SharedClock) -> Self {
        Self {
            state: SessionState::Disconnected,
            clock,
            pending: PendingSyncTable::default(),
            volume: config.initial_volume,
            muted: config.initial_muted,
            playback_state: PlaybackState::Idle,
            metadata: None,
            format: None,
            server: None,
            hello: ClientMessage::Hello(hello::build_client_hello(config)),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current volume, 0..=100
    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Current mute flag
    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Active stream format, if a stream is running
    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    /// Last metadata received from the server
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Mirror of the server's last reported transport state
    pub fn playback_state(&self) -> PlaybackState {
        self.playback_state
    }

    /// The server's handshake, once received
    pub fn server(&self) -> Option<&ServerHello> {
        self.server.as_ref()
    }

    /// Transport connect started
    pub fn on_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// Transport opened: greet the server
    pub fn on_transport_open(&mut self) -> Vec<SessionEffect> {
        self.state = SessionState::HandshakePending;
        vec![SessionEffect::Send(self.hello.clone())]
    }

    /// Transport gone: reset for a future handshake
    ///
    /// The clock filter is not reset here; a reconnect to the same server
    /// re-anchors it through a fresh session's bootstrap.
    pub fn on_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.format = None;
        self.pending.clear();
    }

    /// Build one `client/time` request and track it as pending
    pub fn make_time_request(&mut self, now_unix_us: u64) -> ClientMessage {
        self.pending.record(now_unix_us, now_unix_us);
        ClientMessage::Time(ClientTime {
            client_transmitted: now_unix_us,
        })
    }

    /// One continuous-sync tick: age out stale requests, refresh the
    /// clock's staleness grading and emit the next request
    pub fn sync_tick(&mut self, now_unix_us: u64) -> Vec<SessionEffect> {
        let drained = self.pending.drain_stale(now_unix_us);
        if drained > 0 {
            debug!(drained, "dropped unanswered sync requests");
        }
        self.clock.tick();

        vec![SessionEffect::Send(self.make_time_request(now_unix_us))]
    }

    /// Initial sync burst finished; enter the idle state
    pub fn bootstrap_complete(&mut self) {
        if self.state == SessionState::SyncBootstrapping {
            self.state = SessionState::Idle;
        }
    }

    /// Begin a user-initiated close
    pub fn begin_close(&mut self) -> Vec<SessionEffect> {
        self.state = SessionState::Closing;
        vec![SessionEffect::Send(ClientMessage::Goodbye(ClientGoodbye {
            reason: "shutdown".into(),
        }))]
    }

    /// Process one inbound server message
    pub fn handle_message(&mut self, msg: ServerMessage, now_unix_us: u64) -> Vec<SessionEffect> {
        match msg {
            ServerMessage::Hello(hello) => self.handle_hello(hello),
            ServerMessage::Time(time) => {
                self.handle_time(time.client_transmitted, time.server_received, time.server_transmitted, now_unix_us);
                Vec::new()
            }
            ServerMessage::State(state) => {
                let mut effects = Vec::new();
                if let Some(metadata) = state.metadata {
                    self.metadata = Some(metadata.clone());
                    effects.push(SessionEffect::MetadataChanged(metadata));
                }
                if let Some(playback) = state.controller.and_then(|c| c.playback_state) {
                    effects.extend(self.update_playback_state(playback));
                }
                effects
            }
            ServerMessage::Command(cmd) => self.handle_command(cmd.player),
            ServerMessage::StreamStart(start) => {
                self.format = Some(start.player.clone());
                self.state = SessionState::Streaming;
                vec![SessionEffect::StartStream(start.player)]
            }
            ServerMessage::StreamEnd => {
                if self.state == SessionState::Streaming {
                    self.state = SessionState::Idle;
                }
                self.format = None;
                vec![SessionEffect::EndStream]
            }
            ServerMessage::StreamClear => vec![SessionEffect::ClearStream],
            ServerMessage::GroupUpdate(update) | ServerMessage::SessionUpdate(update) => {
                match update.playback_state {
                    Some(playback) => self.update_playback_state(playback),
                    None => Vec::new(),
                }
            }
        }
    }

    fn handle_hello(&mut self, hello: ServerHello) -> Vec<SessionEffect> {
        if self.state != SessionState::HandshakePending {
            warn!(state = %self.state, "unexpected server/hello");
            return Vec::new();
        }

        debug!(server_id = %hello.server_id, "server hello");
        self.server = Some(hello);
        self.state = SessionState::SyncBootstrapping;

        vec![SessionEffect::Send(self.state_report())]
    }

    fn handle_time(&mut self, t1: u64, t2: u64, t3: u64, t4: u64) {
        if self.pending.take(t1).is_none() {
            debug!(client_transmitted = t1, "stale sync response");
            return;
        }

        self.clock.submit_sample(t1, t2, t3, t4);
    }

    fn handle_command(
        &mut self,
        command: crate::protocol::messages::PlayerCommand,
    ) -> Vec<SessionEffect> {
        match command.command.as_str() {
            "volume" => match command.volume {
                Some(volume) => self.volume = volume.min(100),
                None => {
                    warn!("volume command without a volume value");
                    return Vec::new();
                }
            },
            "mute" => match command.mute {
                Some(mute) => self.muted = mute,
                None => {
                    warn!("mute command without a mute value");
                    return Vec::new();
                }
            },
            other => {
                warn!(command = other, "unsupported player command");
                return Vec::new();
            }
        }

        vec![SessionEffect::Send(self.state_report())]
    }

    fn update_playback_state(&mut self, playback: PlaybackState) -> Vec<SessionEffect> {
        self.playback_state = playback;
        vec![SessionEffect::PlaybackChanged(playback)]
    }

    /// The current `client/state` report
    pub fn state_report(&self) -> ClientMessage {
        ClientMessage::State(ClientState {
            player: PlayerState {
                state: STATE_SYNCHRONIZED.into(),
                volume: self.volume,
                muted: self.muted,
            },
        })
    }
}
