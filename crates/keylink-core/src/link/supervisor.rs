//! Connection supervision
//!
//! Owns exactly one open transport and turns periodic heartbeat exchanges
//! into a connectivity state machine. The Master role actively polls with
//! `0100` and expects `0110`; the Sub role listens and acknowledges. All
//! non-heartbeat traffic is forwarded to registered handlers or to one-shot
//! response matchers.
//!
//! All state mutation happens on the supervisor's loop thread, so observers
//! of the broadcast stream see transitions in the order they happened.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::diag::DiagBus;

use super::frame::{encode, FrameDecoder, Message};
use super::{
    LinkError, Transport, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RESPONSE_TIMEOUT_MS, HEARTBEAT_ACK,
    HEARTBEAT_REQUEST,
};

const SOURCE: &str = "supervisor";

/// Granularity at which sleeps notice a stop request.
const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Supervisor starting up
    Initializing,
    /// Transport open in progress
    Opening,
    /// Master role: heartbeats are being answered
    Polling,
    /// Sub role: passive channel open and serving
    Listening,
    /// Stop requested, transport closing
    Closing,
    /// Unrecoverable setup failure
    Error,
}

/// Which end of the link this supervisor drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Initiates heartbeat polling; holds the key material
    Master,
    /// Answers heartbeat polling; receives the key material
    Sub,
}

/// Supervisor timing configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long the Master waits for a heartbeat acknowledgment
    pub response_timeout: Duration,
    /// Pause between heartbeat polls (also the retry pause after a miss)
    pub poll_interval: Duration,
    /// Per-read timeout inside both loops; bounds stop latency
    pub read_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Cumulative link counters, exposed for diagnostics screens
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    /// Frames written (heartbeats included)
    pub tx_frames: u64,
    /// Frames decoded
    pub rx_frames: u64,
    /// Raw bytes written
    pub tx_bytes: u64,
    /// Raw bytes read
    pub rx_bytes: u64,
    /// Heartbeat polls that went unanswered
    pub heartbeat_timeouts: u64,
    /// Heartbeat acknowledgments received (Master) or requests served (Sub)
    pub heartbeats: u64,
    /// Most recent transport error, if any
    pub last_error: Option<String>,
}

type Handler = Box<dyn Fn(&Message) + Send>;

struct Matcher {
    id: u64,
    predicate: Box<dyn Fn(&Message) -> bool + Send>,
    reply: mpsc::SyncSender<Message>,
}

struct Shared {
    role: LinkRole,
    config: SupervisorConfig,
    bus: DiagBus,
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    handlers: Mutex<HashMap<u64, Handler>>,
    next_handler_id: AtomicU64,
    matchers: Mutex<Vec<Matcher>>,
    stats: Mutex<LinkStats>,
    stop: AtomicBool,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Only ever called from the loop thread, so subscribers observe
    /// transitions in program order.
    fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == new {
            return;
        }
        debug!(from = ?*state, to = ?new, "link state change");
        self.bus
            .info(SOURCE, format!("state {:?} -> {:?}", *state, new));
        *state = new;
        let _ = self.state_tx.send(new);
    }

    fn record_error(&self, err: &LinkError) {
        self.stats.lock().expect("stats lock poisoned").last_error = Some(err.to_string());
    }

    /// Matchers get first refusal; unclaimed messages go to every handler.
    fn dispatch(&self, message: &Message) {
        {
            let mut matchers = self.matchers.lock().expect("matcher lock poisoned");
            if let Some(pos) = matchers.iter().position(|m| (m.predicate)(message)) {
                let matcher = matchers.remove(pos);
                let _ = matcher.reply.send(message.clone());
                return;
            }
        }
        let handlers = self.handlers.lock().expect("handler lock poisoned");
        for handler in handlers.values() {
            handler(message);
        }
    }

    /// Sleep `duration`, waking early when stop is requested.
    fn sleep_interruptible(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::sleep(remaining.min(STOP_POLL_SLICE));
        }
    }
}

/// Cancellation token for a registered message handler.
///
/// Replacing a handler is "cancel old, register new"; the handler map is
/// never mutated in place.
pub struct HandlerRegistration {
    id: u64,
    shared: Arc<Shared>,
}

impl HandlerRegistration {
    /// Unregister the handler. Safe to call after the supervisor stopped.
    pub fn cancel(self) {
        self.shared
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .remove(&self.id);
    }
}

/// Supervises one transport on a dedicated loop thread.
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Start supervising `transport` in the Master (polling) role.
    pub fn start_master(
        transport: Box<dyn Transport>,
        config: SupervisorConfig,
        bus: DiagBus,
    ) -> Self {
        Self::start(LinkRole::Master, transport, config, bus)
    }

    /// Start supervising `transport` in the Sub (listening) role.
    pub fn start_sub(
        transport: Box<dyn Transport>,
        config: SupervisorConfig,
        bus: DiagBus,
    ) -> Self {
        Self::start(LinkRole::Sub, transport, config, bus)
    }

    fn start(
        role: LinkRole,
        transport: Box<dyn Transport>,
        config: SupervisorConfig,
        bus: DiagBus,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        let (outbound, out_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            role,
            config,
            bus,
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx,
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            matchers: Mutex::new(Vec::new()),
            stats: Mutex::new(LinkStats::default()),
            stop: AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let thread = thread::spawn(move || run_loop(transport, out_rx, loop_shared));

        Self {
            shared,
            outbound,
            thread: Some(thread),
        }
    }

    /// Role this supervisor was started with.
    pub fn role(&self) -> LinkRole {
        self.shared.role
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    /// Subscribe to state transitions published after this call.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Snapshot of the cumulative link counters.
    pub fn stats(&self) -> LinkStats {
        self.shared.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Register `handler` for non-heartbeat application messages.
    pub fn register_handler(
        &self,
        handler: impl Fn(&Message) + Send + 'static,
    ) -> HandlerRegistration {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .insert(id, Box::new(handler));
        HandlerRegistration {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Queue an application message for transmission on the next loop pass.
    pub fn send(&self, message: Message) -> Result<(), LinkError> {
        if message.payload.len() > super::MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                len: message.payload.len(),
                max: super::MAX_PAYLOAD_SIZE,
            });
        }
        self.outbound.send(message).map_err(|_| LinkError::Stopped)
    }

    /// Send `message` and wait for the first decoded message matching
    /// `predicate`, up to `timeout`.
    ///
    /// The matcher is fed by the same decode loop that feeds the general
    /// handlers, so there is one decode path and one dispatch point.
    pub fn request(
        &self,
        message: Message,
        predicate: impl Fn(&Message) -> bool + Send + 'static,
        timeout: Duration,
    ) -> Result<Message, LinkError> {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = mpsc::sync_channel(1);
        self.shared
            .matchers
            .lock()
            .expect("matcher lock poisoned")
            .push(Matcher {
                id,
                predicate: Box::new(predicate),
                reply,
            });

        let remove_matcher = || {
            self.shared
                .matchers
                .lock()
                .expect("matcher lock poisoned")
                .retain(|m| m.id != id);
        };

        if let Err(e) = self.send(message) {
            remove_matcher();
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                // An expired matcher must not linger and swallow a later message.
                remove_matcher();
                Err(LinkError::Timeout)
            }
        }
    }

    /// Stop the loop, close the transport and settle in `Disconnected`.
    ///
    /// Idempotent: a second call is a no-op and never double-closes.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(mut transport: Box<dyn Transport>, out_rx: mpsc::Receiver<Message>, shared: Arc<Shared>) {
    shared.set_state(ConnectionState::Initializing);
    let mut decoder = FrameDecoder::new(shared.bus.clone());

    // Open with retry: a missing cable at startup is a displayed state, not
    // a terminal failure.
    while !shared.stopped() && !transport.is_open() {
        shared.set_state(ConnectionState::Opening);
        match transport.open() {
            Ok(()) => {
                shared
                    .bus
                    .info(SOURCE, format!("transport open: {}", transport.describe()));
            }
            Err(e) => {
                warn!("transport open failed: {}", e);
                shared.bus.warn(SOURCE, format!("open failed: {}", e));
                shared.record_error(&e);
                shared.set_state(ConnectionState::Disconnected);
                shared.sleep_interruptible(shared.config.poll_interval);
            }
        }
    }

    if !shared.stopped() {
        match shared.role {
            LinkRole::Master => master_loop(transport.as_mut(), &out_rx, &shared, &mut decoder),
            LinkRole::Sub => sub_loop(transport.as_mut(), &out_rx, &shared, &mut decoder),
        }
    }

    shared.set_state(ConnectionState::Closing);
    transport.close();
    shared.set_state(ConnectionState::Disconnected);
}

/// Active role: poll with `0100`, expect `0110` within the response
/// timeout, display the result as connection state and repeat forever.
fn master_loop(
    transport: &mut dyn Transport,
    out_rx: &mpsc::Receiver<Message>,
    shared: &Arc<Shared>,
    decoder: &mut FrameDecoder,
) {
    let heartbeat = Message::new(HEARTBEAT_REQUEST, Vec::new());

    while !shared.stopped() {
        drain_outbound(transport, out_rx, shared);

        let cycle = write_frame(transport, &heartbeat, shared)
            .and_then(|()| await_ack(transport, shared, decoder));

        match cycle {
            Ok(()) => {
                shared.stats.lock().expect("stats lock poisoned").heartbeats += 1;
                shared.set_state(ConnectionState::Polling);
            }
            Err(LinkError::Stopped) => break,
            Err(e) => {
                // Transport errors are retried like timeouts; disconnection
                // is a displayed state, not an exit.
                if !matches!(e, LinkError::Timeout) {
                    shared.bus.warn(SOURCE, format!("heartbeat cycle error: {}", e));
                    shared.record_error(&e);
                }
                shared.stats.lock().expect("stats lock poisoned").heartbeat_timeouts += 1;
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        shared.sleep_interruptible(shared.config.poll_interval);
    }
}

/// Read until the heartbeat acknowledgment arrives or the response timeout
/// elapses. Non-ack messages are dispatched without touching heartbeat
/// bookkeeping.
fn await_ack(
    transport: &mut dyn Transport,
    shared: &Arc<Shared>,
    decoder: &mut FrameDecoder,
) -> Result<(), LinkError> {
    let deadline = Instant::now() + shared.config.response_timeout;
    let mut buf = [0u8; 512];

    loop {
        if shared.stopped() {
            return Err(LinkError::Stopped);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LinkError::Timeout);
        }

        let n = transport.read(&mut buf, remaining.min(shared.config.read_timeout))?;
        shared.stats.lock().expect("stats lock poisoned").rx_bytes += n as u64;

        let mut acked = false;
        for message in decoder.feed(&buf[..n]) {
            shared.stats.lock().expect("stats lock poisoned").rx_frames += 1;
            if message.command == HEARTBEAT_ACK {
                acked = true;
            } else {
                shared.dispatch(&message);
            }
        }
        if acked {
            return Ok(());
        }
    }
}

/// Passive role: short-timeout read loop. Timeouts are the common case;
/// heartbeat requests are acknowledged immediately, everything else is
/// dispatched.
fn sub_loop(
    transport: &mut dyn Transport,
    out_rx: &mpsc::Receiver<Message>,
    shared: &Arc<Shared>,
    decoder: &mut FrameDecoder,
) {
    shared.set_state(ConnectionState::Listening);
    let ack = Message::new(HEARTBEAT_ACK, Vec::new());
    let mut buf = [0u8; 512];

    while !shared.stopped() {
        drain_outbound(transport, out_rx, shared);

        let n = match transport.read(&mut buf, shared.config.read_timeout) {
            Ok(n) => n,
            Err(e) => {
                warn!("sub read error: {}", e);
                shared.bus.warn(SOURCE, format!("read error: {}", e));
                shared.record_error(&e);
                shared.set_state(ConnectionState::Disconnected);
                shared.sleep_interruptible(shared.config.poll_interval);
                continue;
            }
        };
        shared.stats.lock().expect("stats lock poisoned").rx_bytes += n as u64;

        // Zero-length (timeout) chunks still go through the decoder: the
        // codec, not the read boundary, decides where frames end.
        for message in decoder.feed(&buf[..n]) {
            shared.stats.lock().expect("stats lock poisoned").rx_frames += 1;
            if message.command == HEARTBEAT_REQUEST {
                shared.stats.lock().expect("stats lock poisoned").heartbeats += 1;
                shared.bus.debug(SOURCE, "heartbeat received");
                match write_frame(transport, &ack, shared) {
                    // A served heartbeat is the proof of life that re-enters
                    // the serving state after a transport hiccup.
                    Ok(()) => shared.set_state(ConnectionState::Listening),
                    Err(e) => {
                        shared.bus.warn(SOURCE, format!("heartbeat ack failed: {}", e));
                        shared.record_error(&e);
                    }
                }
            } else {
                shared.dispatch(&message);
            }
        }
    }
}

/// Write every queued outbound application message.
fn drain_outbound(
    transport: &mut dyn Transport,
    out_rx: &mpsc::Receiver<Message>,
    shared: &Arc<Shared>,
) {
    while let Ok(message) = out_rx.try_recv() {
        if let Err(e) = write_frame(transport, &message, shared) {
            shared
                .bus
                .warn(SOURCE, format!("send {} failed: {}", message.command, e));
            shared.record_error(&e);
        }
    }
}

fn write_frame(
    transport: &mut dyn Transport,
    message: &Message,
    shared: &Arc<Shared>,
) -> Result<(), LinkError> {
    let bytes = encode(message)?;
    let n = transport.write(&bytes, shared.config.read_timeout)?;
    let mut stats = shared.stats.lock().expect("stats lock poisoned");
    stats.tx_bytes += n as u64;
    stats.tx_frames += 1;
    Ok(())
}
