//! Supervisor behavior against a simulated peer terminal.
//!
//! The peer lives on the far end of an in-memory duplex transport and
//! answers heartbeat requests while its `answering` flag is set, which lets
//! these tests exercise liveness, loss, recovery and dispatch without any
//! hardware.

use keylink_core::diag::DiagBus;
use keylink_core::link::{
    encode, CommandCode, ConnectionState, ConnectionSupervisor, FrameDecoder, LinkError, Message,
    SupervisorConfig, Transport, HEARTBEAT_ACK, HEARTBEAT_REQUEST,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One direction of the in-memory link.
#[derive(Default)]
struct Pipe {
    queue: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, data: &[u8]) {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(data.iter().copied());
        self.ready.notify_all();
    }

    fn pull(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if !queue.is_empty() {
                let n = buf.len().min(queue.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = queue.pop_front().unwrap();
                }
                return n;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return 0;
            }
            let (guard, _) = self.ready.wait_timeout(queue, remaining).unwrap();
            queue = guard;
        }
    }
}

struct DuplexTransport {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    open: bool,
}

impl Transport for DuplexTransport {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.open {
            return Err(LinkError::AlreadyConnected);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        self.tx.push(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        Ok(self.rx.pull(buf, timeout))
    }

    fn describe(&self) -> String {
        "duplex-test".to_string()
    }
}

fn transport_pair() -> (DuplexTransport, DuplexTransport) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        DuplexTransport {
            rx: b_to_a.clone(),
            tx: a_to_b.clone(),
            open: false,
        },
        DuplexTransport {
            rx: a_to_b,
            tx: b_to_a,
            open: false,
        },
    )
}

/// Simulated Sub terminal: acks heartbeats while `answering` is set and
/// echoes application frames back under command 0220.
struct Peer {
    answering: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Peer {
    fn spawn(mut transport: DuplexTransport) -> Self {
        let answering = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let answering2 = answering.clone();
        let stop2 = stop.clone();

        let thread = thread::spawn(move || {
            transport.open().unwrap();
            let mut decoder = FrameDecoder::new(DiagBus::new(32));
            let mut buf = [0u8; 256];
            while !stop2.load(Ordering::SeqCst) {
                let n = transport.read(&mut buf, Duration::from_millis(10)).unwrap();
                for message in decoder.feed(&buf[..n]) {
                    if message.command == HEARTBEAT_REQUEST {
                        if answering2.load(Ordering::SeqCst) {
                            let ack = Message::new(HEARTBEAT_ACK, Vec::new());
                            let frame = encode(&ack).unwrap();
                            transport
                                .write(&frame, Duration::from_millis(50))
                                .unwrap();
                        }
                    } else {
                        let echo =
                            Message::new(CommandCode::parse("0220").unwrap(), message.payload);
                        let frame = encode(&echo).unwrap();
                        transport
                            .write(&frame, Duration::from_millis(50))
                            .unwrap();
                    }
                }
            }
        });

        Self {
            answering,
            stop,
            thread: Some(thread),
        }
    }

    fn set_answering(&self, answering: bool) {
        self.answering.store(answering, Ordering::SeqCst);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        response_timeout: Duration::from_millis(150),
        poll_interval: Duration::from_millis(40),
        read_timeout: Duration::from_millis(10),
    }
}

fn wait_for_state(sup: &ConnectionSupervisor, wanted: ConnectionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if sup.state() == wanted {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn heartbeat_liveness_stays_connected() {
    let (master_end, peer_end) = transport_pair();
    let _peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let mut sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);

    assert!(
        wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)),
        "supervisor never reached Polling"
    );

    // Stays connected across at least 5 poll cycles.
    let start_heartbeats = sup.stats().heartbeats;
    let deadline = Instant::now() + Duration::from_secs(3);
    while sup.stats().heartbeats < start_heartbeats + 5 {
        assert_eq!(sup.state(), ConnectionState::Polling);
        assert!(Instant::now() < deadline, "heartbeats stalled");
        thread::sleep(Duration::from_millis(10));
    }

    sup.stop();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
}

#[test]
fn heartbeat_loss_then_recovery() {
    let (master_end, peer_end) = transport_pair();
    let peer = Peer::spawn(peer_end);

    let config = fast_config();
    let loss_window = config.response_timeout + config.poll_interval;
    let bus = DiagBus::new(256);
    let mut sup = ConnectionSupervisor::start_master(Box::new(master_end), config, bus);

    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));

    peer.set_answering(false);
    assert!(
        wait_for_state(&sup, ConnectionState::Disconnected, loss_window * 3),
        "supervisor did not notice heartbeat loss"
    );
    assert!(sup.stats().heartbeat_timeouts >= 1);

    peer.set_answering(true);
    assert!(
        wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)),
        "supervisor did not recover after peer resumed"
    );

    sup.stop();
}

#[test]
fn state_transitions_observed_in_order() {
    let (master_end, peer_end) = transport_pair();
    let peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let mut sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);
    let mut states = sup.subscribe_state();

    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));
    peer.set_answering(false);
    assert!(wait_for_state(&sup, ConnectionState::Disconnected, Duration::from_secs(2)));
    peer.set_answering(true);
    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));
    sup.stop();

    let mut observed = Vec::new();
    while let Ok(state) = states.try_recv() {
        observed.push(state);
    }
    let polling_down_polling = observed
        .windows(3)
        .any(|w| w == [
            ConnectionState::Polling,
            ConnectionState::Disconnected,
            ConnectionState::Polling,
        ]);
    assert!(
        polling_down_polling,
        "expected ordered Polling -> Disconnected -> Polling, got {:?}",
        observed
    );
    assert_eq!(*observed.last().unwrap(), ConnectionState::Disconnected);
}

#[test]
fn application_messages_reach_handler() {
    let (master_end, peer_end) = transport_pair();
    let _peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);
    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let _registration = sup.register_handler(move |message: &Message| {
        received2.lock().unwrap().push(message.clone());
    });

    // The peer echoes any application frame back as 0220; the echo must be
    // forwarded without disturbing the heartbeat exchange.
    let request = Message::new(CommandCode::parse("0300").unwrap(), b"kcv-check".to_vec());
    sup.send(request).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        {
            let got = received.lock().unwrap();
            if got
                .iter()
                .any(|m| m.command == CommandCode::parse("0220").unwrap())
            {
                break;
            }
        }
        assert!(Instant::now() < deadline, "echo never reached the handler");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sup.state(), ConnectionState::Polling);
}

#[test]
fn request_resolves_through_matcher() {
    let (master_end, peer_end) = transport_pair();
    let _peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);
    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));

    let expected = CommandCode::parse("0220").unwrap();
    let reply = sup
        .request(
            Message::new(CommandCode::parse("0310").unwrap(), b"ksn".to_vec()),
            move |m| m.command == expected,
            Duration::from_secs(2),
        )
        .expect("echo reply");
    assert_eq!(reply.payload, b"ksn".to_vec());
}

#[test]
fn cancelled_handler_stops_receiving() {
    let (master_end, peer_end) = transport_pair();
    let _peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);
    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));

    let count = Arc::new(Mutex::new(0usize));
    let count2 = count.clone();
    let registration = sup.register_handler(move |_| {
        *count2.lock().unwrap() += 1;
    });
    registration.cancel();

    sup.send(Message::new(
        CommandCode::parse("0300").unwrap(),
        b"x".to_vec(),
    ))
    .unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(*count.lock().unwrap(), 0);
}

#[test]
fn stop_is_idempotent() {
    let (master_end, peer_end) = transport_pair();
    let _peer = Peer::spawn(peer_end);

    let bus = DiagBus::new(256);
    let mut sup = ConnectionSupervisor::start_master(Box::new(master_end), fast_config(), bus);
    assert!(wait_for_state(&sup, ConnectionState::Polling, Duration::from_secs(2)));

    sup.stop();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
    sup.stop();
    assert_eq!(sup.state(), ConnectionState::Disconnected);

    // Queued sends after stop fail explicitly instead of vanishing.
    let result = sup.send(Message::new(HEARTBEAT_REQUEST, Vec::new()));
    assert!(matches!(result, Err(LinkError::Stopped)));
}

#[test]
fn sub_role_acknowledges_heartbeats() {
    let (sub_end, mut master_end) = transport_pair();

    let bus = DiagBus::new(256);
    let mut sup = ConnectionSupervisor::start_sub(Box::new(sub_end), fast_config(), bus);

    master_end.open().unwrap();
    assert!(wait_for_state(&sup, ConnectionState::Listening, Duration::from_secs(2)));

    // Poll like a Master would and expect the ack on the wire.
    let request = encode(&Message::new(HEARTBEAT_REQUEST, Vec::new())).unwrap();
    master_end
        .write(&request, Duration::from_millis(50))
        .unwrap();

    let mut decoder = FrameDecoder::new(DiagBus::new(32));
    let mut buf = [0u8; 128];
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut acked = false;
    while !acked && Instant::now() < deadline {
        let n = master_end.read(&mut buf, Duration::from_millis(20)).unwrap();
        acked = decoder
            .feed(&buf[..n])
            .iter()
            .any(|m| m.command == HEARTBEAT_ACK);
    }
    assert!(acked, "sub never acknowledged the heartbeat");

    // Application traffic still reaches the handler.
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let _registration = sup.register_handler(move |message: &Message| {
        received2.lock().unwrap().push(message.command);
    });
    let inject = encode(&Message::new(
        CommandCode::parse("0400").unwrap(),
        b"key-block".to_vec(),
    ))
    .unwrap();
    master_end.write(&inject, Duration::from_millis(50)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if received
            .lock()
            .unwrap()
            .contains(&CommandCode::parse("0400").unwrap())
        {
            break;
        }
        assert!(Instant::now() < deadline, "injected frame never dispatched");
        thread::sleep(Duration::from_millis(10));
    }

    sup.stop();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
}
