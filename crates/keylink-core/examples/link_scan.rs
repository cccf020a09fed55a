//! End-to-end discovery walk-through: cable detection, endpoint probing,
//! then a Master supervisor watching the link for ten seconds.
//!
//! Run with a Sub terminal (or anything chatty) attached:
//! `cargo run --example link_scan`

use anyhow::{bail, Result};
use keylink_core::diag::DiagBus;
use keylink_core::link::{
    list_ports, probe_endpoints, CableDetector, ConnectionSupervisor, SerialTransport,
    SupervisorConfig, Transport,
};
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keylink_core=debug".into()),
        )
        .init();

    let bus = DiagBus::new(1024);

    let detection = CableDetector::new(bus.clone()).detect();
    println!(
        "cable detection: {} ({}/5 probes positive)",
        if detection.detected() { "present" } else { "absent" },
        detection.detection_count()
    );
    if !detection.detected() {
        bail!("no pairing cable detected; not probing");
    }

    let ports = list_ports();
    if ports.is_empty() {
        bail!("cable detected but no serial ports enumerated");
    }
    let names: Vec<String> = ports.iter().map(|p| p.name.clone()).collect();
    for (i, port) in ports.iter().enumerate() {
        println!("  candidate {}: {} {:?}", i, port.name, port.product);
    }

    let candidates: Vec<u32> = (0..names.len() as u32).collect();
    let found = probe_endpoints(
        |port, baud| {
            Box::new(SerialTransport::new(&names[port as usize], baud)) as Box<dyn Transport>
        },
        &candidates,
        &[115200, 9600, 19200],
        &bus,
    );

    let Some(found) = found else {
        bail!("no candidate port could be opened");
    };
    let name = &names[found.port as usize];
    println!(
        "selected {}@{} (responded: {})",
        name, found.baud, found.responded
    );

    let transport = Box::new(SerialTransport::new(name, found.baud));
    let mut supervisor =
        ConnectionSupervisor::start_master(transport, SupervisorConfig::default(), bus.clone());
    let mut states = supervisor.subscribe_state();

    let watcher = std::thread::spawn(move || {
        while let Ok(state) = states.blocking_recv() {
            println!("link state: {:?}", state);
        }
    });

    std::thread::sleep(Duration::from_secs(10));
    let stats = supervisor.stats();
    println!(
        "stats: tx {} frames / rx {} frames, {} heartbeats, {} timeouts",
        stats.tx_frames, stats.rx_frames, stats.heartbeats, stats.heartbeat_timeouts
    );

    supervisor.stop();
    drop(supervisor);
    let _ = watcher.join();

    println!("--- diagnostics ---");
    for entry in bus.snapshot() {
        println!(
            "{} [{:?}] {}: {}",
            entry.timestamp.format("%H:%M:%S%.3f"),
            entry.severity,
            entry.source,
            entry.message
        );
    }
    Ok(())
}
