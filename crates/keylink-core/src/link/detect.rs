//! Cable presence detection
//!
//! Decides whether a pairing cable is plausibly attached before any port is
//! opened. Physical buses differ in what they expose depending on OS version
//! and bridge driver, so the detector runs several independent probes and
//! combines them with OR: one positive is enough, unanimity would produce
//! false negatives on legitimate hardware.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::diag::DiagBus;

use super::serial::{self, KNOWN_BRIDGE_VIDS};

/// Upper bound for any single probe. Probes that open devices or walk sysfs
/// must answer within this window; expiry counts as "not detected".
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const SOURCE: &str = "detector";

/// Result of one detection pass.
///
/// Never mutated after construction; `detected()` and `detection_count()`
/// are derived from the per-method flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    /// serialport enumeration reported at least one USB port
    pub usb_enumeration: bool,
    /// A /dev/ttyUSB* or /dev/ttyACM* node exists
    pub device_node: bool,
    /// The kernel usb-serial topology lists a device
    pub kernel_topology: bool,
    /// A TTY class entry is backed by real hardware
    pub tty_class: bool,
    /// A known USB-UART bridge chip answered enumeration
    pub bridge_chip: bool,
}

impl DetectionResult {
    /// True when any probe detected the cable.
    pub fn detected(&self) -> bool {
        self.detection_count() > 0
    }

    /// Number of probes that detected the cable.
    pub fn detection_count(&self) -> usize {
        [
            self.usb_enumeration,
            self.device_node,
            self.kernel_topology,
            self.tty_class,
            self.bridge_chip,
        ]
        .iter()
        .filter(|&&f| f)
        .count()
    }
}

/// A single detection probe: a name plus a fallible check.
///
/// Errors degrade to `false`; they never propagate out of `detect()`.
pub type Probe = (&'static str, Box<dyn Fn() -> std::io::Result<bool> + Send>);

/// Multi-heuristic cable presence detector.
pub struct CableDetector {
    bus: DiagBus,
}

impl CableDetector {
    /// Create a detector publishing to `bus`.
    pub fn new(bus: DiagBus) -> Self {
        Self { bus }
    }

    /// Run all built-in probes and combine their votes.
    pub fn detect(&self) -> DetectionResult {
        let flags = self.run_probes(default_probes());
        let result = DetectionResult {
            usb_enumeration: flags[0],
            device_node: flags[1],
            kernel_topology: flags[2],
            tty_class: flags[3],
            bridge_chip: flags[4],
        };
        self.bus.info(
            SOURCE,
            format!(
                "cable detection: {}/5 probes positive",
                result.detection_count()
            ),
        );
        result
    }

    /// Run a caller-supplied probe set; used by diagnostics screens and tests.
    /// Returns one flag per probe, in order.
    pub fn run_probes(&self, probes: Vec<Probe>) -> Vec<bool> {
        probes
            .into_iter()
            .map(|(name, probe)| self.run_one(name, probe))
            .collect()
    }

    fn run_one(&self, name: &'static str, probe: Box<dyn Fn() -> std::io::Result<bool> + Send>) -> bool {
        // Probes may touch device nodes that hang on broken drivers; run each
        // on its own thread and treat a missed deadline as a negative vote.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(probe());
        });

        match rx.recv_timeout(PROBE_TIMEOUT) {
            Ok(Ok(found)) => {
                self.bus
                    .debug(SOURCE, format!("probe {}: {}", name, found));
                found
            }
            Ok(Err(e)) => {
                warn!("cable probe {} failed: {}", name, e);
                self.bus.warn(SOURCE, format!("probe {} failed: {}", name, e));
                false
            }
            Err(_) => {
                warn!("cable probe {} timed out", name);
                self.bus.warn(SOURCE, format!("probe {} timed out", name));
                false
            }
        }
    }
}

/// The built-in probe set, ordered to match [`DetectionResult`]'s flags.
pub fn default_probes() -> Vec<Probe> {
    vec![
        ("usb-enumeration", Box::new(probe_usb_enumeration)),
        ("device-node", Box::new(probe_device_node)),
        ("kernel-topology", Box::new(probe_kernel_topology)),
        ("tty-class", Box::new(probe_tty_class)),
        ("bridge-chip", Box::new(probe_bridge_chip)),
    ]
}

/// Any USB serial port visible to the serialport enumeration.
fn probe_usb_enumeration() -> std::io::Result<bool> {
    Ok(serial::list_ports().iter().any(|p| p.vid.is_some()))
}

/// A ttyUSB/ttyACM device node exists under /dev.
fn probe_device_node() -> std::io::Result<bool> {
    #[cfg(target_os = "linux")]
    {
        for entry in std::fs::read_dir("/dev")? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("ttyUSB") || name.starts_with("ttyACM") {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Other platforms rely on enumeration-based probes.
        Ok(false)
    }
}

/// The kernel's usb-serial bus lists an attached device.
fn probe_kernel_topology() -> std::io::Result<bool> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_dir("/sys/bus/usb-serial/devices") {
            Ok(mut entries) => Ok(entries.next().is_some()),
            // Directory absent just means the driver never loaded.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(false)
    }
}

/// A TTY class entry backed by real hardware (has a `device` link).
fn probe_tty_class() -> std::io::Result<bool> {
    #[cfg(target_os = "linux")]
    {
        for entry in std::fs::read_dir("/sys/class/tty")? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Virtual consoles and ptys have no device link.
            if !name.starts_with("ttyUSB") && !name.starts_with("ttyACM") {
                continue;
            }
            if entry.path().join("device").exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(false)
    }
}

/// A known USB-UART bridge chip (FTDI, Prolific, SiLabs, WCH) is attached.
fn probe_bridge_chip() -> std::io::Result<bool> {
    Ok(serial::list_ports()
        .iter()
        .any(|p| p.vid.is_some_and(|vid| KNOWN_BRIDGE_VIDS.contains(&vid))))
}
