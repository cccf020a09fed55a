//! Endpoint discovery
//!
//! Searches a bounded grid of (port, baud) candidates for one that answers.
//! Ports change physical routing so they form the outer loop; baud retries
//! on the same port are cheap and form the inner loop. Candidate order is
//! caller priority: most probable first.

use std::time::Duration;
use tracing::debug;

use crate::diag::DiagBus;

use super::{LinkError, Transport};

/// How long to listen on an opened candidate before moving on.
const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(300);

const SOURCE: &str = "prober";

/// Outcome of one discovery run. Transient; feed it to the supervisor and
/// discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Port candidate that was selected
    pub port: u32,
    /// Baud rate that was selected
    pub baud: u32,
    /// True when the candidate produced data; false for the first-openable
    /// fallback
    pub responded: bool,
}

/// Closes the candidate transport on every exit path, including panics in
/// the read loop.
struct OpenGuard {
    transport: Box<dyn Transport>,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Search `ports` × `bauds` for a responsive endpoint.
///
/// For each candidate the transport from `factory` is opened and listened
/// on briefly; nothing is written, since a bare probe must not assume the
/// peer reacts to stimulus. First candidate that yields data wins. If no
/// candidate ever produces data but at least one opened, the first openable
/// candidate is returned with `responded == false`: an openable-but-silent
/// port is still usable once the peer starts talking. `None` means nothing
/// could even be opened.
pub fn probe_endpoints<F>(
    factory: F,
    ports: &[u32],
    bauds: &[u32],
    bus: &DiagBus,
) -> Option<ProbeResult>
where
    F: Fn(u32, u32) -> Box<dyn Transport>,
{
    let mut fallback: Option<ProbeResult> = None;

    for &port in ports {
        for &baud in bauds {
            let mut transport = factory(port, baud);
            match transport.open() {
                Ok(()) => {}
                Err(e) => {
                    bus.debug(SOURCE, format!("open {}:{} failed: {}", port, baud, e));
                    continue;
                }
            }

            let mut guard = OpenGuard { transport };

            if fallback.is_none() {
                fallback = Some(ProbeResult {
                    port,
                    baud,
                    responded: false,
                });
            }

            match listen_briefly(guard.transport.as_mut()) {
                Ok(n) if n > 0 => {
                    bus.info(
                        SOURCE,
                        format!("endpoint {}:{} responded with {} bytes", port, baud, n),
                    );
                    return Some(ProbeResult {
                        port,
                        baud,
                        responded: true,
                    });
                }
                Ok(_) => {
                    debug!(port, baud, "candidate open but silent");
                }
                Err(e) => {
                    bus.debug(SOURCE, format!("read on {}:{} failed: {}", port, baud, e));
                }
            }
            // guard drops here, closing the candidate before the next one
        }
    }

    match &fallback {
        Some(result) => bus.info(
            SOURCE,
            format!(
                "no responsive endpoint; falling back to first openable {}:{}",
                result.port, result.baud
            ),
        ),
        None => bus.warn(SOURCE, "no candidate port could be opened"),
    }
    fallback
}

fn listen_briefly(transport: &mut dyn Transport) -> Result<usize, LinkError> {
    let mut buf = [0u8; 256];
    transport.read(&mut buf, PROBE_READ_TIMEOUT)
}
