//! Reconnecting TCP client for GUI-bound topics (HB, CMD, TIME, FWUP). The
//! GUI binds the listener; the controller connects out and reconnects on
//! any I/O error, since a display unit may reboot independently of the
//! cabinet.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::codec::read_message;
use crate::error::UhcError;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Read timeout so the blocking receive loop still polls the shutdown flag
/// at a bounded cadence, per spec.md §5's "receive timeout to make
/// cancellation responsive."
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Connects to `addr`, decodes frames as `T`, and forwards each to `tx`
/// until `shutdown` is set. Reconnects on any I/O error after
/// `RECONNECT_DELAY`.
pub fn run_subscriber<T: DeserializeOwned + Send + 'static>(label: &'static str, addr: String, tx: Sender<T>, shutdown: std::sync::Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
                let _ = stream.set_nodelay(true);
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    match read_message::<_, T>(&mut stream) {
                        Ok(msg) => {
                            if tx.send(msg).is_err() {
                                return;
                            }
                        }
                        Err(UhcError::BusIo(e)) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                            continue;
                        }
                        Err(e) => {
                            debug!(label, addr, error = %e, "subscriber read failed, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(label, addr, error = %e, "connect failed, retrying");
            }
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}
