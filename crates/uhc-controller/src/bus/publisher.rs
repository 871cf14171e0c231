//! Broadcast publisher for controller-bound topics (CSS, RTD, RSP, FWRS).
//!
//! The controller binds one TCP listener per topic; any number of GUIs may
//! connect and subscribe. Publishing is fire-and-forget: a slow or gone
//! subscriber is dropped rather than allowed to block the publisher, per
//! spec.md §4.5 ("publishing... never blocks the supervisor").

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::codec::write_frame;

/// A single-topic broadcast publisher. Accepts subscriber connections on a
/// background thread and fans out every `publish` call to all of them.
pub struct Publisher {
    topic: &'static str,
    clients: Arc<Mutex<Vec<TcpStream>>>,
}

impl Publisher {
    /// Binds `bind_addr` and starts accepting subscriber connections in the
    /// background. Returns once the listener is bound.
    pub fn bind(topic: &'static str, bind_addr: &str, shutdown: Arc<AtomicBool>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_clients = clients.clone();
        thread::Builder::new()
            .name(format!("bus-accept-{topic}"))
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!(topic, %addr, "subscriber connected");
                            let _ = stream.set_nodelay(true);
                            accept_clients.lock().push(stream);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            warn!(topic, error = %e, "accept failed");
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            })
            .expect("spawn bus accept thread");

        Ok(Self { topic, clients })
    }

    /// Sends `payload` to every currently-connected subscriber. Subscribers
    /// whose write fails are dropped silently; a gone GUI is not this
    /// thread's problem.
    pub fn publish<T: Serialize>(&self, payload: &T) {
        let mut clients = self.clients.lock();
        clients.retain_mut(|stream| match write_frame(stream, self.topic, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(topic = self.topic, error = %e, "dropping subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().len()
    }
}
