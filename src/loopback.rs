//! In-process [`Transport`] built on `tokio::io::duplex`.
//!
//! Lets both peers of a session live in one process, with direct listeners
//! addressed by [`ConnectionHint::Loopback`] ids and a built-in relay that
//! pairs connections by token. Direct connectivity can be switched off to
//! exercise the relay path.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::transit::{ByteStream, DirectListener, Transport};
use crate::utils::{ConnectionHint, RelayHello, Role};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct Network {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<DuplexStream>>>,
    relay_waiting: Mutex<HashMap<[u8; 32], (Role, oneshot::Sender<DuplexStream>)>>,
    relay_pairings: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloning shares the same in-process network.
#[derive(Clone)]
pub struct LoopbackTransport {
    network: Arc<Network>,
    direct: bool,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport { network: Arc::new(Network::default()), direct: true }
    }

    /// Same network, but listening always fails, so every session has to go
    /// through the relay.
    pub fn without_direct(&self) -> Self {
        LoopbackTransport { network: Arc::clone(&self.network), direct: false }
    }

    /// Number of connection pairs the relay has spliced so far.
    pub fn relay_pairings(&self) -> u64 {
        self.network.relay_pairings.load(Ordering::Relaxed)
    }
}

struct LoopbackListener {
    id: u64,
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    network: Arc<Network>,
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        lock(&self.network.listeners).remove(&self.id);
    }
}

#[async_trait]
impl DirectListener for LoopbackListener {
    fn hints(&self) -> Vec<ConnectionHint> {
        vec![ConnectionHint::Loopback(self.id)]
    }

    async fn accept(&mut self) -> Result<ByteStream> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(Error::transport(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed"))),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn listen(&self) -> Result<Box<dyn DirectListener>> {
        if !self.direct {
            return Err(Error::transport(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "direct connections disabled",
            )));
        }
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, incoming) = mpsc::unbounded_channel();
        lock(&self.network.listeners).insert(id, tx);
        Ok(Box::new(LoopbackListener { id, incoming, network: Arc::clone(&self.network) }))
    }

    async fn connect(&self, hint: &ConnectionHint) -> Result<ByteStream> {
        let ConnectionHint::Loopback(id) = hint else {
            return Err(Error::protocol(format!("loopback transport cannot dial {hint:?}")));
        };
        let listeners = lock(&self.network.listeners);
        let refused = || Error::transport(io::Error::new(io::ErrorKind::ConnectionRefused, format!("no listener {id}")));
        let tx = listeners.get(id).ok_or_else(refused)?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(theirs).map_err(|_| refused())?;
        Ok(Box::new(ours))
    }

    async fn connect_relay(&self, relay: &str, hello: &RelayHello) -> Result<ByteStream> {
        let waiter = {
            let mut waiting = lock(&self.network.relay_waiting);
            match waiting.entry(hello.token) {
                Entry::Occupied(entry) if entry.get().0 == hello.role.peer() => {
                    let (_, peer) = entry.remove();
                    let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                    if let Err(theirs) = peer.send(theirs) {
                        // Peer gave up waiting; take its place instead.
                        drop(theirs);
                        let (tx, rx) = oneshot::channel();
                        waiting.insert(hello.token, (hello.role, tx));
                        rx
                    } else {
                        self.network.relay_pairings.fetch_add(1, Ordering::Relaxed);
                        debug!("Loopback relay {} paired {} with its peer", relay, hello.role);
                        return Ok(Box::new(ours));
                    }
                }
                Entry::Occupied(mut entry) => {
                    if !entry.get().1.is_closed() {
                        return Err(Error::protocol(format!("relay {relay} already has a {} for this token", hello.role)));
                    }
                    let (tx, rx) = oneshot::channel();
                    entry.insert((hello.role, tx));
                    rx
                }
                Entry::Vacant(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.insert((hello.role, tx));
                    rx
                }
            }
        };

        debug!("Loopback relay {} holding {} until its peer arrives", relay, hello.role);
        let stream = waiter.await.map_err(|_| {
            Error::transport(io::Error::new(io::ErrorKind::ConnectionAborted, "relay dropped the connection"))
        })?;
        Ok(Box::new(stream))
    }
}
