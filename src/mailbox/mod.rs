//! # Rendezvous
//!
//! Lets two processes that know the same code find each other through an
//! external mailbox broker and swap the handful of small messages needed
//! before the transit channel exists:
//! - one SPAKE2 message each way
//! - one key-confirmation message each way (carries sealed transit hints)
//!
//! The broker is a collaborator behind [`MailboxBroker`]. [`MemoryBroker`]
//! serves in-process sessions, [`TcpBroker`] talks to a broker over the network.

pub mod memory;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::code::{Nameplate, TransferCode};
use crate::error::{Error, Result};
use crate::utils::{MailboxPayload, Role};

pub use memory::MemoryBroker;
pub use tcp::TcpBroker;

/// Opaque per-process identifier of one side of a mailbox.
pub type Side = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub side: Side,
    pub body: Vec<u8>,
}

/// Message-relay API of the broker, keyed by nameplate and side.
#[async_trait]
pub trait MailboxBroker: Send + Sync {
    /// Reserve a nameplate nobody else is using.
    async fn allocate_nameplate(&self) -> Result<Nameplate>;

    /// Join the mailbox behind `nameplate` as `side`. Fails with
    /// `NameplateBusy` when two other sides already joined or the mailbox was
    /// already used for a pairing.
    async fn open(&self, nameplate: Nameplate, side: &Side) -> Result<()>;

    async fn post(&self, nameplate: Nameplate, side: &Side, body: Vec<u8>) -> Result<()>;

    /// Stream of every message posted to the mailbox, including ones posted
    /// before the subscription.
    async fn subscribe(&self, nameplate: Nameplate, side: &Side) -> Result<mpsc::UnboundedReceiver<MailboxMessage>>;

    async fn release(&self, nameplate: Nameplate, side: &Side) -> Result<()>;
}

/// Client half of the rendezvous: wraps a broker with timeouts.
#[derive(Clone)]
pub struct Rendezvous {
    broker: Arc<dyn MailboxBroker>,
    call_timeout: Duration,
}

impl Rendezvous {
    pub fn new(broker: Arc<dyn MailboxBroker>, call_timeout: Duration) -> Self {
        Rendezvous { broker, call_timeout }
    }

    pub async fn allocate(&self) -> Result<Nameplate> {
        let nameplate = bounded(self.call_timeout, "allocating a nameplate", self.broker.allocate_nameplate()).await?;
        debug!("Allocated nameplate {}", nameplate);
        Ok(nameplate)
    }

    /// Give back a nameplate from [`Rendezvous::allocate`] that never got a
    /// usable [`MailboxHandle`].
    pub async fn abandon(&self, nameplate: Nameplate, role: Role) {
        let side = new_side(role);
        match bounded(self.call_timeout, "releasing a nameplate", self.broker.release(nameplate, &side)).await {
            Ok(()) => debug!("Abandoned nameplate {}", nameplate),
            Err(e) => warn!("Could not release abandoned nameplate {}: {}", nameplate, e),
        }
    }

    /// Join the mailbox for `code` and start listening for the peer.
    pub async fn open(&self, code: &TransferCode, role: Role) -> Result<MailboxHandle> {
        let nameplate = code.nameplate();
        let side = new_side(role);

        bounded(self.call_timeout, "opening the mailbox", self.broker.open(nameplate, &side)).await?;
        let inbox = match bounded(self.call_timeout, "subscribing", self.broker.subscribe(nameplate, &side)).await {
            Ok(inbox) => inbox,
            Err(e) => {
                let _ = self.broker.release(nameplate, &side).await;
                return Err(e);
            }
        };
        debug!("Opened mailbox {} as {}", nameplate, side);

        Ok(MailboxHandle {
            broker: Arc::clone(&self.broker),
            nameplate,
            side,
            inbox,
            closed: false,
        })
    }
}

/// An open mailbox. Release it with [`MailboxHandle::close`]; dropping it
/// releases in the background.
pub struct MailboxHandle {
    broker: Arc<dyn MailboxBroker>,
    nameplate: Nameplate,
    side: Side,
    inbox: mpsc::UnboundedReceiver<MailboxMessage>,
    closed: bool,
}

impl MailboxHandle {
    pub fn nameplate(&self) -> Nameplate {
        self.nameplate
    }

    pub async fn send(&self, payload: &MailboxPayload) -> Result<()> {
        let body = bincode::serialize(payload)?;
        self.broker.post(self.nameplate, &self.side, body).await
    }

    /// Wait for the next message from the peer.
    ///
    /// Expiry of `wait` means the peer never showed up and yields
    /// `NameplateNotFound`; firing `cancel` yields `Cancelled`.
    pub async fn receive(&mut self, wait: Duration, cancel: &CancellationToken) -> Result<MailboxPayload> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::NameplateNotFound(format!(
                        "no message from the peer on nameplate {} within {}s",
                        self.nameplate,
                        wait.as_secs()
                    )));
                }
                message = self.inbox.recv() => message,
            };

            let Some(message) = message else {
                return Err(Error::transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "mailbox subscription closed",
                )));
            };

            // Our own posts are echoed back by the broker.
            if message.side == self.side {
                continue;
            }
            return Ok(bincode::deserialize(&message.body)?);
        }
    }

    /// Release the mailbox. Calling it more than once is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbox.close();
        debug!("Releasing mailbox {}", self.nameplate);
        self.broker.release(self.nameplate, &self.side).await
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let broker = Arc::clone(&self.broker);
        let nameplate = self.nameplate;
        let side = std::mem::take(&mut self.side);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = broker.release(nameplate, &side).await {
                    warn!("Background release of mailbox {} failed: {}", nameplate, e);
                }
            });
        }
    }
}

fn new_side(role: Role) -> Side {
    let id: u64 = rand::rng().random();
    format!("{}-{:016x}", role.as_str(), id)
}

async fn bounded<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::NameplateNotFound(format!("broker did not answer while {what}"))),
    }
}
