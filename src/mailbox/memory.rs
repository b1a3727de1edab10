//! In-process mailbox broker.
//!
//! Used when both peers live in the same process (tests, loopback sessions)
//! and as the reference for how a network broker is expected to behave.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use super::{MailboxBroker, MailboxMessage, Side};
use crate::code::Nameplate;
use crate::error::{Error, Result};

#[derive(Default)]
struct Mailbox {
    sides: Vec<Side>,
    messages: Vec<MailboxMessage>,
    subscribers: Vec<(Side, mpsc::UnboundedSender<MailboxMessage>)>,
    /// Set once a paired side leaves; the mailbox only winds down after that.
    closing: bool,
}

#[derive(Default)]
struct BrokerState {
    mailboxes: HashMap<Nameplate, Mailbox>,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nameplates currently reserved or in use.
    pub fn active_nameplates(&self) -> usize {
        self.lock().mailboxes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // The state stays consistent even if a holder panicked mid-call.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MailboxBroker for MemoryBroker {
    async fn allocate_nameplate(&self) -> Result<Nameplate> {
        let mut state = self.lock();
        // Smallest free number keeps codes short.
        let mut candidate = 1u64;
        loop {
            let nameplate = Nameplate::new(candidate)?;
            if let Entry::Vacant(entry) = state.mailboxes.entry(nameplate) {
                entry.insert(Mailbox::default());
                return Ok(nameplate);
            }
            candidate += 1;
        }
    }

    async fn open(&self, nameplate: Nameplate, side: &Side) -> Result<()> {
        let mut state = self.lock();
        let mailbox = state.mailboxes.entry(nameplate).or_default();

        if mailbox.sides.iter().any(|s| s == side) {
            return Ok(());
        }
        if mailbox.closing {
            return Err(Error::NameplateBusy(format!("{nameplate} (already used)")));
        }
        if mailbox.sides.len() >= 2 {
            return Err(Error::NameplateBusy(nameplate.to_string()));
        }
        mailbox.sides.push(side.clone());
        debug!("Side {} joined mailbox {} ({} sides)", side, nameplate, mailbox.sides.len());
        Ok(())
    }

    async fn post(&self, nameplate: Nameplate, side: &Side, body: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        let mailbox = state
            .mailboxes
            .get_mut(&nameplate)
            .ok_or_else(|| Error::NameplateNotFound(format!("mailbox {nameplate} is gone")))?;
        if !mailbox.sides.iter().any(|s| s == side) {
            return Err(Error::protocol(format!("side {side} posted to {nameplate} without opening it")));
        }

        let message = MailboxMessage { side: side.clone(), body };
        mailbox.subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        mailbox.messages.push(message);
        Ok(())
    }

    async fn subscribe(&self, nameplate: Nameplate, side: &Side) -> Result<mpsc::UnboundedReceiver<MailboxMessage>> {
        let mut state = self.lock();
        let mailbox = state
            .mailboxes
            .get_mut(&nameplate)
            .ok_or_else(|| Error::NameplateNotFound(format!("mailbox {nameplate} is gone")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for message in &mailbox.messages {
            // Receiver is held right here, so this cannot fail.
            let _ = tx.send(message.clone());
        }
        mailbox.subscribers.push((side.clone(), tx));
        Ok(rx)
    }

    async fn release(&self, nameplate: Nameplate, side: &Side) -> Result<()> {
        let mut state = self.lock();
        let Some(mailbox) = state.mailboxes.get_mut(&nameplate) else {
            return Ok(());
        };

        let before = mailbox.sides.len();
        mailbox.sides.retain(|s| s != side);
        mailbox.subscribers.retain(|(s, _)| s != side);
        if before == 2 {
            mailbox.closing = true;
        }

        if mailbox.sides.is_empty() {
            state.mailboxes.remove(&nameplate);
            debug!("Mailbox {} released", nameplate);
        }
        Ok(())
    }
}
