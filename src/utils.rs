use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Serializable message structs shared between the layers of a transfer
/// - Mailbox payloads (PAKE message, key confirmation + transit hints)
/// - Transit hints and the relay hello
/// - TransferOffer and the control messages of the transfer protocol

/// Which end of a transfer this process is.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    /// Byte identifying the direction of frames written by this role.
    pub fn direction_byte(self) -> u8 {
        match self {
            Role::Sender => 0x01,
            Role::Receiver => 0x02,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packages the two messages each side posts to the mailbox.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum MailboxPayload {
    /// Outbound SPAKE2 message.
    Pake(Vec<u8>),
    /// Key-confirmation MAC plus this side's transit hints, sealed under the
    /// mailbox key.
    Confirm { mac: Vec<u8>, sealed_hints: Vec<u8> },
}

/// One way to reach a peer directly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionHint {
    Tcp(SocketAddr),
    /// Endpoint inside this process (see `loopback`).
    Loopback(u64),
}

/// Everything a peer needs to build the transit connection.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitHints {
    pub direct: Vec<ConnectionHint>,
    pub relay: Option<String>,
}

/// First message on a relay connection. Two connections presenting the same
/// token with opposite roles are spliced together.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayHello {
    pub token: [u8; 32],
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    File,
    /// Directory or several paths packed into one zip archive.
    Bundle,
    Text,
}

/// Describes the payload before any of its bytes flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub kind: OfferKind,
    /// Declared names; one for files and text, the bundled top-level names
    /// for bundles.
    pub names: Vec<String>,
    pub total_size: u64,
}

impl TransferOffer {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        TransferOffer { kind: OfferKind::File, names: vec![name.into()], total_size: size }
    }

    pub fn bundle(names: Vec<String>, size: u64) -> Self {
        TransferOffer { kind: OfferKind::Bundle, names, total_size: size }
    }

    pub fn text(size: u64) -> Self {
        TransferOffer { kind: OfferKind::Text, names: Vec::new(), total_size: size }
    }

    /// Name shown to users and used for the output path.
    pub fn display_name(&self) -> String {
        match self.kind {
            OfferKind::Text => "text message".to_string(),
            _ => self.names.first().cloned().unwrap_or_else(|| "unnamed".to_string()),
        }
    }
}

/// Control frames of the transfer protocol. Payload chunks travel as raw
/// data frames and never go through this enum.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Offer(TransferOffer),
    Answer { accepted: bool },
    Done { sha256: [u8; 32] },
    /// Checksum verdict; `true` is only sent once the output is in place.
    Ack { verified: bool },
    /// The checksum matched but the receiver could not commit the output.
    NotStored { reason: String },
    Cancel,
}
