//! Error taxonomy shared by every layer of a transfer.
//!
//! Nothing here is retried automatically. Each kind either means the one-shot
//! code is spent, the network failed, or something security-relevant happened,
//! and the caller has to see which one.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed code: {0}")]
    MalformedCode(String),

    #[error("nameplate {0} already has two sides")]
    NameplateBusy(String),

    #[error("peer did not appear: {0}")]
    NameplateNotFound(String),

    #[error("key confirmation failed, the peer probably typed a different code")]
    PakeMismatch,

    #[error("no route to peer: {0}")]
    NoRouteToPeer(String),

    #[error("frame sequence {got} received, expected {expected}")]
    ReplayDetected { expected: u64, got: u64 },

    #[error("frame authentication failed")]
    AuthFailure,

    #[error("payload checksum does not match")]
    IntegrityMismatch,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("offer declined by receiver")]
    OfferRejected,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    TransportIO(#[source] io::Error),

    #[error("bundle error: {0}")]
    Bundle(String),

    #[error("receiver could not store the payload: {0}")]
    NotStored(String),

    #[error("local I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedCode(_) => ErrorKind::MalformedCode,
            Error::NameplateBusy(_) => ErrorKind::NameplateBusy,
            Error::NameplateNotFound(_) => ErrorKind::NameplateNotFound,
            Error::PakeMismatch => ErrorKind::PakeMismatch,
            Error::NoRouteToPeer(_) => ErrorKind::NoRouteToPeer,
            Error::ReplayDetected { .. } => ErrorKind::ReplayDetected,
            Error::AuthFailure => ErrorKind::AuthFailure,
            Error::IntegrityMismatch => ErrorKind::IntegrityMismatch,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::OfferRejected => ErrorKind::OfferRejected,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::TransportIO(_) => ErrorKind::TransportIO,
            Error::Bundle(_) => ErrorKind::Bundle,
            Error::NotStored(_) => ErrorKind::NotStored,
            Error::Io(_) => ErrorKind::LocalIO,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Wrap a socket-level failure. Local file errors go through `Error::Io`.
    pub fn transport(err: io::Error) -> Self {
        Error::TransportIO(err)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Protocol(format!("undecodable message: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::Bundle(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::Bundle(err.to_string())
    }
}

/// Copyable tag for an [`Error`], carried by `SessionEvent::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedCode,
    NameplateBusy,
    NameplateNotFound,
    PakeMismatch,
    NoRouteToPeer,
    ReplayDetected,
    AuthFailure,
    IntegrityMismatch,
    Cancelled,
    OfferRejected,
    Protocol,
    TransportIO,
    Bundle,
    NotStored,
    LocalIO,
    Config,
}

/// Coarse grouping used to word user-facing failure messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Wrong or expired code, or the other side never showed up.
    PeerMissing,
    /// Connectivity problem.
    Network,
    /// Authenticated data was replayed or altered.
    Tampering,
    /// Something on this machine (files, archive, settings).
    Local,
    /// Someone declined or cancelled.
    UserAction,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::MalformedCode
            | ErrorKind::NameplateBusy
            | ErrorKind::NameplateNotFound
            | ErrorKind::PakeMismatch => ErrorCategory::PeerMissing,
            ErrorKind::NoRouteToPeer | ErrorKind::TransportIO => ErrorCategory::Network,
            ErrorKind::ReplayDetected
            | ErrorKind::AuthFailure
            | ErrorKind::IntegrityMismatch
            | ErrorKind::Protocol => ErrorCategory::Tampering,
            ErrorKind::Bundle | ErrorKind::NotStored | ErrorKind::LocalIO | ErrorKind::Config => {
                ErrorCategory::Local
            }
            ErrorKind::Cancelled | ErrorKind::OfferRejected => ErrorCategory::UserAction,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedCode => "malformed code",
            ErrorKind::NameplateBusy => "nameplate busy",
            ErrorKind::NameplateNotFound => "peer not found",
            ErrorKind::PakeMismatch => "code mismatch",
            ErrorKind::NoRouteToPeer => "no route to peer",
            ErrorKind::ReplayDetected => "replay detected",
            ErrorKind::AuthFailure => "authentication failure",
            ErrorKind::IntegrityMismatch => "integrity mismatch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::OfferRejected => "offer rejected",
            ErrorKind::Protocol => "protocol violation",
            ErrorKind::TransportIO => "network error",
            ErrorKind::Bundle => "bundle error",
            ErrorKind::NotStored => "not stored by receiver",
            ErrorKind::LocalIO => "local I/O error",
            ErrorKind::Config => "configuration error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Error::PakeMismatch.kind(), ErrorKind::PakeMismatch);
        assert_eq!(
            Error::ReplayDetected { expected: 3, got: 2 }.kind(),
            ErrorKind::ReplayDetected
        );
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::transport(io).kind(), ErrorKind::TransportIO);
    }

    #[test]
    fn test_categories_keep_failures_apart() {
        assert_eq!(ErrorKind::PakeMismatch.category(), ErrorCategory::PeerMissing);
        assert_eq!(ErrorKind::NameplateNotFound.category(), ErrorCategory::PeerMissing);
        assert_eq!(ErrorKind::TransportIO.category(), ErrorCategory::Network);
        assert_eq!(ErrorKind::NoRouteToPeer.category(), ErrorCategory::Network);
        assert_eq!(ErrorKind::ReplayDetected.category(), ErrorCategory::Tampering);
        assert_eq!(ErrorKind::AuthFailure.category(), ErrorCategory::Tampering);
    }
}
