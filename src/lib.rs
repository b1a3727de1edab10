pub mod bytes;
pub mod code;
pub mod commands;
pub mod config;
pub mod cryptography;
pub mod error;
pub mod loopback;
pub mod mailbox;
pub mod networking;
pub mod pake;
pub mod relay_utils;
pub mod session;
pub mod transfer;
pub mod transit;
pub mod utils;

pub use code::TransferCode;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::{Client, SessionEvent, SessionHandle, SessionId, SessionState};
pub use transfer::{AcceptPolicy, OfferKind, TransferOffer};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const ENCRYPTION_OVERHEAD: usize = 16;
/// Largest encoded control message (offer, answer, checksum, ...). Offers of
/// big bundles carry every top-level name, so this is well above a chunk.
pub const MAX_CONTROL_SIZE: usize = 1024 * 1024;

/// Application id mixed into the PAKE identity and every derived key, so codes
/// from other tools can never pair with ours.
pub const APP_ID: &str = "codedrop.transfer/v1";

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:4000";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:4001";
