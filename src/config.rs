//! Runtime configuration: collaborator addresses, timeouts and chunking.
//!
//! Defaults are layered under `CODEDROP_*` environment variables, and the CLI
//! layers its flags on top of whatever `Config::from_env` returns.

use std::env;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{CHUNK_SIZE, DEFAULT_BROKER_ADDR, DEFAULT_RELAY_ADDR, MAX_CONTROL_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mailbox broker used for rendezvous.
    pub broker_addr: String,
    /// Transit relay used when a direct connection cannot be made. `None`
    /// disables the fallback.
    pub relay_addr: Option<String>,
    /// Bound on broker calls and on the receiver's wait for the sender's
    /// first message.
    pub nameplate_timeout: Duration,
    /// Bound on the sender's wait for the receiver and on key confirmation.
    pub pake_timeout: Duration,
    pub direct_connect_timeout: Duration,
    pub relay_connect_timeout: Duration,
    /// How long a cancelling side waits to flush its cancel notice.
    pub cancel_grace: Duration,
    pub chunk_size: usize,
    /// Number of words appended to the nameplate in generated codes.
    pub code_words: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            broker_addr: DEFAULT_BROKER_ADDR.to_string(),
            relay_addr: Some(DEFAULT_RELAY_ADDR.to_string()),
            nameplate_timeout: Duration::from_secs(30),
            pake_timeout: Duration::from_secs(60),
            direct_connect_timeout: Duration::from_secs(3),
            relay_connect_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
            chunk_size: CHUNK_SIZE,
            code_words: 2,
        }
    }
}

impl Config {
    /// Defaults overridden by any `CODEDROP_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(addr) = env::var("CODEDROP_BROKER") {
            config.broker_addr = addr;
        }
        if let Ok(addr) = env::var("CODEDROP_RELAY") {
            config.relay_addr = if addr.trim().is_empty() { None } else { Some(addr) };
        }
        if let Some(secs) = env_secs("CODEDROP_NAMEPLATE_TIMEOUT_SECS")? {
            config.nameplate_timeout = secs;
        }
        if let Some(secs) = env_secs("CODEDROP_PAKE_TIMEOUT_SECS")? {
            config.pake_timeout = secs;
        }
        if let Some(secs) = env_secs("CODEDROP_DIRECT_TIMEOUT_SECS")? {
            config.direct_connect_timeout = secs;
        }
        if let Some(secs) = env_secs("CODEDROP_RELAY_TIMEOUT_SECS")? {
            config.relay_connect_timeout = secs;
        }
        if let Ok(words) = env::var("CODEDROP_CODE_WORDS") {
            config.code_words = words
                .parse()
                .map_err(|_| Error::Config(format!("CODEDROP_CODE_WORDS is not a number: {words}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.code_words < 2 {
            return Err(Error::Config("codes need at least two words".into()));
        }
        let timeouts = [
            ("nameplate_timeout", self.nameplate_timeout),
            ("pake_timeout", self.pake_timeout),
            ("direct_connect_timeout", self.direct_connect_timeout),
            ("relay_connect_timeout", self.relay_connect_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.relay_addr.is_none() {
            warn!("No relay configured, transfers will fail if a direct connection is impossible");
        }
        Ok(())
    }

    /// Largest sealed frame a channel built from this config accepts: room
    /// for a full chunk or for the largest control message, whichever is
    /// bigger. Chunk frames are held to `chunk_size` by the transfer engine.
    pub fn max_frame_size(&self) -> usize {
        self.chunk_size.max(MAX_CONTROL_SIZE) + 1024
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| Error::Config(format!("{name} is not a number of seconds: {raw}"))),
        Err(_) => Ok(None),
    }
}
