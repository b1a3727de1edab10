//! Password-authenticated key exchange over the rendezvous mailbox.
//!
//! Both sides run symmetric SPAKE2 (Ed25519 group) with the full code as the
//! password. A wrong guess costs the attacker one interactive exchange: the
//! SPAKE2 messages reveal nothing that allows an offline dictionary attack.
//!
//! SPAKE2 itself never fails on a wrong password, the two sides just derive
//! different keys. Each side therefore proves possession of the key with a
//! MAC over the exchange transcript before the key is handed out.

use std::time::Duration;

use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio_util::sync::CancellationToken;

use crate::APP_ID;
use crate::code::{Nameplate, TransferCode};
use crate::cryptography::{PURPOSE_CONFIRM, PURPOSE_MAILBOX, SessionKey, build_nonce, decrypt_chunk, encrypt_chunk};
use crate::error::{Error, Result};
use crate::mailbox::MailboxHandle;
use crate::utils::{MailboxPayload, Role, TransitHints};

type HmacSha256 = Hmac<Sha256>;

/// SPAKE2 identity for one mailbox: the app id plus the nameplate, so an
/// exchange cannot be replayed into another application or another mailbox.
pub fn create_session_id(nameplate: Nameplate) -> Identity {
    Identity::new(&session_id_digest(nameplate))
}

fn session_id_digest(nameplate: Nameplate) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(APP_ID.as_bytes());
    hasher.update(b"/nameplate/");
    hasher.update(nameplate.value().to_be_bytes());
    hasher.finalize().into()
}

/// In-flight exchange, holding the ephemeral SPAKE2 secret. Consumed by
/// [`PakeState::finish`] so the secret cannot be used twice.
pub struct PakeState {
    spake: Spake2<Ed25519Group>,
    role: Role,
    outbound: Vec<u8>,
}

/// Begin the exchange. Returns the message to post to the peer.
pub fn start(code: &TransferCode, role: Role) -> (Vec<u8>, PakeState) {
    let password = Password::new(code.password_bytes());
    let (spake, outbound) = Spake2::<Ed25519Group>::start_symmetric(&password, &create_session_id(code.nameplate()));
    (outbound.clone(), PakeState { spake, role, outbound })
}

impl PakeState {
    /// Combine with the peer's message. The result is not trusted until the
    /// peer's confirmation MAC checks out.
    pub fn finish(self, inbound: &[u8]) -> Result<UnconfirmedKey> {
        let shared_secret = self
            .spake
            .finish(inbound)
            .map_err(|e| Error::protocol(format!("bad PAKE message: {e:?}")))?;

        let (sender_msg, receiver_msg) = match self.role {
            Role::Sender => (self.outbound.as_slice(), inbound),
            Role::Receiver => (inbound, self.outbound.as_slice()),
        };
        let mut transcript = Sha256::new();
        transcript.update((sender_msg.len() as u64).to_be_bytes());
        transcript.update(sender_msg);
        transcript.update((receiver_msg.len() as u64).to_be_bytes());
        transcript.update(receiver_msg);

        Ok(UnconfirmedKey {
            key: SessionKey::from_shared_secret(&shared_secret)?,
            role: self.role,
            transcript: transcript.finalize().into(),
        })
    }
}

/// Key derived from SPAKE2 but not yet confirmed by the peer.
pub struct UnconfirmedKey {
    key: SessionKey,
    role: Role,
    transcript: [u8; 32],
}

impl UnconfirmedKey {
    fn mac_for(&self, role: Role) -> Result<HmacSha256> {
        let confirm_key = self.key.derive(PURPOSE_CONFIRM);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(confirm_key.as_ref())
            .map_err(|_| Error::protocol("HMAC rejected the confirmation key"))?;
        mac.update(b"confirm:");
        mac.update(role.as_str().as_bytes());
        mac.update(&self.transcript);
        Ok(mac)
    }

    /// MAC proving this side holds the key.
    pub fn confirmation(&self) -> Result<Vec<u8>> {
        Ok(self.mac_for(self.role)?.finalize().into_bytes().to_vec())
    }

    /// Check the peer's MAC in constant time. Any mismatch means the peer
    /// used a different code.
    pub fn verify_peer(&self, peer_mac: &[u8]) -> Result<()> {
        self.mac_for(self.role.peer())?
            .verify_slice(peer_mac)
            .map_err(|_| Error::PakeMismatch)
    }

    /// Seal this side's transit hints for the mailbox.
    pub fn seal_hints(&self, hints: &TransitHints) -> Result<Vec<u8>> {
        let plaintext = bincode::serialize(hints)?;
        let key = self.key.derive(PURPOSE_MAILBOX);
        encrypt_chunk(&key, &plaintext, &build_nonce(self.role.direction_byte(), 0), &self.transcript)
            .map_err(|_| Error::protocol("failed to seal transit hints"))
    }

    pub fn open_hints(&self, sealed: &[u8]) -> Result<TransitHints> {
        let key = self.key.derive(PURPOSE_MAILBOX);
        let plaintext = decrypt_chunk(&key, sealed, &build_nonce(self.role.peer().direction_byte(), 0), &self.transcript)
            .map_err(|_| Error::AuthFailure)?;
        Ok(bincode::deserialize(&plaintext)?)
    }

    /// Release the key once the peer's MAC verified.
    pub fn into_confirmed(self) -> SessionKey {
        self.key
    }
}

/// Timeouts for the two mailbox waits of an exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTimeouts {
    /// Wait for the peer's SPAKE2 message (the peer showing up at all).
    pub peer_wait: Duration,
    /// Wait for the peer's confirmation once it has shown up.
    pub confirm_wait: Duration,
}

/// Outcome of a successful exchange.
#[derive(Debug)]
pub struct Exchanged {
    pub key: SessionKey,
    pub peer_hints: TransitHints,
}

/// Run the full exchange over an open mailbox:
/// 1. post our SPAKE2 message, wait for the peer's
/// 2. derive the key, post our confirmation MAC + sealed hints
/// 3. wait for the peer's confirmation and verify it
///
/// `on_paired` runs once the peer's SPAKE2 message arrived.
pub async fn exchange(
    mailbox: &mut MailboxHandle,
    code: &TransferCode,
    role: Role,
    hints: &TransitHints,
    timeouts: ExchangeTimeouts,
    cancel: &CancellationToken,
    on_paired: impl FnOnce(),
) -> Result<Exchanged> {
    let (outbound, state) = start(code, role);
    mailbox.send(&MailboxPayload::Pake(outbound)).await?;
    debug!("Posted PAKE message to mailbox {}", mailbox.nameplate());

    let inbound = match mailbox.receive(timeouts.peer_wait, cancel).await? {
        MailboxPayload::Pake(msg) => msg,
        other => return Err(Error::protocol(format!("expected PAKE message, got {other:?}"))),
    };
    on_paired();

    let unconfirmed = state.finish(&inbound)?;
    let confirm = MailboxPayload::Confirm {
        mac: unconfirmed.confirmation()?,
        sealed_hints: unconfirmed.seal_hints(hints)?,
    };
    mailbox.send(&confirm).await?;

    let (peer_mac, peer_sealed) = match mailbox.receive(timeouts.confirm_wait, cancel).await? {
        MailboxPayload::Confirm { mac, sealed_hints } => (mac, sealed_hints),
        other => return Err(Error::protocol(format!("expected confirmation, got {other:?}"))),
    };
    if let Err(e) = unconfirmed.verify_peer(&peer_mac) {
        warn!("Key confirmation failed on mailbox {}", mailbox.nameplate());
        return Err(e);
    }
    let peer_hints = unconfirmed.open_hints(&peer_sealed)?;
    debug!("Key confirmed with peer on mailbox {}", mailbox.nameplate());

    Ok(Exchanged { key: unconfirmed.into_confirmed(), peer_hints })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(text: &str) -> TransferCode {
        TransferCode::parse(text).unwrap()
    }

    fn run_pair(sender_code: &str, receiver_code: &str) -> (UnconfirmedKey, UnconfirmedKey) {
        let (s_msg, s_state) = start(&code(sender_code), Role::Sender);
        let (r_msg, r_state) = start(&code(receiver_code), Role::Receiver);
        let s_key = s_state.finish(&r_msg).expect("Sender finish should succeed");
        let r_key = r_state.finish(&s_msg).expect("Receiver finish should succeed");
        (s_key, r_key)
    }

    // ============================================================================
    // Key Confirmation Tests
    // ============================================================================

    #[test]
    fn test_matching_codes_confirm() {
        let (s_key, r_key) = run_pair("5-apple-zebra", "5-apple-zebra");
        s_key.verify_peer(&r_key.confirmation().unwrap()).expect("Sender should accept receiver MAC");
        r_key.verify_peer(&s_key.confirmation().unwrap()).expect("Receiver should accept sender MAC");
    }

    #[test]
    fn test_one_character_difference_is_mismatch() {
        let (s_key, r_key) = run_pair("5-apple-zebra", "5-apple-zebrb");
        assert!(matches!(s_key.verify_peer(&r_key.confirmation().unwrap()), Err(Error::PakeMismatch)));
        assert!(matches!(r_key.verify_peer(&s_key.confirmation().unwrap()), Err(Error::PakeMismatch)));
    }

    #[test]
    fn test_reflected_mac_is_rejected() {
        // A peer echoing our own MAC back must not pass confirmation.
        let (s_key, _r_key) = run_pair("5-apple-zebra", "5-apple-zebra");
        assert!(matches!(s_key.verify_peer(&s_key.confirmation().unwrap()), Err(Error::PakeMismatch)));
    }

    #[test]
    fn test_hints_travel_sealed() {
        let (s_key, r_key) = run_pair("9-kite-lemon", "9-kite-lemon");
        let hints = TransitHints {
            direct: vec![crate::utils::ConnectionHint::Loopback(7)],
            relay: Some("relay.example:4001".into()),
        };
        let sealed = s_key.seal_hints(&hints).unwrap();
        assert!(!sealed.windows(5).any(|w| w == b"relay"));
        assert_eq!(r_key.open_hints(&sealed).unwrap(), hints);
    }

    #[test]
    fn test_both_sides_get_same_key() {
        let (s_key, r_key) = run_pair("3-owl-pine", "3-owl-pine");
        let s = s_key.into_confirmed();
        let r = r_key.into_confirmed();
        assert_eq!(s.relay_token(), r.relay_token());
    }

    #[test]
    fn test_identity_depends_on_nameplate() {
        let one = Nameplate::new(1).unwrap();
        let two = Nameplate::new(2).unwrap();
        assert_eq!(session_id_digest(one), session_id_digest(one));
        assert_ne!(session_id_digest(one), session_id_digest(two));
    }

    #[test]
    fn test_garbage_pake_message_is_protocol_error() {
        let (_msg, state) = start(&TransferCode::generate(Nameplate::new(1).unwrap(), 2), Role::Sender);
        assert!(matches!(state.finish(&[1, 2, 3]), Err(Error::Protocol(_))));
    }
}
