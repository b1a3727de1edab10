//! # Transit channel
//!
//! Confidential, ordered, replay-checked frames between the two peers once a
//! session key exists.
//!
//! Frame layout on the wire:
//!
//! ```text
//! u32 BE length | u64 BE sequence | ChaCha20-Poly1305 ciphertext + tag
//! ```
//!
//! `length` covers the sequence and ciphertext. The nonce is
//! `direction | 0 0 0 | sequence` and the sequence is also the AAD, so a frame
//! cannot be moved to another position or direction without failing
//! authentication. An authentic frame arriving with the wrong sequence was
//! replayed or reordered and kills the channel.
//!
//! Connection setup: the sender listens and advertises hints, the receiver
//! dials them. If no direct connection authenticates within the direct
//! timeout, both sides meet at the relay named by the sender.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::cryptography::{PURPOSE_HANDSHAKE, PURPOSE_TRANSIT, SessionKey, build_nonce, decrypt_chunk, encrypt_chunk};
use crate::error::{Error, Result};
use crate::utils::{ConnectionHint, RelayHello, Role, TransitHints};
use crate::{ENCRYPTION_OVERHEAD, KEY_SIZE};

const HANDSHAKE_PREFIX: &[u8] = b"codedrop-transit-v1:";
const SEQ_LEN: usize = 8;

/// Any reliable, ordered byte stream to the peer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ByteStream = Box<dyn AsyncStream>;

/// Local endpoint the peer can dial.
#[async_trait]
pub trait DirectListener: Send {
    fn hints(&self) -> Vec<ConnectionHint>;
    async fn accept(&mut self) -> Result<ByteStream>;
}

/// Byte-stream provider. Everything above it is transport-agnostic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self) -> Result<Box<dyn DirectListener>>;
    async fn connect(&self, hint: &ConnectionHint) -> Result<ByteStream>;
    /// Connect to `relay` and wait until the peer with the same token arrives.
    async fn connect_relay(&self, relay: &str, hello: &RelayHello) -> Result<ByteStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Relayed,
}

#[derive(Debug, Clone)]
pub struct TransitOptions {
    pub direct_timeout: Duration,
    pub relay_timeout: Duration,
    pub max_frame_size: usize,
}

// ============================================================================
// Framing
// ============================================================================

/// Sealing half of a channel.
pub struct FrameWriter<W> {
    stream: W,
    key: Zeroizing<[u8; KEY_SIZE]>,
    direction: u8,
    next_seq: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W, key: &SessionKey, role: Role) -> Self {
        Self::with_purpose(stream, key, role, PURPOSE_TRANSIT)
    }

    fn with_purpose(stream: W, key: &SessionKey, role: Role, purpose: &[u8]) -> Self {
        FrameWriter { stream, key: key.derive(purpose), direction: role.direction_byte(), next_seq: 0 }
    }

    pub async fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        let seq = self.next_seq;
        let seq_bytes = seq.to_be_bytes();
        let sealed = encrypt_chunk(&self.key, body, &build_nonce(self.direction, seq), &seq_bytes)
            .map_err(|_| Error::protocol("failed to seal frame"))?;

        // Whole frame in one buffer so it reaches the stream in one write.
        let length = u32::try_from(SEQ_LEN + sealed.len()).map_err(|_| Error::protocol("frame too large"))?;
        let mut frame = Vec::with_capacity(4 + SEQ_LEN + sealed.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&seq_bytes);
        frame.extend_from_slice(&sealed);

        self.stream.write_all(&frame).await.map_err(Error::transport)?;
        self.stream.flush().await.map_err(Error::transport)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Send the close notice (an empty frame) and shut the stream down.
    pub async fn close(&mut self) -> Result<()> {
        self.send_frame(&[]).await?;
        self.stream.shutdown().await.map_err(Error::transport)
    }
}

/// Opening half of a channel.
pub struct FrameReader<R> {
    stream: R,
    key: Zeroizing<[u8; KEY_SIZE]>,
    direction: u8,
    expected_seq: u64,
    max_frame_size: usize,
    failed: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `role` is the local role; frames are expected from its peer.
    pub fn new(stream: R, key: &SessionKey, role: Role, max_frame_size: usize) -> Self {
        Self::with_purpose(stream, key, role, max_frame_size, PURPOSE_TRANSIT)
    }

    fn with_purpose(stream: R, key: &SessionKey, role: Role, max_frame_size: usize, purpose: &[u8]) -> Self {
        FrameReader {
            stream,
            key: key.derive(purpose),
            direction: role.peer().direction_byte(),
            expected_seq: 0,
            max_frame_size,
            failed: false,
        }
    }

    /// Next frame body, or `None` once the peer sent its close notice.
    ///
    /// Errors are fatal: after `AuthFailure` or `ReplayDetected` every
    /// further call fails too.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.failed {
            return Err(Error::protocol("channel already failed"));
        }
        let result = self.read_one().await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn read_one(&mut self) -> Result<Option<Vec<u8>>> {
        let length = self.stream.read_u32().await.map_err(Error::transport)? as usize;
        if length < SEQ_LEN + ENCRYPTION_OVERHEAD || length > self.max_frame_size + SEQ_LEN {
            return Err(Error::protocol(format!("frame length {length} out of bounds")));
        }

        let seq = self.stream.read_u64().await.map_err(Error::transport)?;
        let mut sealed = vec![0u8; length - SEQ_LEN];
        self.stream.read_exact(&mut sealed).await.map_err(Error::transport)?;

        let body = decrypt_chunk(&self.key, &sealed, &build_nonce(self.direction, seq), &seq.to_be_bytes())
            .map_err(|_| Error::AuthFailure)?;

        if seq != self.expected_seq {
            warn!("Authentic frame with sequence {} arrived, expected {}", seq, self.expected_seq);
            return Err(Error::ReplayDetected { expected: self.expected_seq, got: seq });
        }
        self.expected_seq += 1;

        if body.is_empty() { Ok(None) } else { Ok(Some(body)) }
    }
}

// ============================================================================
// Channel
// ============================================================================

pub struct TransitChannel {
    writer: FrameWriter<WriteHalf<ByteStream>>,
    reader: FrameReader<ReadHalf<ByteStream>>,
    kind: ConnectionKind,
}

impl TransitChannel {
    pub(crate) fn new(stream: ByteStream, key: &SessionKey, role: Role, kind: ConnectionKind, max_frame_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        TransitChannel {
            writer: FrameWriter::new(write_half, key, role),
            reader: FrameReader::new(read_half, key, role, max_frame_size),
            kind,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub async fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        self.writer.send_frame(body).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.recv_frame().await
    }

    /// Split so one task can stream while another watches for control frames.
    pub fn into_split(self) -> (FrameWriter<WriteHalf<ByteStream>>, FrameReader<ReadHalf<ByteStream>>) {
        (self.writer, self.reader)
    }

    /// Best-effort close notice, then release the transport.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.close().await {
            debug!("Close notice not delivered: {}", e);
        }
    }
}

// ============================================================================
// Establishment
// ============================================================================

/// Sender-side state between advertising hints and establishing.
pub struct PreparedTransit {
    listener: Option<Box<dyn DirectListener>>,
    hints: TransitHints,
}

impl PreparedTransit {
    pub fn hints(&self) -> &TransitHints {
        &self.hints
    }
}

/// Open local endpoints and describe them for the peer.
///
/// Only the sender listens. A failure to listen is not fatal, the transfer
/// simply goes through the relay.
pub async fn prepare(transport: &dyn Transport, role: Role, relay: Option<String>) -> PreparedTransit {
    let listener = match role {
        Role::Sender => match transport.listen().await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("Could not open a direct listener, relying on relay: {}", e);
                None
            }
        },
        Role::Receiver => None,
    };
    let direct = listener.as_ref().map(|l| l.hints()).unwrap_or_default();
    PreparedTransit { listener, hints: TransitHints { direct, relay } }
}

/// Build the channel: direct first, relay second, `NoRouteToPeer` if both fail.
pub async fn establish(
    key: &SessionKey,
    role: Role,
    transport: &dyn Transport,
    prepared: PreparedTransit,
    peer_hints: &TransitHints,
    options: &TransitOptions,
    cancel: &CancellationToken,
) -> Result<TransitChannel> {
    let PreparedTransit { listener, hints: own_hints } = prepared;

    let direct = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        stream = try_direct(key, role, transport, listener, peer_hints, options) => stream,
    };
    if let Some(stream) = direct {
        info!("Direct connection to peer established");
        return Ok(TransitChannel::new(stream, key, role, ConnectionKind::Direct, options.max_frame_size));
    }

    // Both sides must meet at the same relay: the sender's.
    let relay = match role {
        Role::Sender => own_hints.relay.clone(),
        Role::Receiver => peer_hints.relay.clone().or_else(|| own_hints.relay.clone()),
    };
    let Some(relay) = relay else {
        return Err(Error::NoRouteToPeer("direct connection failed and no relay is configured".into()));
    };

    debug!("Falling back to relay {}", relay);
    let hello = RelayHello { token: key.relay_token(), role };
    let attempt = async {
        let stream = transport.connect_relay(&relay, &hello).await?;
        handshake(stream, key, role, options.max_frame_size).await
    };
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = tokio::time::timeout(options.relay_timeout, attempt) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(Error::AuthFailure)) => return Err(Error::AuthFailure),
            Ok(Err(e)) => return Err(Error::NoRouteToPeer(format!("relay {relay} failed: {e}"))),
            Err(_) => return Err(Error::NoRouteToPeer(format!("relay {relay} did not pair us in time"))),
        },
    };
    info!("Relayed connection to peer established via {}", relay);
    Ok(TransitChannel::new(stream, key, role, ConnectionKind::Relayed, options.max_frame_size))
}

async fn try_direct(
    key: &SessionKey,
    role: Role,
    transport: &dyn Transport,
    listener: Option<Box<dyn DirectListener>>,
    peer_hints: &TransitHints,
    options: &TransitOptions,
) -> Option<ByteStream> {
    match role {
        Role::Sender => {
            let mut listener = listener?;
            // The receiver starts dialling slightly before we start
            // accepting; give it the margin.
            let window = options.direct_timeout + options.direct_timeout / 2;
            let accept_loop = async {
                loop {
                    let stream = match listener.accept().await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!("Direct accept failed: {}", e);
                            return None;
                        }
                    };
                    match handshake(stream, key, role, options.max_frame_size).await {
                        Ok(stream) => return Some(stream),
                        // Strays and wrong keys do not stop us listening.
                        Err(e) => debug!("Rejected direct connection: {}", e),
                    }
                }
            };
            tokio::time::timeout(window, accept_loop).await.ok().flatten()
        }
        Role::Receiver => {
            let dial = async {
                for hint in &peer_hints.direct {
                    let stream = match transport.connect(hint).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!("Direct connect to {:?} failed: {}", hint, e);
                            continue;
                        }
                    };
                    match handshake(stream, key, role, options.max_frame_size).await {
                        Ok(stream) => return Some(stream),
                        Err(e) => debug!("Direct handshake with {:?} failed: {}", hint, e),
                    }
                }
                None
            };
            tokio::time::timeout(options.direct_timeout, dial).await.ok().flatten()
        }
    }
}

/// Prove both ends hold the key. The receiver speaks first; each side sends
/// one sealed frame naming its role and checks the peer's.
async fn handshake(stream: ByteStream, key: &SessionKey, role: Role, max_frame_size: usize) -> Result<ByteStream> {
    let (read_half, write_half) = tokio::io::split(stream);
    // Separate key, so the channel's counters can start at zero again.
    let mut writer = FrameWriter::with_purpose(write_half, key, role, PURPOSE_HANDSHAKE);
    let mut reader = FrameReader::with_purpose(read_half, key, role, max_frame_size, PURPOSE_HANDSHAKE);

    let ours = [HANDSHAKE_PREFIX, role.as_str().as_bytes()].concat();
    let theirs = [HANDSHAKE_PREFIX, role.peer().as_str().as_bytes()].concat();

    if role == Role::Receiver {
        writer.send_frame(&ours).await?;
    }
    match reader.recv_frame().await? {
        Some(body) if body == theirs => {}
        _ => return Err(Error::AuthFailure),
    }
    if role == Role::Sender {
        writer.send_frame(&ours).await?;
    }

    Ok(reader.stream.unsplit(writer.stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn key() -> SessionKey {
        SessionKey::from_shared_secret(b"transit test secret").unwrap()
    }

    /// Frames written by the sender, as raw wire bytes.
    async fn sealed_frames(bodies: &[&[u8]]) -> Vec<u8> {
        let key = key();
        let mut writer = FrameWriter::new(Vec::new(), &key, Role::Sender);
        for body in bodies {
            writer.send_frame(body).await.expect("Should seal frame");
        }
        writer.stream
    }

    fn frame_len(wire: &[u8]) -> usize {
        4 + u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize
    }

    // ============================================================================
    // Framing Tests
    // ============================================================================

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let wire = sealed_frames(&[b"one", b"two"]).await;
        let key = key();
        let mut reader = FrameReader::new(wire.as_slice(), &key, Role::Receiver, MAX);
        assert_eq!(reader.recv_frame().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.recv_frame().await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_replayed_frame_is_detected() {
        let wire = sealed_frames(&[b"first", b"second"]).await;
        let first = frame_len(&wire);
        // first, first again, second
        let mut replayed = wire[..first].to_vec();
        replayed.extend_from_slice(&wire);

        let key = key();
        let mut reader = FrameReader::new(replayed.as_slice(), &key, Role::Receiver, MAX);
        assert_eq!(reader.recv_frame().await.unwrap(), Some(b"first".to_vec()));
        match reader.recv_frame().await {
            Err(Error::ReplayDetected { expected, got }) => {
                assert_eq!(expected, 1);
                assert_eq!(got, 0);
            }
            other => panic!("expected ReplayDetected, got {other:?}"),
        }
        // The channel stays dead after a failure.
        assert!(reader.recv_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_reordered_frames_are_detected() {
        let wire = sealed_frames(&[b"first", b"second"]).await;
        let first = frame_len(&wire);
        let mut swapped = wire[first..].to_vec();
        swapped.extend_from_slice(&wire[..first]);

        let key = key();
        let mut reader = FrameReader::new(swapped.as_slice(), &key, Role::Receiver, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::ReplayDetected { expected: 0, got: 1 })));
    }

    #[tokio::test]
    async fn test_tampered_frame_fails_authentication() {
        let mut wire = sealed_frames(&[b"payload"]).await;
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let key = key();
        let mut reader = FrameReader::new(wire.as_slice(), &key, Role::Receiver, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_rewritten_sequence_fails_authentication() {
        let mut wire = sealed_frames(&[b"payload"]).await;
        // Sequence field sits right after the length prefix.
        wire[11] = 5;

        let key = key();
        let mut reader = FrameReader::new(wire.as_slice(), &key, Role::Receiver, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_own_direction_is_rejected() {
        // A frame reflected back at its writer must not open.
        let wire = sealed_frames(&[b"payload"]).await;
        let key = key();
        let mut reader = FrameReader::new(wire.as_slice(), &key, Role::Sender, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_close_notice_reads_as_none() {
        let key = key();
        let mut writer = FrameWriter::new(Vec::new(), &key, Role::Sender);
        writer.send_frame(b"last").await.unwrap();
        writer.close().await.expect("Should send close notice");

        let mut reader = FrameReader::new(writer.stream.as_slice(), &key, Role::Receiver, MAX);
        assert_eq!(reader.recv_frame().await.unwrap(), Some(b"last".to_vec()));
        assert_eq!(reader.recv_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_is_protocol_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        wire.extend_from_slice(&[0u8; 32]);

        let key = key();
        let mut reader = FrameReader::new(wire.as_slice(), &key, Role::Receiver, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_transport_error() {
        let wire = sealed_frames(&[b"payload"]).await;
        let key = key();
        let mut reader = FrameReader::new(&wire[..wire.len() - 3], &key, Role::Receiver, MAX);
        assert!(matches!(reader.recv_frame().await, Err(Error::TransportIO(_))));
    }

    // ============================================================================
    // Handshake Tests
    // ============================================================================

    #[tokio::test]
    async fn test_handshake_then_channel_frames() {
        let (a, b) = tokio::io::duplex(4096);
        let key = key();
        let sender_key = key.clone();

        let sender = tokio::spawn(async move { handshake(Box::new(a), &sender_key, Role::Sender, MAX).await });
        let receiver_stream = handshake(Box::new(b), &key, Role::Receiver, MAX).await.expect("Receiver handshake");
        let sender_stream = sender.await.unwrap().expect("Sender handshake");

        let mut sender = TransitChannel::new(sender_stream, &key, Role::Sender, ConnectionKind::Direct, MAX);
        let mut receiver = TransitChannel::new(receiver_stream, &key, Role::Receiver, ConnectionKind::Direct, MAX);
        sender.send_frame(b"hello").await.unwrap();
        assert_eq!(receiver.recv_frame().await.unwrap(), Some(b"hello".to_vec()));
        receiver.send_frame(b"back").await.unwrap();
        assert_eq!(sender.recv_frame().await.unwrap(), Some(b"back".to_vec()));
    }

    #[tokio::test]
    async fn test_handshake_with_wrong_key_fails() {
        let (a, b) = tokio::io::duplex(4096);
        let other = SessionKey::from_shared_secret(b"some other secret").unwrap();

        let sender = tokio::spawn(async move { handshake(Box::new(a), &other, Role::Sender, MAX).await });
        let receiver = handshake(Box::new(b), &key(), Role::Receiver, MAX).await;
        assert!(matches!(sender.await.unwrap(), Err(Error::AuthFailure)));
        // The sender hangs up without answering.
        assert!(receiver.is_err());
    }
}
