//! # Transfer protocol
//!
//! Runs over an established [`TransitChannel`]:
//!
//! ```text
//! sender                          receiver
//!   Offer(kind, names, size)  ->
//!                             <-  Answer { accepted }
//!   chunk, chunk, ...         ->      (progress after each)
//!   Done { sha256 }           ->
//!                             <-  Ack { verified } | NotStored { reason }
//! ```
//!
//! The receiver commits its output (rename, extraction) before answering
//! `Done`, so a sender only completes once the payload is really in place.
//!
//! Either side may send `Cancel` at any point; both ends then return
//! `Cancelled`. Every frame body starts with a tag byte: `0` for a bincode
//! [`ControlMessage`], `1` for raw payload bytes.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::MAX_CONTROL_SIZE;
use crate::bytes::{PayloadSource, read_chunk};
use crate::cryptography::PayloadHasher;
use crate::error::{Error, Result};
use crate::transit::{ByteStream, FrameReader, FrameWriter, TransitChannel};
use crate::utils::ControlMessage;

pub use crate::utils::{OfferKind, TransferOffer};

const TAG_CONTROL: u8 = 0;
const TAG_CHUNK: u8 = 1;

type Writer = FrameWriter<WriteHalf<ByteStream>>;
type Reader = FrameReader<ReadHalf<ByteStream>>;

/// How the receiver decides whether bytes may flow.
#[derive(Clone)]
pub enum AcceptPolicy {
    AutoAccept,
    RejectAll,
    /// Accept offers up to this many bytes.
    MaxSize(u64),
    /// Ask a callback. It runs on a blocking thread, so it may prompt a user.
    ///
    /// A cancelled session stops waiting for the answer right away, but the
    /// callback itself cannot be interrupted and keeps its thread until it
    /// returns.
    Ask(Arc<dyn Fn(&TransferOffer) -> bool + Send + Sync>),
}

impl AcceptPolicy {
    pub fn ask(prompt: impl Fn(&TransferOffer) -> bool + Send + Sync + 'static) -> Self {
        AcceptPolicy::Ask(Arc::new(prompt))
    }

    pub async fn decide(&self, offer: &TransferOffer) -> bool {
        match self {
            AcceptPolicy::AutoAccept => true,
            AcceptPolicy::RejectAll => false,
            AcceptPolicy::MaxSize(limit) => offer.total_size <= *limit,
            AcceptPolicy::Ask(prompt) => {
                let prompt = Arc::clone(prompt);
                let offer = offer.clone();
                tokio::task::spawn_blocking(move || prompt(&offer)).await.unwrap_or(false)
            }
        }
    }
}

impl fmt::Debug for AcceptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptPolicy::AutoAccept => f.write_str("AutoAccept"),
            AcceptPolicy::RejectAll => f.write_str("RejectAll"),
            AcceptPolicy::MaxSize(limit) => f.debug_tuple("MaxSize").field(limit).finish(),
            AcceptPolicy::Ask(_) => f.write_str("Ask(..)"),
        }
    }
}

/// Destination of an accepted payload.
///
/// The engine only calls `finish` once the checksum verified; on every other
/// outcome it calls `discard`, which must remove partial output.
pub trait PayloadSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<ReceivedPayload>;
    fn discard(self: Box<Self>);
}

/// What a verified payload turned into on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPayload {
    Text(String),
    File(PathBuf),
    /// Top-level paths extracted from a bundle.
    Bundle(Vec<PathBuf>),
    Memory(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Bound on delivering a cancel notice before giving up on the channel.
    pub cancel_grace: Duration,
}

// ============================================================================
// Frame bodies
// ============================================================================

#[derive(Debug)]
enum Incoming {
    Control(ControlMessage),
    Chunk(Vec<u8>),
}

fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>> {
    let mut body = vec![TAG_CONTROL];
    body.extend(bincode::serialize(msg)?);
    if body.len() > MAX_CONTROL_SIZE {
        return Err(Error::protocol(format!(
            "control message of {} bytes exceeds {MAX_CONTROL_SIZE}",
            body.len()
        )));
    }
    Ok(body)
}

fn encode_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(chunk.len() + 1);
    body.push(TAG_CHUNK);
    body.extend_from_slice(chunk);
    body
}

fn decode(mut body: Vec<u8>) -> Result<Incoming> {
    match body.first().copied() {
        Some(TAG_CONTROL) => Ok(Incoming::Control(bincode::deserialize(&body[1..])?)),
        Some(TAG_CHUNK) => {
            body.drain(..1);
            Ok(Incoming::Chunk(body))
        }
        Some(tag) => Err(Error::protocol(format!("unknown frame tag {tag}"))),
        None => Err(Error::protocol("empty frame body")),
    }
}

fn unexpected(expected: &str, got: &Incoming) -> Error {
    let got = match got {
        Incoming::Chunk(chunk) => format!("a {}-byte chunk", chunk.len()),
        Incoming::Control(msg) => format!("{msg:?}"),
    };
    Error::protocol(format!("expected {expected}, got {got}"))
}

// ============================================================================
// Endpoint
// ============================================================================

/// Frames from the peer, read by their own task so a write can never be
/// interleaved with a half-read frame.
struct Inbox {
    rx: mpsc::Receiver<Result<Incoming>>,
    task: JoinHandle<()>,
}

impl Inbox {
    fn spawn(mut reader: Reader) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                let item = match reader.recv_frame().await {
                    Ok(Some(body)) => decode(body),
                    Ok(None) => {
                        debug!("Peer sent its close notice");
                        return;
                    }
                    Err(e) => Err(e),
                };
                let fatal = item.is_err();
                if tx.send(item).await.is_err() || fatal {
                    return;
                }
            }
        });
        Inbox { rx, task }
    }

    async fn next(&mut self) -> Result<Incoming> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(Error::protocol("peer closed the channel mid-transfer")),
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Interrupt {
    Local,
    Peer(Result<Incoming>),
}

/// One side of the transfer: the sealing half of the channel plus the inbox.
struct Endpoint {
    writer: Writer,
    inbox: Inbox,
    cancel: CancellationToken,
    grace: Duration,
}

impl Endpoint {
    fn new(channel: TransitChannel, options: &TransferOptions, cancel: &CancellationToken) -> Self {
        let (writer, reader) = channel.into_split();
        Endpoint { writer, inbox: Inbox::spawn(reader), cancel: cancel.clone(), grace: options.cancel_grace }
    }

    async fn send_control(&mut self, msg: &ControlMessage) -> Result<()> {
        let body = encode_control(msg)?;
        self.send_body(&body).await
    }

    /// Write one frame while staying responsive to a cancel from either side.
    async fn send_body(&mut self, body: &[u8]) -> Result<()> {
        let mut in_flight = Box::pin(self.writer.send_frame(body));
        let interrupt = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Local,
            item = self.inbox.next() => Interrupt::Peer(item),
            result = &mut in_flight => {
                drop(in_flight);
                return match result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.explain(e).await),
                };
            }
        };

        match interrupt {
            Interrupt::Local => {
                // Finish the frame already started so the cancel notice
                // begins on a frame boundary.
                let deadline = Instant::now() + self.grace;
                let finished = tokio::time::timeout_at(deadline, &mut in_flight).await;
                drop(in_flight);
                if matches!(finished, Ok(Ok(()))) {
                    self.notify_cancel(deadline).await;
                }
                Err(Error::Cancelled)
            }
            Interrupt::Peer(Ok(Incoming::Control(ControlMessage::Cancel))) => {
                info!("Peer cancelled the transfer");
                Err(Error::Cancelled)
            }
            Interrupt::Peer(Ok(other)) => Err(unexpected("nothing while sending", &other)),
            Interrupt::Peer(Err(e)) => Err(e),
        }
    }

    /// Next message from the peer, or `Cancelled` if either side cancels first.
    async fn next_from_peer(&mut self) -> Result<Incoming> {
        let interrupt = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Local,
            item = self.inbox.next() => Interrupt::Peer(item),
        };
        match interrupt {
            Interrupt::Local => {
                self.notify_cancel(Instant::now() + self.grace).await;
                Err(Error::Cancelled)
            }
            Interrupt::Peer(Ok(Incoming::Control(ControlMessage::Cancel))) => {
                info!("Peer cancelled the transfer");
                Err(Error::Cancelled)
            }
            Interrupt::Peer(item) => item,
        }
    }

    /// A peer that cancels hangs up right after its notice, so a failed write
    /// may just be the shadow of a cancel still sitting in the inbox.
    async fn explain(&mut self, err: Error) -> Error {
        match tokio::time::timeout(self.grace, self.inbox.next()).await {
            Ok(Ok(Incoming::Control(ControlMessage::Cancel))) => {
                info!("Peer cancelled the transfer");
                Error::Cancelled
            }
            _ => err,
        }
    }

    async fn notify_cancel(&mut self, deadline: Instant) {
        let sent = match encode_control(&ControlMessage::Cancel) {
            Ok(body) => tokio::time::timeout_at(deadline, self.writer.send_frame(&body)).await,
            Err(_) => return,
        };
        match sent {
            Ok(Ok(())) => debug!("Cancel notice sent"),
            Ok(Err(e)) => debug!("Cancel notice not delivered: {}", e),
            Err(_) => debug!("Cancel notice timed out"),
        }
    }

    async fn close(mut self) {
        match tokio::time::timeout(self.grace, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close notice not delivered: {}", e),
            Err(_) => debug!("Close notice timed out"),
        }
    }
}

// ============================================================================
// Sender
// ============================================================================

pub struct SenderEngine {
    endpoint: Endpoint,
    chunk_size: usize,
}

impl SenderEngine {
    pub fn new(channel: TransitChannel, options: &TransferOptions, cancel: &CancellationToken) -> Self {
        SenderEngine { endpoint: Endpoint::new(channel, options, cancel), chunk_size: options.chunk_size }
    }

    /// Describe the payload and wait for the receiver's answer.
    pub async fn offer(&mut self, offer: &TransferOffer) -> Result<bool> {
        debug!("Offering {} ({} bytes)", offer.display_name(), offer.total_size);
        self.endpoint.send_control(&ControlMessage::Offer(offer.clone())).await?;
        match self.endpoint.next_from_peer().await? {
            Incoming::Control(ControlMessage::Answer { accepted }) => Ok(accepted),
            other => Err(unexpected("an answer to the offer", &other)),
        }
    }

    /// Stream exactly the offered number of bytes followed by their checksum,
    /// then wait for the receiver's verdict. Returns the byte count.
    pub async fn stream(&mut self, source: &mut PayloadSource, mut on_progress: impl FnMut(u64, u64)) -> Result<u64> {
        let total = source.offer().total_size;
        let mut hasher = PayloadHasher::new();
        let mut sent = 0u64;

        while sent < total {
            let want = (total - sent).min(self.chunk_size as u64) as usize;
            let chunk = read_chunk(source.reader(), want).map_err(Error::Io)?;
            if chunk.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("payload ended after {sent} of {total} bytes"),
                )));
            }
            hasher.update(&chunk);
            self.endpoint.send_body(&encode_chunk(&chunk)).await?;
            sent += chunk.len() as u64;
            on_progress(sent, total);
        }

        self.endpoint.send_control(&ControlMessage::Done { sha256: hasher.finalize() }).await?;
        match self.endpoint.next_from_peer().await? {
            Incoming::Control(ControlMessage::Ack { verified: true }) => Ok(sent),
            Incoming::Control(ControlMessage::Ack { verified: false }) => {
                warn!("Receiver reported a checksum mismatch");
                Err(Error::IntegrityMismatch)
            }
            Incoming::Control(ControlMessage::NotStored { reason }) => {
                warn!("Receiver verified the payload but could not store it: {}", reason);
                Err(Error::NotStored(reason))
            }
            other => Err(unexpected("an acknowledgement", &other)),
        }
    }

    pub async fn close(self) {
        self.endpoint.close().await
    }
}

// ============================================================================
// Receiver
// ============================================================================

pub struct ReceiverEngine {
    endpoint: Endpoint,
    chunk_size: usize,
}

impl ReceiverEngine {
    pub fn new(channel: TransitChannel, options: &TransferOptions, cancel: &CancellationToken) -> Self {
        ReceiverEngine { endpoint: Endpoint::new(channel, options, cancel), chunk_size: options.chunk_size }
    }

    pub async fn read_offer(&mut self) -> Result<TransferOffer> {
        match self.endpoint.next_from_peer().await? {
            Incoming::Control(ControlMessage::Offer(offer)) => {
                debug!("Received offer for {} ({} bytes)", offer.display_name(), offer.total_size);
                Ok(offer)
            }
            other => Err(unexpected("an offer", &other)),
        }
    }

    /// Apply `policy` while still honouring a cancel from either side.
    pub async fn decide(&mut self, policy: &AcceptPolicy, offer: &TransferOffer) -> Result<bool> {
        let interrupt = tokio::select! {
            biased;
            _ = self.endpoint.cancel.cancelled() => Interrupt::Local,
            item = self.endpoint.inbox.next() => Interrupt::Peer(item),
            accepted = policy.decide(offer) => return Ok(accepted),
        };
        match interrupt {
            Interrupt::Local => {
                self.endpoint.notify_cancel(Instant::now() + self.endpoint.grace).await;
                Err(Error::Cancelled)
            }
            Interrupt::Peer(Ok(Incoming::Control(ControlMessage::Cancel))) => Err(Error::Cancelled),
            Interrupt::Peer(Ok(other)) => Err(unexpected("nothing before answering", &other)),
            Interrupt::Peer(Err(e)) => Err(e),
        }
    }

    pub async fn answer(&mut self, accepted: bool) -> Result<()> {
        self.endpoint.send_control(&ControlMessage::Answer { accepted }).await
    }

    /// Read the payload into `sink` and verify it. The sink is finished only
    /// after a matching checksum and discarded on any failure. The sender
    /// hears the outcome of `finish`, so both sides agree on whether the
    /// payload was delivered.
    pub async fn receive_into(
        &mut self,
        offer: &TransferOffer,
        mut sink: Box<dyn PayloadSink>,
        on_progress: impl FnMut(u64, u64),
    ) -> Result<ReceivedPayload> {
        if let Err(e) = self.read_payload(offer, sink.as_mut(), on_progress).await {
            sink.discard();
            return Err(e);
        }

        match sink.finish() {
            Ok(payload) => {
                // The output is already in place; a lost ack only costs the sender its result.
                if let Err(e) = self.endpoint.send_control(&ControlMessage::Ack { verified: true }).await {
                    warn!("Payload stored but the acknowledgement was not delivered: {}", e);
                }
                Ok(payload)
            }
            Err(e) => {
                warn!("Verified payload could not be stored: {}", e);
                let notice = ControlMessage::NotStored { reason: e.to_string() };
                if let Err(send_err) = self.endpoint.send_control(&notice).await {
                    debug!("Storage failure not reported to sender: {}", send_err);
                }
                Err(e)
            }
        }
    }

    async fn read_payload(
        &mut self,
        offer: &TransferOffer,
        sink: &mut dyn PayloadSink,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<()> {
        let total = offer.total_size;
        let mut hasher = PayloadHasher::new();
        let mut received = 0u64;

        loop {
            match self.endpoint.next_from_peer().await? {
                Incoming::Chunk(chunk) => {
                    if chunk.len() > self.chunk_size {
                        return Err(Error::protocol(format!(
                            "chunk of {} bytes exceeds the {}-byte chunk size",
                            chunk.len(),
                            self.chunk_size
                        )));
                    }
                    let len = chunk.len() as u64;
                    if received + len > total {
                        return Err(Error::protocol(format!("peer sent more than the declared {total} bytes")));
                    }
                    hasher.update(&chunk);
                    sink.write_chunk(&chunk)?;
                    received += len;
                    on_progress(received, total);
                }
                Incoming::Control(ControlMessage::Done { sha256 }) => {
                    if received != total {
                        return Err(Error::protocol(format!("payload ended after {received} of {total} bytes")));
                    }
                    if hasher.finalize() != sha256 {
                        warn!("Payload checksum mismatch");
                        self.endpoint.send_control(&ControlMessage::Ack { verified: false }).await?;
                        return Err(Error::IntegrityMismatch);
                    }
                    return Ok(());
                }
                other => return Err(unexpected("payload", &other)),
            }
        }
    }

    pub async fn close(self) {
        self.endpoint.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{OutputTarget, open_sink};
    use crate::config::Config;
    use crate::cryptography::SessionKey;
    use crate::transit::ConnectionKind;
    use crate::utils::Role;

    const CHUNK: usize = 1024;

    fn options() -> TransferOptions {
        TransferOptions { chunk_size: CHUNK, cancel_grace: Duration::from_secs(2) }
    }

    fn channel_pair() -> (TransitChannel, TransitChannel) {
        let key = SessionKey::from_shared_secret(b"transfer test secret").unwrap();
        let (a, b) = tokio::io::duplex(16 * 1024);
        let max = Config { chunk_size: CHUNK, ..Config::default() }.max_frame_size();
        (
            TransitChannel::new(Box::new(a), &key, Role::Sender, ConnectionKind::Direct, max),
            TransitChannel::new(Box::new(b), &key, Role::Receiver, ConnectionKind::Direct, max),
        )
    }

    async fn run_receiver(
        channel: TransitChannel,
        policy: AcceptPolicy,
        cancel: CancellationToken,
        cancel_after_chunk: bool,
    ) -> Result<ReceivedPayload> {
        let mut engine = ReceiverEngine::new(channel, &options(), &cancel);
        let offer = engine.read_offer().await?;
        let accepted = engine.decide(&policy, &offer).await?;
        engine.answer(accepted).await?;
        if !accepted {
            return Err(Error::OfferRejected);
        }
        let sink = open_sink(&offer, &OutputTarget::Memory)?;
        let token = cancel.clone();
        engine
            .receive_into(&offer, sink, |_, _| {
                if cancel_after_chunk {
                    token.cancel();
                }
            })
            .await
    }

    /// Accepts everything, then fails to commit it.
    struct UnstorableSink;

    impl PayloadSink for UnstorableSink {
        fn write_chunk(&mut self, _chunk: &[u8]) -> Result<()> {
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<ReceivedPayload> {
            Err(Error::Bundle("extraction failed".into()))
        }

        fn discard(self: Box<Self>) {}
    }

    async fn run_sender(channel: TransitChannel, mut source: PayloadSource, cancel: CancellationToken) -> Result<u64> {
        let mut engine = SenderEngine::new(channel, &options(), &cancel);
        if !engine.offer(source.offer()).await? {
            return Err(Error::OfferRejected);
        }
        let result = engine.stream(&mut source, |_, _| {}).await;
        engine.close().await;
        result
    }

    // ============================================================================
    // Frame Body Tests
    // ============================================================================

    #[test]
    fn test_frame_tags() {
        assert_eq!(encode_chunk(b"ab"), vec![TAG_CHUNK, b'a', b'b']);
        assert!(matches!(decode(vec![TAG_CHUNK, 9]), Ok(Incoming::Chunk(c)) if c == vec![9]));
        let cancel = encode_control(&ControlMessage::Cancel).unwrap();
        assert!(matches!(decode(cancel), Ok(Incoming::Control(ControlMessage::Cancel))));
        assert!(matches!(decode(vec![7, 1, 2]), Err(Error::Protocol(_))));
    }

    // ============================================================================
    // Transfer Tests
    // ============================================================================

    #[tokio::test]
    async fn test_multi_chunk_transfer() {
        let (s, r) = channel_pair();
        let data: Vec<u8> = (0..(CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let source = PayloadSource::bytes("data.bin", data.clone()).unwrap();

        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));
        let sent = run_sender(s, source, CancellationToken::new()).await.expect("Sender should complete");
        let received = receiver.await.unwrap().expect("Receiver should complete");

        assert_eq!(sent, data.len() as u64);
        assert_eq!(received, ReceivedPayload::Memory(data));
    }

    #[tokio::test]
    async fn test_text_transfer() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));
        run_sender(s, PayloadSource::text("hi there".into()), CancellationToken::new()).await.unwrap();
        assert_eq!(receiver.await.unwrap().unwrap(), ReceivedPayload::Text("hi there".into()));
    }

    #[tokio::test]
    async fn test_rejected_offer() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::RejectAll, CancellationToken::new(), false));
        let result = run_sender(s, PayloadSource::text("nope".into()), CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::OfferRejected)));
        assert!(matches!(receiver.await.unwrap(), Err(Error::OfferRejected)));
    }

    #[tokio::test]
    async fn test_max_size_policy() {
        let offer = TransferOffer::file("a", 10);
        assert!(AcceptPolicy::MaxSize(10).decide(&offer).await);
        assert!(!AcceptPolicy::MaxSize(9).decide(&offer).await);
        assert!(AcceptPolicy::ask(|o| o.total_size == 10).decide(&offer).await);
    }

    #[tokio::test]
    async fn test_receiver_cancel_reaches_sender() {
        let (s, r) = channel_pair();
        let source = PayloadSource::bytes("big.bin", vec![1u8; CHUNK * 64]).unwrap();

        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), true));
        let result = run_sender(s, source, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Cancelled)), "sender got {result:?}");
        assert!(matches!(receiver.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_sender_cancel_reaches_receiver() {
        let (s, r) = channel_pair();
        let cancel = CancellationToken::new();
        let mut source = PayloadSource::bytes("big.bin", vec![1u8; CHUNK * 64]).unwrap();

        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));
        let mut engine = SenderEngine::new(s, &options(), &cancel);
        assert!(engine.offer(source.offer()).await.unwrap());
        let token = cancel.clone();
        let result = engine.stream(&mut source, |_, _| token.cancel()).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(matches!(receiver.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_wrong_checksum_is_integrity_mismatch() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));

        let cancel = CancellationToken::new();
        let mut endpoint = Endpoint::new(s, &options(), &cancel);
        endpoint.send_control(&ControlMessage::Offer(TransferOffer::file("x", 3))).await.unwrap();
        assert!(matches!(
            endpoint.next_from_peer().await.unwrap(),
            Incoming::Control(ControlMessage::Answer { accepted: true })
        ));
        endpoint.send_body(&encode_chunk(b"abc")).await.unwrap();
        endpoint.send_control(&ControlMessage::Done { sha256: [0u8; 32] }).await.unwrap();
        assert!(matches!(
            endpoint.next_from_peer().await.unwrap(),
            Incoming::Control(ControlMessage::Ack { verified: false })
        ));
        assert!(matches!(receiver.await.unwrap(), Err(Error::IntegrityMismatch)));
    }

    #[tokio::test]
    async fn test_excess_bytes_are_rejected() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));

        let cancel = CancellationToken::new();
        let mut endpoint = Endpoint::new(s, &options(), &cancel);
        endpoint.send_control(&ControlMessage::Offer(TransferOffer::file("x", 2))).await.unwrap();
        endpoint.next_from_peer().await.unwrap();
        endpoint.send_body(&encode_chunk(b"abc")).await.unwrap();

        assert!(matches!(receiver.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_sender_fails_when_receiver_cannot_store() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut engine = ReceiverEngine::new(r, &options(), &cancel);
            let offer = engine.read_offer().await?;
            engine.answer(true).await?;
            let result = engine.receive_into(&offer, Box::new(UnstorableSink), |_, _| {}).await;
            engine.close().await;
            result
        });
        let source = PayloadSource::bytes("x.zip", vec![5u8; 3000]).unwrap();
        let sent = run_sender(s, source, CancellationToken::new()).await;

        assert!(matches!(sent, Err(Error::NotStored(ref reason)) if reason.contains("extraction failed")), "sender got {sent:?}");
        assert!(matches!(receiver.await.unwrap(), Err(Error::Bundle(_))));
    }

    #[tokio::test]
    async fn test_offer_with_thousands_of_names() {
        let (s, r) = channel_pair();
        let names: Vec<String> = (0..3000).map(|i| format!("holiday-photo-{i:05}-from-the-long-weekend.jpg")).collect();
        let offer = TransferOffer::bundle(names.clone(), 10);

        let receiver = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut engine = ReceiverEngine::new(r, &options(), &cancel);
            let offer = engine.read_offer().await;
            if offer.is_ok() {
                engine.answer(false).await?;
            }
            offer
        });
        let cancel = CancellationToken::new();
        let mut engine = SenderEngine::new(s, &options(), &cancel);
        let accepted = engine.offer(&offer).await.expect("Large offer should be delivered");

        assert!(!accepted);
        assert_eq!(receiver.await.unwrap().expect("Receiver should read the offer").names, names);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let (s, r) = channel_pair();
        let receiver = tokio::spawn(run_receiver(r, AcceptPolicy::AutoAccept, CancellationToken::new(), false));

        let cancel = CancellationToken::new();
        let mut endpoint = Endpoint::new(s, &options(), &cancel);
        let size = (CHUNK * 2) as u64;
        endpoint.send_control(&ControlMessage::Offer(TransferOffer::file("x", size))).await.unwrap();
        endpoint.next_from_peer().await.unwrap();
        endpoint.send_body(&encode_chunk(&vec![0u8; CHUNK * 2])).await.unwrap();

        assert!(matches!(receiver.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_control_message_size_is_capped() {
        let names = vec!["n".repeat(1024); MAX_CONTROL_SIZE / 1024 + 1];
        let offer = ControlMessage::Offer(TransferOffer::bundle(names, 1));
        assert!(matches!(encode_control(&offer), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_cancel_while_asking_returns_promptly() {
        let (_s, r) = channel_pair();
        let cancel = CancellationToken::new();
        let mut engine = ReceiverEngine::new(r, &options(), &cancel);
        let slow_prompt = AcceptPolicy::ask(|_| {
            std::thread::sleep(Duration::from_secs(2));
            true
        });

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let result = engine.decide(&slow_prompt, &TransferOffer::file("a", 1)).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
