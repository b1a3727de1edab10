//! # Transfer sessions
//!
//! A session drives one send or receive through rendezvous, key exchange,
//! transit and transfer on its own tokio task, and reports every step as a
//! [`SessionEvent`]. [`Client`] owns the table of running sessions so any of
//! them can be cancelled by id from any thread.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bytes::{OutputTarget, PayloadSource, open_sink};
use crate::code::TransferCode;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::mailbox::{MailboxBroker, MailboxHandle, Rendezvous};
use crate::pake::{self, ExchangeTimeouts, Exchanged};
use crate::transfer::{
    AcceptPolicy, ReceivedPayload, ReceiverEngine, SenderEngine, TransferOffer, TransferOptions,
};
use crate::transit::{self, ConnectionKind, PreparedTransit, TransitOptions, Transport};
use crate::utils::{Role, TransitHints};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// Sender only: the code exists and can be shared.
    CodeReady,
    /// Receiver only: waiting for the sender's first message.
    AwaitingPeer,
    Pairing,
    KeyConfirmed,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::Cancelled)
    }

    /// Whether a session may move from `self` to `next`.
    ///
    /// The path is strictly forward. `Failed` and `Cancelled` are reachable
    /// from every live state; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            CodeReady | AwaitingPeer => self == Idle,
            Pairing => matches!(self, CodeReady | AwaitingPeer),
            KeyConfirmed => self == Pairing,
            Transferring => self == KeyConfirmed,
            Completed => self == Transferring,
            Idle => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Idle => "idle",
            SessionState::CodeReady => "waiting for receiver",
            SessionState::AwaitingPeer => "waiting for sender",
            SessionState::Pairing => "pairing",
            SessionState::KeyConfirmed => "connecting",
            SessionState::Transferring => "transferring",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub role: Role,
    pub offer: TransferOffer,
    pub bytes: u64,
    pub connection: ConnectionKind,
    /// Receiver only.
    pub received: Option<ReceivedPayload>,
}

/// Everything a caller learns about a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Sender entered `CodeReady`; show this code to the receiver.
    CodeGenerated(TransferCode),
    State(SessionState),
    /// Bytes done, bytes total.
    Progress(u64, u64),
    /// Receiver got a text payload.
    Message(String),
    Completed(TransferSummary),
    Failed(ErrorKind, String),
    Cancelled,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Completed(_) | SessionEvent::Failed(..) | SessionEvent::Cancelled)
    }
}

/// Caller's end of a running session.
pub struct SessionHandle {
    id: SessionId,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Blocking variant for threads outside the runtime (UI threads).
    /// Panics if called from inside an async context.
    pub fn next_event_blocking(&mut self) -> Option<SessionEvent> {
        self.events.blocking_recv()
    }

    /// Consume events up to and including the terminal one.
    pub async fn collect_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}

#[derive(Debug, Clone)]
pub enum SendRequest {
    Text(String),
    /// One file, or several paths/directories sent as a bundle.
    Paths(Vec<PathBuf>),
    Bytes { name: String, data: Vec<u8> },
}

impl SendRequest {
    async fn into_source(self) -> Result<PayloadSource> {
        match self {
            SendRequest::Text(text) => Ok(PayloadSource::text(text)),
            SendRequest::Bytes { name, data } => PayloadSource::bytes(&name, data),
            SendRequest::Paths(paths) => tokio::task::spawn_blocking(move || PayloadSource::paths(&paths))
                .await
                .map_err(|e| Error::Bundle(format!("bundling task failed: {e}")))?,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub policy: AcceptPolicy,
    pub output: OutputTarget,
}

impl ReceiveOptions {
    pub fn new(policy: AcceptPolicy, output: OutputTarget) -> Self {
        ReceiveOptions { policy, output }
    }
}

// ============================================================================
// Client
// ============================================================================

struct Inner {
    config: Config,
    rendezvous: Rendezvous,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    sessions: Mutex<HashMap<SessionId, CancellationToken>>,
    next_id: AtomicU64,
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, CancellationToken>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Entry point for callers. Cheap to clone; clones share the session table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Must be called from inside a tokio runtime; sessions run on it.
    pub fn new(config: Config, broker: Arc<dyn MailboxBroker>, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("a Client must be created inside a tokio runtime".into()))?;
        let rendezvous = Rendezvous::new(broker, config.nameplate_timeout);
        Ok(Client {
            inner: Arc::new(Inner {
                config,
                rendezvous,
                transport,
                runtime,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Start sending. Every call allocates a fresh code, so the same request
    /// can be shared again after a session ends.
    pub fn send(&self, request: SendRequest) -> SessionHandle {
        self.start(Job::Send(request))
    }

    pub fn receive(&self, code: &str, options: ReceiveOptions) -> SessionHandle {
        self.start(Job::Receive { code: code.to_string(), options })
    }

    /// Request cancellation. Returns `false` if the session already ended.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.inner.sessions().get(&id) {
            Some(token) => {
                info!("Cancelling session {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions().len()
    }

    fn start(&self, job: Job) -> SessionHandle {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        self.inner.sessions().insert(id, cancel.clone());

        let (tx, events) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let mut session = Session { id, state: SessionState::Idle, events: tx };
            let result = match job {
                Job::Send(request) => run_send(&inner, &mut session, request, &cancel).await,
                Job::Receive { code, options } => run_receive(&inner, &mut session, &code, options, &cancel).await,
            };
            inner.sessions().remove(&id);
            session.finish(result);
        });

        SessionHandle { id, events }
    }
}

enum Job {
    Send(SendRequest),
    Receive { code: String, options: ReceiveOptions },
}

// ============================================================================
// Session task
// ============================================================================

struct Session {
    id: SessionId,
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    fn transition(&mut self, next: SessionState, event: SessionEvent) {
        if !self.state.can_transition_to(next) {
            warn!("Session {} cannot move from {:?} to {:?}", self.id, self.state, next);
            return;
        }
        debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.emit(event);
    }

    fn enter(&mut self, next: SessionState) {
        self.transition(next, SessionEvent::State(next));
    }

    fn emit(&self, event: SessionEvent) {
        // A caller that dropped its handle no longer cares.
        let _ = self.events.send(event);
    }

    fn progress_reporter(&self) -> impl FnMut(u64, u64) + Send + 'static {
        let events = self.events.clone();
        move |done, total| {
            let _ = events.send(SessionEvent::Progress(done, total));
        }
    }

    fn finish(&mut self, result: Result<TransferSummary>) {
        match result {
            Ok(summary) => {
                info!("Session {} completed: {} bytes over a {:?} connection", self.id, summary.bytes, summary.connection);
                self.transition(SessionState::Completed, SessionEvent::Completed(summary));
            }
            Err(Error::Cancelled) => {
                info!("Session {} cancelled", self.id);
                self.transition(SessionState::Cancelled, SessionEvent::Cancelled);
            }
            Err(e) => {
                warn!("Session {} failed: {}", self.id, e);
                self.transition(SessionState::Failed, SessionEvent::Failed(e.kind(), e.to_string()));
            }
        }
    }
}

fn transit_options(config: &Config) -> TransitOptions {
    TransitOptions {
        direct_timeout: config.direct_connect_timeout,
        relay_timeout: config.relay_connect_timeout,
        max_frame_size: config.max_frame_size(),
    }
}

fn transfer_options(config: &Config) -> TransferOptions {
    TransferOptions { chunk_size: config.chunk_size, cancel_grace: config.cancel_grace }
}

async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Run the key exchange, then release the mailbox whatever the outcome: a
/// code is good for one pairing attempt.
async fn pair(
    mut mailbox: MailboxHandle,
    code: &TransferCode,
    role: Role,
    hints: &TransitHints,
    timeouts: ExchangeTimeouts,
    cancel: &CancellationToken,
    session: &mut Session,
) -> Result<Exchanged> {
    let result = pake::exchange(&mut mailbox, code, role, hints, timeouts, cancel, || {
        session.enter(SessionState::Pairing)
    })
    .await;
    if let Err(e) = mailbox.close().await {
        debug!("Releasing mailbox {} failed: {}", mailbox.nameplate(), e);
    }
    let exchanged = result?;
    session.enter(SessionState::KeyConfirmed);
    Ok(exchanged)
}

async fn connect(
    inner: &Inner,
    session: &mut Session,
    role: Role,
    prepared: PreparedTransit,
    exchanged: Exchanged,
    cancel: &CancellationToken,
) -> Result<transit::TransitChannel> {
    let channel = transit::establish(
        &exchanged.key,
        role,
        inner.transport.as_ref(),
        prepared,
        &exchanged.peer_hints,
        &transit_options(&inner.config),
        cancel,
    )
    .await?;
    session.enter(SessionState::Transferring);
    Ok(channel)
}

async fn run_send(
    inner: &Inner,
    session: &mut Session,
    request: SendRequest,
    cancel: &CancellationToken,
) -> Result<TransferSummary> {
    let config = &inner.config;
    let mut source = until_cancelled(cancel, request.into_source()).await?;
    let nameplate = until_cancelled(cancel, inner.rendezvous.allocate()).await?;
    let code = TransferCode::generate(nameplate, config.code_words);
    let mailbox = match until_cancelled(cancel, inner.rendezvous.open(&code, Role::Sender)).await {
        Ok(mailbox) => mailbox,
        Err(e) => {
            inner.rendezvous.abandon(nameplate, Role::Sender).await;
            return Err(e);
        }
    };

    info!("Session {} offering {} on nameplate {}", session.id, source.offer().display_name(), nameplate);
    session.transition(SessionState::CodeReady, SessionEvent::CodeGenerated(code.clone()));

    let prepared = transit::prepare(inner.transport.as_ref(), Role::Sender, config.relay_addr.clone()).await;
    // The receiver may still be typing the code, so the sender waits longer.
    let timeouts = ExchangeTimeouts { peer_wait: config.pake_timeout, confirm_wait: config.pake_timeout };
    let hints = prepared.hints().clone();
    let exchanged = pair(mailbox, &code, Role::Sender, &hints, timeouts, cancel, session).await?;
    let channel = connect(inner, session, Role::Sender, prepared, exchanged, cancel).await?;

    let connection = channel.kind();
    let offer = source.offer().clone();
    let mut engine = SenderEngine::new(channel, &transfer_options(config), cancel);
    let progress = session.progress_reporter();
    let result = async {
        if !engine.offer(&offer).await? {
            return Err(Error::OfferRejected);
        }
        engine.stream(&mut source, progress).await
    }
    .await;
    engine.close().await;

    let bytes = result?;
    Ok(TransferSummary { role: Role::Sender, offer, bytes, connection, received: None })
}

async fn run_receive(
    inner: &Inner,
    session: &mut Session,
    code: &str,
    options: ReceiveOptions,
    cancel: &CancellationToken,
) -> Result<TransferSummary> {
    let config = &inner.config;
    let code = TransferCode::parse(code)?;
    session.enter(SessionState::AwaitingPeer);
    let mailbox = until_cancelled(cancel, inner.rendezvous.open(&code, Role::Receiver)).await?;

    let prepared = transit::prepare(inner.transport.as_ref(), Role::Receiver, config.relay_addr.clone()).await;
    let timeouts = ExchangeTimeouts { peer_wait: config.nameplate_timeout, confirm_wait: config.pake_timeout };
    let hints = prepared.hints().clone();
    let exchanged = pair(mailbox, &code, Role::Receiver, &hints, timeouts, cancel, session).await?;
    let channel = connect(inner, session, Role::Receiver, prepared, exchanged, cancel).await?;

    let connection = channel.kind();
    let mut engine = ReceiverEngine::new(channel, &transfer_options(config), cancel);
    let result = accept_and_receive(&mut engine, &options, session.progress_reporter()).await;
    engine.close().await;

    let (offer, payload) = result?;
    if let ReceivedPayload::Text(text) = &payload {
        session.emit(SessionEvent::Message(text.clone()));
    }
    Ok(TransferSummary { role: Role::Receiver, bytes: offer.total_size, offer, connection, received: Some(payload) })
}

async fn accept_and_receive(
    engine: &mut ReceiverEngine,
    options: &ReceiveOptions,
    progress: impl FnMut(u64, u64),
) -> Result<(TransferOffer, ReceivedPayload)> {
    let offer = engine.read_offer().await?;
    if !engine.decide(&options.policy, &offer).await? {
        info!("Declining offer for {}", offer.display_name());
        engine.answer(false).await?;
        return Err(Error::OfferRejected);
    }
    let sink = match open_sink(&offer, &options.output) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = engine.answer(false).await;
            return Err(e);
        }
    };
    engine.answer(true).await?;
    let payload = engine.receive_into(&offer, sink, progress).await?;
    Ok((offer, payload))
}
