//! Connection manager owning the link state machine and the live attempts

use super::attempt::AttemptHandle;
use super::pump::{self, PumpHandle, WriteRequest};
use crate::transport::{
    close_stream, BoxedStream, Established, TransportAcceptor, TransportConnector,
};
use btlink_shared::{
    link, ConnectionState, LinkError, LinkEvent, LinkStateMachine, PeerId, PeerIdentity,
    TransitionResult,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// A stream was opened and the peer behind it is known
    DeviceIdentified(PeerIdentity),
    /// Bytes arrived from the peer
    BytesReceived(Bytes),
    /// Recoverable failure; the manager has already moved to a restartable state
    TransientError(LinkError),
}

/// Receiving side of the manager's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound on one outbound attempt
    pub connect_timeout: Duration,
    /// Largest chunk delivered per read
    pub read_buffer_size: usize,
    /// Keep accepting inbound peers after one was accepted
    pub reaccept: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(link::CONNECT_TIMEOUT_MS),
            read_buffer_size: link::READ_BUFFER_SIZE,
            reaccept: true,
        }
    }
}

/// What occupies the connection slot
enum Phase {
    Idle,
    Connecting(AttemptHandle),
    Connected(PumpHandle),
}

impl Phase {
    fn into_attempt(self) -> Option<AttemptHandle> {
        match self {
            Phase::Idle => None,
            Phase::Connecting(attempt) => Some(attempt),
            Phase::Connected(pump) => Some(pump.attempt),
        }
    }
}

struct Inner {
    fsm: LinkStateMachine,
    phase: Phase,
    acceptor: Option<AttemptHandle>,
    /// Cancelled handles whose tasks may still be winding down
    retiring: Vec<AttemptHandle>,
}

impl Inner {
    fn retire(&mut self, handle: AttemptHandle) {
        handle.signal();
        self.retiring.retain(|h| !h.is_finished());
        self.retiring.push(handle);
    }

    fn drain_all(&mut self) -> Vec<AttemptHandle> {
        let mut handles: Vec<AttemptHandle> = self.retiring.drain(..).collect();
        handles.extend(std::mem::replace(&mut self.phase, Phase::Idle).into_attempt());
        handles.extend(self.acceptor.take());
        handles
    }
}

/// Outcome of trying to install a freshly opened stream
enum Commit {
    Installed,
    Rejected(BoxedStream),
}

/// State shared between the manager and its tasks
pub(crate) struct Shared {
    config: LinkConfig,
    connector: Arc<dyn TransportConnector>,
    acceptor: Option<Arc<dyn TransportAcceptor>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drive the state machine; emits StateChanged when the state moves
    fn transition(&self, inner: &mut Inner, event: LinkEvent) -> bool {
        let from = inner.fsm.state();
        match inner.fsm.process_event(event) {
            TransitionResult::Success(to) => {
                if to != from {
                    info!("[LINK] State: {} -> {}", from, to);
                    let _ = self.event_tx.send(ConnectionEvent::StateChanged(to));
                }
                true
            }
            TransitionResult::Invalid { from, event } => {
                debug!("[LINK] Ignoring {:?} in state {}", event, from);
                false
            }
        }
    }

    /// Deliver a non-state event unless the manager has been stopped
    fn emit(&self, inner: &Inner, event: ConnectionEvent) {
        if !inner.fsm.is_stopped() {
            let _ = self.event_tx.send(event);
        }
    }

    fn launch_acceptor(self: &Arc<Self>, inner: &mut Inner) {
        let Some(acceptor) = self.acceptor.clone() else {
            return;
        };
        if inner.acceptor.is_some() || inner.fsm.is_stopped() {
            return;
        }
        let id = self.next_id();
        let token = CancellationToken::new();
        let task = tokio::spawn(run_acceptor(self.clone(), acceptor, id, token.clone()));
        inner.acceptor = Some(AttemptHandle::new(id, token, task));
    }

    fn install_pump(self: &Arc<Self>, inner: &mut Inner, established: Established) {
        let Established { stream, peer } = established;
        let id = self.next_id();
        let token = CancellationToken::new();
        let (writer, requests) = mpsc::channel(1);
        let task = tokio::spawn(pump::run(
            self.clone(),
            id,
            stream,
            requests,
            token.clone(),
            self.config.read_buffer_size,
        ));
        info!("[LINK] Connected to {}", peer);
        inner.phase = Phase::Connected(PumpHandle {
            attempt: AttemptHandle::new(id, token, task),
            writer,
            peer: peer.clone(),
        });
        self.emit(inner, ConnectionEvent::DeviceIdentified(peer));
    }

    fn start(self: &Arc<Self>) -> Result<(), LinkError> {
        let mut inner = self.lock();
        if inner.fsm.is_stopped() {
            return Err(LinkError::Stopped);
        }
        let can_listen = self.acceptor.is_some();
        self.transition(&mut inner, LinkEvent::Started { can_listen });
        if can_listen
            && matches!(
                inner.fsm.state(),
                ConnectionState::Listening | ConnectionState::Connecting
            )
        {
            self.launch_acceptor(&mut inner);
        }
        Ok(())
    }

    /// Install a gated outbound attempt and hand back everything it supersedes
    fn begin_connect(
        self: &Arc<Self>,
        peer: PeerId,
        secure: bool,
    ) -> Result<(Vec<AttemptHandle>, oneshot::Sender<()>), LinkError> {
        let mut inner = self.lock();
        if inner.fsm.is_stopped() {
            return Err(LinkError::Stopped);
        }

        let mut superseded: Vec<AttemptHandle> = inner.retiring.drain(..).collect();
        superseded.extend(std::mem::replace(&mut inner.phase, Phase::Idle).into_attempt());
        for handle in &superseded {
            handle.signal();
        }

        self.transition(&mut inner, LinkEvent::ConnectRequested);

        let id = self.next_id();
        let token = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel();
        let task = tokio::spawn(run_outbound(
            self.clone(),
            self.connector.clone(),
            id,
            peer,
            secure,
            token.clone(),
            gate_rx,
        ));
        inner.phase = Phase::Connecting(AttemptHandle::new(id, token, task));
        Ok((superseded, gate_tx))
    }

    fn commit_outbound(self: &Arc<Self>, id: u64, established: Established) -> Commit {
        let mut inner = self.lock();
        if !matches!(&inner.phase, Phase::Connecting(h) if h.id() == id) {
            debug!("[LINK] Discarding stale outbound attempt {}", id);
            return Commit::Rejected(established.stream);
        }
        self.transition(&mut inner, LinkEvent::OutboundSucceeded);
        if let Some(acceptor) = inner.acceptor.take() {
            inner.retire(acceptor);
        }
        self.install_pump(&mut inner, established);
        Commit::Installed
    }

    fn fail_outbound(self: &Arc<Self>, id: u64, error: LinkError) {
        let mut inner = self.lock();
        if !matches!(&inner.phase, Phase::Connecting(h) if h.id() == id) {
            debug!("[LINK] Ignoring failure of stale outbound attempt {}", id);
            return;
        }
        warn!("[LINK] {}", error);
        inner.phase = Phase::Idle;
        self.transition(&mut inner, LinkEvent::OutboundFailed);
        self.emit(&inner, ConnectionEvent::TransientError(error));
        if inner.fsm.can_listen() {
            self.launch_acceptor(&mut inner);
        }
    }

    fn commit_inbound(self: &Arc<Self>, id: u64, established: Established) -> Commit {
        let mut inner = self.lock();
        let current = inner.acceptor.as_ref().map(AttemptHandle::id) == Some(id);
        let open = matches!(
            inner.fsm.state(),
            ConnectionState::Listening | ConnectionState::Connecting
        );
        if !current || !open {
            info!(
                "[LINK] Rejecting inbound peer {} in state {}",
                established.peer,
                inner.fsm.state()
            );
            return Commit::Rejected(established.stream);
        }
        self.transition(&mut inner, LinkEvent::InboundAccepted);
        if let Some(outbound) = std::mem::replace(&mut inner.phase, Phase::Idle).into_attempt() {
            inner.retire(outbound);
        }
        self.install_pump(&mut inner, established);
        Commit::Installed
    }

    /// Acceptor run finished on its own; `error` is set when it failed
    fn acceptor_ended(&self, id: u64, error: Option<LinkError>) {
        let mut inner = self.lock();
        if inner.acceptor.as_ref().map(AttemptHandle::id) != Some(id) {
            return;
        }
        inner.acceptor = None;
        self.transition(&mut inner, LinkEvent::ListenerEnded);
        if let Some(error) = error {
            warn!("[LINK] {}", error);
            self.emit(&inner, ConnectionEvent::TransientError(error));
        }
    }

    fn is_current_pump(inner: &Inner, id: u64) -> bool {
        matches!(&inner.phase, Phase::Connected(p) if p.attempt.id() == id)
    }

    pub(crate) fn pump_received(&self, id: u64, payload: Bytes) {
        let inner = self.lock();
        if Self::is_current_pump(&inner, id) {
            self.emit(&inner, ConnectionEvent::BytesReceived(payload));
        }
    }

    pub(crate) fn pump_write_failed(&self, id: u64, error: LinkError) {
        let inner = self.lock();
        if Self::is_current_pump(&inner, id) {
            self.emit(&inner, ConnectionEvent::TransientError(error));
        }
    }

    pub(crate) fn pump_ended(self: &Arc<Self>, id: u64, reason: LinkError) {
        let mut inner = self.lock();
        if !Self::is_current_pump(&inner, id) {
            return;
        }
        inner.phase = Phase::Idle;
        self.transition(&mut inner, LinkEvent::StreamLost);
        self.emit(&inner, ConnectionEvent::TransientError(reason));
        if inner.fsm.can_listen() {
            self.launch_acceptor(&mut inner);
        }
    }

    fn writer(&self) -> Result<mpsc::Sender<WriteRequest>, LinkError> {
        let inner = self.lock();
        match &inner.phase {
            Phase::Connected(pump) if inner.fsm.state() == ConnectionState::Connected => {
                Ok(pump.writer.clone())
            }
            _ => Err(LinkError::NotConnected),
        }
    }

    fn begin_stop(&self) -> Vec<AttemptHandle> {
        let mut inner = self.lock();
        if inner.fsm.is_stopped() {
            return Vec::new();
        }
        self.transition(&mut inner, LinkEvent::Stopped);
        let handles = inner.drain_all();
        for handle in &handles {
            handle.signal();
        }
        handles
    }
}

/// Outbound attempt task. Waits on `gate` until superseded attempts are gone.
async fn run_outbound(
    shared: Arc<Shared>,
    connector: Arc<dyn TransportConnector>,
    id: u64,
    peer: PeerId,
    secure: bool,
    token: CancellationToken,
    gate: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = gate => {}
    }

    info!(
        "[LINK] Connecting to {} via {} (secure={})",
        peer,
        connector.name(),
        secure
    );
    let connect_timeout = shared.config.connect_timeout;
    let result = tokio::select! {
        _ = token.cancelled() => {
            debug!("[LINK] Outbound attempt {} cancelled", id);
            return;
        }
        result = timeout(connect_timeout, connector.connect(&peer, secure)) => result,
    };

    let established = match result {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            shared.fail_outbound(id, LinkError::ConnectFailed(e.to_string()));
            return;
        }
        Err(_) => {
            shared.fail_outbound(
                id,
                LinkError::ConnectFailed(format!("timed out after {:?}", connect_timeout)),
            );
            return;
        }
    };

    if let Commit::Rejected(stream) = shared.commit_outbound(id, established) {
        close_stream(stream).await;
    }
}

/// Acceptor task: bind once, then accept until cancelled
async fn run_acceptor(
    shared: Arc<Shared>,
    acceptor: Arc<dyn TransportAcceptor>,
    id: u64,
    token: CancellationToken,
) {
    let mut listener = tokio::select! {
        _ = token.cancelled() => return,
        result = acceptor.bind() => match result {
            Ok(listener) => listener,
            Err(e) => {
                shared.acceptor_ended(id, Some(LinkError::ListenFailed(e.to_string())));
                return;
            }
        },
    };
    info!("[LINK] Listening via {}", acceptor.name());

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => {
                debug!("[LINK] Acceptor {} cancelled", id);
                return;
            }
            result = listener.accept() => result,
        };

        match accepted {
            Ok(established) => {
                if let Commit::Rejected(stream) = shared.commit_inbound(id, established) {
                    close_stream(stream).await;
                }
            }
            Err(e) => {
                shared.acceptor_ended(id, Some(LinkError::ListenFailed(e.to_string())));
                return;
            }
        }

        if !shared.config.reaccept {
            shared.acceptor_ended(id, None);
            return;
        }
    }
}

/// Manages the connection to a single peer.
///
/// All state transitions happen under one lock that is never held across an
/// await. Control operations (`start`, `connect`, `stop`) are serialized so a
/// new attempt only runs after the attempts it supersedes have finished.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager; nothing runs until `start` or `connect` is called
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn TransportConnector>,
        acceptor: Option<Arc<dyn TransportAcceptor>>,
    ) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            connector,
            acceptor,
            event_tx,
            next_id: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                fsm: LinkStateMachine::new(),
                phase: Phase::Idle,
                acceptor: None,
                retiring: Vec::new(),
            }),
        });

        (
            Self {
                shared,
                control: tokio::sync::Mutex::new(()),
            },
            event_rx,
        )
    }

    /// Begin listening for inbound peers if an acceptor is configured
    pub async fn start(&self) -> Result<(), LinkError> {
        let _control = self.control.lock().await;
        self.shared.start()
    }

    /// Connect to `peer`, replacing any attempt or connection in progress
    pub async fn connect(&self, peer: &str, secure: bool) -> Result<(), LinkError> {
        let peer = PeerId::parse(peer)?;
        let _control = self.control.lock().await;
        let (superseded, gate) = self.shared.begin_connect(peer, secure)?;
        for handle in superseded {
            handle.cancel().await;
        }
        let _ = gate.send(());
        Ok(())
    }

    /// Send bytes to the connected peer.
    ///
    /// Returns once the bytes were handed to the transport.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> Result<(), LinkError> {
        let writer = self.shared.writer()?;
        let payload = bytes.into();
        if payload.is_empty() {
            return Ok(());
        }

        let (done, result) = oneshot::channel();
        writer
            .send(WriteRequest { payload, done })
            .await
            .map_err(|_| LinkError::NotConnected)?;
        result
            .await
            .map_err(|_| LinkError::StreamLost("stream closed before the write completed".into()))?
    }

    /// Cancel everything and release every stream. Terminal and idempotent.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        let handles = self.shared.begin_stop();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.cancel().await;
        }
        info!("[LINK] Connection manager stopped");
    }

    /// Current connection state
    pub fn current_state(&self) -> ConnectionState {
        self.shared.lock().fsm.state()
    }

    /// Identity of the connected peer, if any
    pub fn peer(&self) -> Option<PeerIdentity> {
        match &self.shared.lock().phase {
            Phase::Connected(pump) => Some(pump.peer.clone()),
            _ => None,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Handles signal cancellation as they drop
        drop(self.shared.begin_stop());
    }
}
