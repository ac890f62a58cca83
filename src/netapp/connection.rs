//! NetApp connection manager
//!
//! Owns the persistent dual-channel websocket connection to a deployed
//! NetApp: a control channel carrying correlated commands and results, and a
//! data channel carrying named payload events. Inbound events are dispatched
//! on transport-owned reader tasks to the typed handlers registered at
//! construction; outbound data goes through a bounded queue with a
//! configurable backpressure policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BackpressurePolicy, ConnectionConfig, RuntimeEndpoint};
use crate::error::{Error, Result};
use crate::netapp::protocol::{
    classify_control_event, CommandReply, CommandResult, ControlCommand, Envelope,
    CONTROL_CHANNEL, DATA_CHANNEL,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Interval between physical reconnect attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of the connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Registered => write!(f, "registered"),
        }
    }
}

// =============================================================================
// Event Handlers
// =============================================================================

/// Handler for a named data event
pub type DataHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Handler for connection lifecycle events
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;
/// Handler for connection errors
pub type ConnectErrorHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Typed registration of inbound event handlers.
///
/// Data events are dispatched by name; connection lifecycle events have
/// dedicated slots. Command results are routed internally to the pending
/// correlated call and are not registrable.
#[derive(Default, Clone)]
pub struct EventHandlers {
    on_connect: Option<LifecycleHandler>,
    on_disconnect: Option<LifecycleHandler>,
    on_connect_error: Option<ConnectErrorHandler>,
    data: HashMap<String, DataHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    pub fn on_connect_error(mut self, handler: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_connect_error = Some(Arc::new(handler));
        self
    }

    /// Register a handler for a named data-channel event
    pub fn on_data(
        mut self,
        event: impl Into<String>,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Self {
        self.data.insert(event.into(), Arc::new(handler));
        self
    }
}

// =============================================================================
// Session
// =============================================================================

/// State shared between the manager and the per-session I/O tasks
struct SessionShared {
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    handlers: Arc<EventHandlers>,
    /// Correlation slot for the single outstanding control command
    pending: Mutex<Option<oneshot::Sender<CommandReply>>>,
    closed: AtomicBool,
}

impl SessionShared {
    /// Tear the session down once, whichever side initiates it. Releases a
    /// blocked command caller and fires the disconnect handler. Returns
    /// whether this call performed the teardown.
    async fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        if let Some(reply_tx) = self.pending.lock().await.take() {
            let _ = reply_tx.send(CommandReply::Error("connection closed".into()));
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        if let Some(handler) = &self.handlers.on_disconnect {
            handler();
        }
        true
    }
}

/// One live dual-channel connection
struct Session {
    shared: Arc<SessionShared>,
    control_sink: Arc<Mutex<WsSink>>,
    data_tx: mpsc::Sender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Full teardown of the active session. Publishes Disconnected and fires
    /// the disconnect handler unless the remote already did.
    async fn shutdown(self) {
        self.shared.teardown().await;
        let _ = self.control_sink.lock().await.close().await;
        for task in self.tasks {
            task.abort();
        }
    }

    /// Drop a session that never became (or no longer is) the active one,
    /// without publishing state or firing handlers.
    async fn abort(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        let _ = self.control_sink.lock().await.close().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns at most one connection session at a time
pub struct ConnectionManager {
    config: ConnectionConfig,
    handlers: Arc<EventHandlers>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Serializes callers of `send_command`: results are correlated by
    /// channel, not per call, so only one command may be outstanding.
    command_gate: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, handlers: EventHandlers) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handlers: Arc::new(handlers),
            state_tx: Arc::new(state_tx),
            state_rx,
            session: Mutex::new(None),
            command_gate: Mutex::new(()),
        }
    }

    /// Snapshot of the session state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Open both channels to `endpoint`.
    ///
    /// Each physical attempt is bounded by the configured attempt timeout.
    /// When `wait_until_available` is set, failed attempts are retried once
    /// per second until `wait_timeout` elapses (absent or zero means retry
    /// indefinitely); otherwise the first failure is returned.
    pub async fn connect(
        &self,
        endpoint: &RuntimeEndpoint,
        wait_until_available: bool,
        wait_timeout: Option<Duration>,
    ) -> Result<()> {
        {
            let mut slot = self.session.lock().await;
            if let Some(existing) = slot.take() {
                if !existing.is_closed() {
                    *slot = Some(existing);
                    return Err(Error::ConnectFailed("already connected".into()));
                }
                // The remote tore this session down, clear the stale handle
                existing.abort().await;
            }
        }
        self.set_state(ConnectionState::Connecting);

        let deadline = wait_timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        let session = loop {
            match self.open_session(endpoint).await {
                Ok(session) => break session,
                Err(err) => {
                    let give_up = !wait_until_available
                        || deadline.is_some_and(|d| Instant::now() >= d);
                    if give_up {
                        self.set_state(ConnectionState::Disconnected);
                        if let Some(handler) = &self.handlers.on_connect_error {
                            handler(err.to_string());
                        }
                        return Err(err);
                    }
                    warn!("Failed to connect to network application, retrying in 1s: {err}");
                    sleep(RETRY_INTERVAL).await;
                }
            }
        };

        {
            let mut slot = self.session.lock().await;
            if slot.as_ref().is_some_and(|current| !current.is_closed()) {
                // A concurrent connect installed its session first
                session.abort().await;
                return Err(Error::ConnectFailed("already connected".into()));
            }
            if let Some(stale) = slot.take() {
                stale.abort().await;
            }
            *slot = Some(session);
        }
        self.set_state(ConnectionState::Connected);
        if let Some(handler) = &self.handlers.on_connect {
            handler();
        }
        info!("Connected to network application at {endpoint}");
        Ok(())
    }

    /// Perform the registration handshake: send an INIT control command and
    /// wait for its correlated result. Requires a connected session.
    pub async fn register(&self, init_data: Value) -> Result<()> {
        let result = self
            .send_command(ControlCommand::init(init_data))
            .await
            .map_err(|err| match err {
                Error::CommandTimeout(limit) => {
                    Error::InitializeFailed(format!("no result within {limit:?}"))
                }
                other => other,
            })?;
        if !result.success {
            return Err(Error::InitializeFailed(result.message));
        }
        self.set_state(ConnectionState::Registered);
        info!("Registered with the network application");
        Ok(())
    }

    /// Send a control command and wait for its correlated result or error.
    ///
    /// Calls are serialized; a command-error event surfaces as an
    /// unsuccessful result carrying the error message.
    pub async fn send_command(&self, command: ControlCommand) -> Result<CommandResult> {
        let _gate = self.command_gate.lock().await;

        let (control_sink, shared) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(Error::NotConnected)?;
            (session.control_sink.clone(), session.shared.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        *shared.pending.lock().await = Some(reply_tx);

        let frame = Envelope::command(&command)?.to_frame()?;
        debug!("Sending control command {}", command.cmd_type);
        if let Err(err) = control_sink.lock().await.send(Message::Text(frame)).await {
            shared.pending.lock().await.take();
            return Err(Error::Transport(format!(
                "control channel write failed: {err}"
            )));
        }

        match timeout(self.config.command_timeout, reply_rx).await {
            Ok(Ok(CommandReply::Result(result))) => Ok(result),
            Ok(Ok(CommandReply::Error(message))) => Ok(CommandResult {
                success: false,
                message,
            }),
            Ok(Err(_)) => Err(Error::Transport(
                "connection closed while waiting for command result".into(),
            )),
            Err(_) => {
                shared.pending.lock().await.take();
                Err(Error::CommandTimeout(self.config.command_timeout))
            }
        }
    }

    /// Push a payload on the data channel (fire and forget).
    ///
    /// Optional metadata is merged into the payload, payload keys winning on
    /// conflicts. With the `Block` policy the caller waits for queue
    /// capacity; with `Drop` a full queue fails immediately with
    /// `BackPressure`.
    pub async fn send_data(
        &self,
        event: impl Into<String>,
        payload: Value,
        metadata: Option<Value>,
    ) -> Result<()> {
        let data_tx = {
            let session = self.session.lock().await;
            session.as_ref().ok_or(Error::NotConnected)?.data_tx.clone()
        };
        let envelope = Envelope::new(event, merge_payload(payload, metadata));
        enqueue_data(&data_tx, envelope, self.config.backpressure).await
    }

    /// Close both channels. Idempotent; once this returns no further
    /// handler callbacks are invoked.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.shutdown().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from network application");
    }

    /// Wait until the session reaches Disconnected (remote close or a local
    /// `disconnect` call). Returns immediately when not connected.
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Disconnected {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    async fn open_session(&self, endpoint: &RuntimeEndpoint) -> Result<Session> {
        let control = self.open_channel(endpoint, CONTROL_CHANNEL).await?;
        let data = self.open_channel(endpoint, DATA_CHANNEL).await?;

        let (control_sink, control_source) = control.split();
        let (data_sink, data_source) = data.split();

        let shared = Arc::new(SessionShared {
            cancel: CancellationToken::new(),
            state_tx: self.state_tx.clone(),
            handlers: self.handlers.clone(),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let (data_tx, data_rx) = mpsc::channel(self.config.data_queue_capacity);

        let tasks = vec![
            tokio::spawn(control_reader(control_source, shared.clone())),
            tokio::spawn(data_reader(data_source, shared.clone())),
            tokio::spawn(data_writer(data_sink, data_rx, shared.clone())),
        ];

        Ok(Session {
            shared,
            control_sink: Arc::new(Mutex::new(control_sink)),
            data_tx,
            tasks,
        })
    }

    async fn open_channel(&self, endpoint: &RuntimeEndpoint, path: &str) -> Result<WsStream> {
        let uri = endpoint.build_channel_uri(path);
        let (stream, _) = timeout(self.config.attempt_timeout, connect_async(uri.as_str()))
            .await
            .map_err(|_| Error::ConnectFailed(format!("connect attempt to {uri} timed out")))?
            .map_err(|e| Error::ConnectFailed(format!("{uri}: {e}")))?;
        Ok(stream)
    }
}

// =============================================================================
// Outbound Queue
// =============================================================================

/// Merge optional metadata into an outbound payload. Payload keys win on
/// conflicts; non-object values are nested instead of merged.
fn merge_payload(payload: Value, metadata: Option<Value>) -> Value {
    let Some(metadata) = metadata else {
        return payload;
    };
    match (payload, metadata) {
        (Value::Object(mut payload), Value::Object(metadata)) => {
            for (key, value) in metadata {
                payload.entry(key).or_insert(value);
            }
            Value::Object(payload)
        }
        (payload, metadata) => json!({"data": payload, "metadata": metadata}),
    }
}

async fn enqueue_data(
    data_tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
    policy: BackpressurePolicy,
) -> Result<()> {
    match policy {
        BackpressurePolicy::Block => data_tx
            .send(envelope)
            .await
            .map_err(|_| Error::Transport("data channel closed".into())),
        BackpressurePolicy::Drop => data_tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::BackPressure,
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport("data channel closed".into())
            }
        }),
    }
}

// =============================================================================
// I/O Tasks
// =============================================================================

/// Reads the control channel and routes correlated replies to the pending
/// command slot. Unroutable or malformed events are logged and dropped.
async fn control_reader(mut source: WsSource, shared: Arc<SessionShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            message = source.next() => match message {
                Some(Ok(Message::Text(frame))) => {
                    let Some(envelope) = Envelope::parse_frame(&frame) else {
                        warn!("Dropping malformed control frame");
                        continue;
                    };
                    match classify_control_event(&envelope) {
                        Some(reply) => match shared.pending.lock().await.take() {
                            Some(reply_tx) => {
                                let _ = reply_tx.send(reply);
                            }
                            None => warn!(
                                "Dropping uncorrelated control reply {:?}",
                                envelope.event
                            ),
                        },
                        None => warn!("Dropping unroutable control event {:?}", envelope.event),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Control channel closed by remote");
                    shared.teardown().await;
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!("Control channel read failed: {err}");
                    shared.teardown().await;
                    break;
                }
            }
        }
    }
}

/// Reads the data channel and dispatches named events to their registered
/// handlers.
async fn data_reader(mut source: WsSource, shared: Arc<SessionShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            message = source.next() => match message {
                Some(Ok(Message::Text(frame))) => {
                    let Some(envelope) = Envelope::parse_frame(&frame) else {
                        warn!("Dropping malformed data frame");
                        continue;
                    };
                    match shared.handlers.data.get(&envelope.event) {
                        Some(handler) => handler(envelope.data),
                        None => warn!(
                            "Dropping data event {:?} with no registered handler",
                            envelope.event
                        ),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Data channel closed by remote");
                    shared.teardown().await;
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!("Data channel read failed: {err}");
                    shared.teardown().await;
                    break;
                }
            }
        }
    }
}

/// Drains the outbound queue into the data channel, serializing physical
/// writes.
async fn data_writer(
    mut sink: WsSink,
    mut data_rx: mpsc::Receiver<Envelope>,
    shared: Arc<SessionShared>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            envelope = data_rx.recv() => match envelope {
                Some(envelope) => {
                    let frame = match envelope.to_frame() {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!("Dropping unencodable data payload: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        error!("Data channel write failed: {err}");
                        shared.teardown().await;
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.close().await;
}
