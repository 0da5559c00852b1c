//! The command channel: request/response semantics over a [`Transport`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::correlation::{CorrelationId, CorrelationTable};
use super::error::{ChannelError, ChannelResult};
use super::events::{ChannelEvent, EventKind, EventMultiplexer, Listener};
use super::lifecycle::LifecycleState;
use super::protocol::{
    ChannelStatus, CommandEnvelope, CommandKind, ImagePayload, InitOptions, InitReport, LogLevel,
    LogRecord, ProcessImageParams, ProcessOptions, ProcessRegionParams, Region, WorkerMessage,
};
use super::transport::{InboundSink, Transport, TransportSpawner};

/// Default timeout for commands (30 seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the best-effort DISPOSE sent during teardown.
const DEFAULT_DISPOSE_TIMEOUT_SECS: u64 = 5;

/// Timeout budgets for commands.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Budget for any command without an override.
    pub request_timeout: Duration,
    /// Per-command overrides.
    pub timeouts: HashMap<CommandKind, Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            timeouts: HashMap::from([(
                CommandKind::Dispose,
                Duration::from_secs(DEFAULT_DISPOSE_TIMEOUT_SECS),
            )]),
        }
    }
}

impl ChannelConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, kind: CommandKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    /// Budget for `kind`.
    pub fn timeout_for(&self, kind: CommandKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.request_timeout)
    }
}

type Bootstrap = Shared<BoxFuture<'static, ChannelResult<ChannelStatus>>>;
type Teardown = Shared<BoxFuture<'static, ()>>;

/// Mutable per-session state. Only touched under the session lock, and the
/// lock is never held across an await on the worker.
struct Session {
    state: LifecycleState,
    /// Bumped by every bootstrap and every dispose; work that resumes after an
    /// await checks it to find out whether its session is still current.
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    dispatcher: Option<JoinHandle<()>>,
    bootstrap: Option<Bootstrap>,
    /// In-flight dispose, joined by concurrent `dispose` calls.
    teardown: Option<Teardown>,
    /// Generation whose worker has already been declared dead.
    faulted: Option<u64>,
    status: ChannelStatus,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            generation: 0,
            transport: None,
            dispatcher: None,
            bootstrap: None,
            teardown: None,
            faulted: None,
            status: ChannelStatus::default(),
        }
    }
}

struct ChannelInner {
    config: ChannelConfig,
    spawner: Arc<dyn TransportSpawner>,
    /// Last correlation id handed out. Never reset, even across sessions.
    last_id: AtomicU64,
    table: CorrelationTable,
    events: EventMultiplexer,
    session: Mutex<Session>,
}

/// Controller-side handle to an OCR worker.
///
/// Cloning is cheap; clones share the same worker, correlation table and
/// subscriptions.
///
/// # Example
///
/// ```ignore
/// use ocr_bridge::channel::{CommandChannel, ImagePayload, InitOptions, ProcessOptions, ProcessSpawner};
///
/// let channel = CommandChannel::new(ProcessSpawner::new("./ocr-worker"));
/// channel.initialize(InitOptions::default()).await?;
/// channel.load_resources(None).await?;
///
/// let image = ImagePayload::encoded("image/png", std::fs::read("scan.png")?);
/// let text = channel.process(image, ProcessOptions::new()).await?;
///
/// channel.dispose().await;
/// ```
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<ChannelInner>,
}

impl CommandChannel {
    /// Create a channel with default timeouts. No worker is started until
    /// [`initialize`](Self::initialize).
    pub fn new<S>(spawner: S) -> Self
    where
        S: TransportSpawner + 'static,
    {
        Self::with_config(spawner, ChannelConfig::default())
    }

    pub fn with_config<S>(spawner: S, config: ChannelConfig) -> Self
    where
        S: TransportSpawner + 'static,
    {
        Self {
            inner: Arc::new(ChannelInner {
                config,
                spawner: Arc::new(spawner),
                last_id: AtomicU64::new(0),
                table: CorrelationTable::new(),
                events: EventMultiplexer::new(),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Start the worker and send INIT.
    ///
    /// Calls made while a bootstrap is in flight join it and observe the same
    /// outcome. On failure the channel returns to `Uninitialized` and may be
    /// initialized again; nothing is retried automatically.
    pub async fn initialize(&self, options: InitOptions) -> ChannelResult<ChannelStatus> {
        let bootstrap = {
            let mut session = self.inner.session.lock().await;
            match session.state {
                LifecycleState::Ready => return Ok(session.status.clone()),
                LifecycleState::Initializing => match &session.bootstrap {
                    Some(bootstrap) => bootstrap.clone(),
                    None => return Err(ChannelError::NotInitialized),
                },
                state if state.can_bootstrap() => {
                    session.generation += 1;
                    session.state = LifecycleState::Initializing;
                    session.status = ChannelStatus::default();

                    let generation = session.generation;
                    tracing::info!(generation, "initializing command channel");
                    let bootstrap = ChannelInner::bootstrap(self.inner.clone(), generation, options)
                        .boxed()
                        .shared();
                    session.bootstrap = Some(bootstrap.clone());
                    bootstrap
                }
                state => return Err(state.rejection()),
            }
        };

        bootstrap.await
    }

    /// Ask the worker to load its models. `on_progress` receives progress
    /// only while this command is outstanding; it never sees progress that
    /// arrives after the outcome.
    pub async fn load_resources(&self, on_progress: Option<Listener>) -> ChannelResult<Value> {
        let output = self
            .inner
            .command(CommandKind::LoadModels, Value::Null, on_progress)
            .await?;

        let mut session = self.inner.session.lock().await;
        if session.state.accepts_commands() {
            session.status.models_loaded = true;
        }
        Ok(output)
    }

    /// Run OCR over a whole image.
    pub async fn process(&self, image: ImagePayload, options: ProcessOptions) -> ChannelResult<Value> {
        let on_progress = options.on_progress.clone();
        let data = to_params(&ProcessImageParams { image, options })?;
        self.inner
            .command(CommandKind::ProcessImage, data, on_progress)
            .await
    }

    /// Run OCR over one region of an image.
    pub async fn process_region(
        &self,
        image: ImagePayload,
        region: Region,
        options: ProcessOptions,
    ) -> ChannelResult<Value> {
        let on_progress = options.on_progress.clone();
        let data = to_params(&ProcessRegionParams {
            image,
            region,
            options,
        })?;
        self.inner
            .command(CommandKind::ProcessRegion, data, on_progress)
            .await
    }

    /// Same as [`process`](Self::process), deserializing the result.
    pub async fn process_as<R>(&self, image: ImagePayload, options: ProcessOptions) -> ChannelResult<R>
    where
        R: DeserializeOwned,
    {
        let output = self.process(image, options).await?;
        serde_json::from_value(output).map_err(ChannelError::from)
    }

    /// Query the worker's status.
    ///
    /// Never fails: without a ready worker this is `{initialized: false}`
    /// and the transport is not touched; a failed round trip is reported in
    /// [`ChannelStatus::error`].
    pub async fn get_status(&self) -> ChannelStatus {
        if !self.state().await.accepts_commands() {
            return ChannelStatus::default();
        }

        let status = self
            .inner
            .command(CommandKind::GetStatus, Value::Null, None)
            .await
            .and_then(|data| serde_json::from_value::<ChannelStatus>(data).map_err(ChannelError::from));

        match status {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(error = %err, "status query failed");
                ChannelStatus::unavailable(err.to_string())
            }
        }
    }

    /// Tear the channel down.
    ///
    /// A ready worker is sent a best-effort DISPOSE first; its failure is
    /// logged, not returned. The transport is then terminated, every pending
    /// command fails with [`ChannelError::Disposed`] and every subscription is
    /// dropped. Concurrent calls wait for the same teardown, and calling this
    /// again afterwards is a no-op.
    ///
    /// The teardown runs on its own task: dropping this future does not
    /// leave the channel half disposed.
    pub async fn dispose(&self) {
        let teardown = {
            let mut session = self.inner.session.lock().await;
            if let Some(teardown) = session.teardown.clone() {
                teardown
            } else {
                let was_ready = session.state == LifecycleState::Ready;
                session.state = LifecycleState::Disposing;
                session.generation += 1;
                session.bootstrap = None;

                let task = tokio::spawn(ChannelInner::teardown(
                    self.inner.clone(),
                    session.transport.take(),
                    session.dispatcher.take(),
                    was_ready,
                ));
                let teardown = task
                    .map(|joined| {
                        if let Err(err) = joined {
                            tracing::error!(error = %err, "channel teardown task failed");
                        }
                    })
                    .boxed()
                    .shared();
                session.teardown = Some(teardown.clone());
                teardown
            }
        };

        teardown.await
    }

    /// Subscribe to out-of-band notifications for the life of the channel
    /// (or until [`off`](Self::off) / [`dispose`](Self::dispose)).
    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.inner.events.on(kind, listener);
    }

    /// Unsubscribe. Returns whether the listener was subscribed.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.inner.events.off(kind, listener)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.session.lock().await.state
    }

    /// Status cached from the last INIT / LOAD_MODELS, without a round trip.
    pub async fn cached_status(&self) -> ChannelStatus {
        self.inner.session.lock().await.status.clone()
    }

    /// Number of commands awaiting a terminal response.
    pub async fn pending_count(&self) -> usize {
        self.inner.table.len().await
    }

    /// Number of listeners subscribed to `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Send an arbitrary command once the channel is ready and deserialize
    /// the worker's answer.
    pub async fn request<P, R>(&self, kind: CommandKind, params: P) -> ChannelResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let data = to_params(&params)?;
        let output = self.inner.command(kind, data, None).await?;
        serde_json::from_value(output).map_err(ChannelError::from)
    }
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("config", &self.inner.config)
            .field("last_id", &self.inner.last_id.load(Ordering::Relaxed))
            .field("events", &self.inner.events)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    /// The single underlying bootstrap shared by every joined `initialize`.
    async fn bootstrap(
        inner: Arc<ChannelInner>,
        generation: u64,
        options: InitOptions,
    ) -> ChannelResult<ChannelStatus> {
        let outcome = inner.start_session(generation, options).await;

        let mut session = inner.session.lock().await;
        if session.generation != generation {
            // Disposed while bootstrapping; teardown already happened.
            return Err(outcome.err().unwrap_or(ChannelError::Disposed));
        }
        session.bootstrap = None;

        match outcome {
            Ok(status) => {
                session.state = LifecycleState::Ready;
                session.status = status.clone();
                tracing::info!(backend = ?status.backend, fallback = status.using_fallback, "command channel ready");
                Ok(status)
            }
            Err(err) => {
                session.state = LifecycleState::Uninitialized;
                let transport = session.transport.take();
                if let Some(dispatcher) = session.dispatcher.take() {
                    dispatcher.abort();
                }
                drop(session);

                if let Some(transport) = transport {
                    transport.terminate().await;
                }
                tracing::warn!(error = %err, "command channel failed to initialize");
                Err(err)
            }
        }
    }

    async fn teardown(
        inner: Arc<ChannelInner>,
        transport: Option<Arc<dyn Transport>>,
        dispatcher: Option<JoinHandle<()>>,
        was_ready: bool,
    ) {
        if let Some(transport) = &transport {
            if was_ready {
                if let Err(err) = inner
                    .dispatch(transport, CommandKind::Dispose, Value::Null, None)
                    .await
                {
                    tracing::warn!(error = %err, "worker did not acknowledge DISPOSE");
                }
            }
            transport.terminate().await;
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        let failed = inner.table.fail_all(ChannelError::Disposed).await;
        inner.events.clear();

        let mut session = inner.session.lock().await;
        session.state = LifecycleState::Disposed;
        session.status = ChannelStatus::default();
        session.teardown = None;
        tracing::info!(failed, "command channel disposed");
    }

    async fn start_session(
        self: &Arc<Self>,
        generation: u64,
        options: InitOptions,
    ) -> ChannelResult<ChannelStatus> {
        let (sink, inbound) = InboundSink::channel();
        let transport: Arc<dyn Transport> = Arc::from(self.spawner.spawn(sink).await?);

        {
            let mut session = self.session.lock().await;
            if session.generation != generation {
                drop(session);
                transport.terminate().await;
                return Err(ChannelError::Disposed);
            }
            session.transport = Some(transport.clone());
            session.dispatcher = Some(spawn_dispatcher(Arc::downgrade(self), generation, inbound));
        }

        let params = to_params(&options)?;
        let data = self
            .dispatch(&transport, CommandKind::Init, params, None)
            .await?;
        let report = if data.is_null() {
            InitReport::default()
        } else {
            serde_json::from_value(data)?
        };
        Ok(ChannelStatus::from_init(report))
    }

    /// Send a command on the current session, which must be ready.
    async fn command(
        &self,
        kind: CommandKind,
        data: Value,
        on_progress: Option<Listener>,
    ) -> ChannelResult<Value> {
        let transport = {
            let session = self.session.lock().await;
            if !session.state.accepts_commands() {
                return Err(session.state.rejection());
            }
            session
                .transport
                .clone()
                .ok_or(ChannelError::NotInitialized)?
        };
        self.dispatch(&transport, kind, data, on_progress).await
    }

    /// Allocate an id, register it, send, and wait for the terminal outcome.
    async fn dispatch(
        &self,
        transport: &Arc<dyn Transport>,
        kind: CommandKind,
        data: Value,
        on_progress: Option<Listener>,
    ) -> ChannelResult<Value> {
        let id = self.next_id();
        let timeout = self.config.timeout_for(kind);
        let completion = self.table.register(id, kind, timeout, on_progress).await;
        let mut guard = AbandonGuard::new(&self.table, id);

        tracing::debug!(id, command = %kind, ?timeout, "sending command");
        let envelope = CommandEnvelope { kind, data, id };
        if let Err(err) = transport.send(&envelope).await {
            // Settle our own entry so its timer does not outlive the call.
            self.table.settle(id, Err(err.clone())).await;
            guard.disarm();
            return Err(err);
        }

        let outcome = completion.await;
        guard.disarm();
        outcome?
    }

    fn next_id(&self) -> CorrelationId {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Demultiplex one worker message from the session `generation`.
    async fn route(&self, generation: u64, message: WorkerMessage) {
        tracing::trace!(id = ?message.id(), terminal = message.is_terminal(), "worker message");
        match message {
            WorkerMessage::Success { id, data } => match self.table.take(id).await {
                Some(pending) => {
                    tracing::debug!(id, command = %pending.kind(), elapsed = ?pending.elapsed(), "command succeeded");
                    pending.resolve(Ok(data));
                }
                None => tracing::debug!(id, "ignoring SUCCESS for unknown command"),
            },
            WorkerMessage::Error { id, error } => match self.table.take(id).await {
                Some(pending) => {
                    tracing::debug!(id, command = %pending.kind(), %error, "command failed");
                    let kind = pending.kind();
                    pending.resolve(Err(ChannelError::command_failed(kind, error)));
                }
                None => tracing::debug!(id, "ignoring ERROR for unknown command"),
            },
            WorkerMessage::Progress { id, data } => {
                // Only callers whose command is still outstanding see it.
                let scoped = self.table.progress_listeners().await;
                self.events
                    .emit_with(&ChannelEvent::Progress { id, update: data }, scoped);
            }
            WorkerMessage::Log { data } => {
                forward_log(&data);
                self.events.emit(&ChannelEvent::Log(data));
            }
            WorkerMessage::WorkerError { error } => {
                if self.mark_faulted(generation).await {
                    self.fail_worker(ChannelError::WorkerFatal(error)).await;
                }
            }
        }
    }

    /// Invalidate every in-flight command and tell `error` subscribers.
    async fn fail_worker(&self, fault: ChannelError) {
        let failed = self.table.fail_all(fault.clone()).await;
        tracing::error!(error = %fault, failed, "worker context failed");
        self.events.emit(&ChannelEvent::Error(fault));
    }

    /// Record that the worker of `generation` is dead. Returns `false` if
    /// that was already known, so the failure is reported once.
    async fn mark_faulted(&self, generation: u64) -> bool {
        let mut session = self.session.lock().await;
        if session.faulted == Some(generation) {
            return false;
        }
        session.faulted = Some(generation);
        true
    }

    /// The transport stopped delivering messages.
    async fn transport_closed(&self, generation: u64) {
        {
            let session = self.session.lock().await;
            if session.generation != generation || !session.state.is_live() {
                return;
            }
        }
        if !self.mark_faulted(generation).await {
            tracing::debug!(generation, "worker transport closed after fatal error");
            return;
        }
        self.fail_worker(ChannelError::WorkerFatal(
            "worker transport closed".to_string(),
        ))
        .await;
    }
}

/// Route inbound messages until the transport hangs up or the channel is
/// dropped. Holds only a weak reference so an abandoned channel can be freed.
fn spawn_dispatcher(
    inner: Weak<ChannelInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.route(generation, message).await;
        }
        if let Some(inner) = inner.upgrade() {
            inner.transport_closed(generation).await;
        }
    })
}

/// Re-emit a worker log record through `tracing`.
fn forward_log(record: &LogRecord) {
    let message = record.message.as_str();
    let timestamp = record.timestamp;
    match record.level {
        LogLevel::Trace => tracing::trace!(target: "ocr_bridge::worker", ?timestamp, "{message}"),
        LogLevel::Debug => tracing::debug!(target: "ocr_bridge::worker", ?timestamp, "{message}"),
        LogLevel::Info => tracing::info!(target: "ocr_bridge::worker", ?timestamp, "{message}"),
        LogLevel::Warn => tracing::warn!(target: "ocr_bridge::worker", ?timestamp, "{message}"),
        LogLevel::Error => tracing::error!(target: "ocr_bridge::worker", ?timestamp, "{message}"),
    }
}

/// Removes a command's entry if its caller stops waiting before the
/// outcome arrives, so an abandoned call neither holds a slot until its
/// timeout nor keeps receiving progress.
struct AbandonGuard<'a> {
    table: &'a CorrelationTable,
    id: CorrelationId,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(table: &'a CorrelationTable, id: CorrelationId) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = self.table.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if table.settle(id, Err(ChannelError::ChannelClosed)).await {
                    tracing::debug!(id, "dropped abandoned command");
                }
            });
        }
    }
}

fn to_params<P: Serialize>(params: &P) -> ChannelResult<Value> {
    serde_json::to_value(params).map_err(|e| ChannelError::SerializeFailed(e.to_string()))
}
