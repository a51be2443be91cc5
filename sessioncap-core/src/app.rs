//! The session orchestrator.
//!
//! [`App`] owns the activity state machine and composes negotiation, the
//! commit pipeline, the transport channel and fault isolation into one
//! handle. It is cheap to clone; all clones drive the same session.
//!
//! ## Lifecycle
//!
//! ```text
//! NotActive --start--> Starting --negotiated--> Active
//!     ^                    |                       |
//!     +------ stop / failed negotiation -----------+
//! ```
//!
//! Every `stop` bumps an epoch. A `start` that resumes after an await and
//! finds a newer epoch gives up with [`Error::Interrupted`] instead of
//! overwriting whatever the concurrent stop or restart produced.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{StorageKeys, TrackerConfig};
use crate::diagnostics::{DiagnosticSink, Diagnostics};
use crate::error::{Error, Result};
use crate::events::{Event, EventTarget, Listener, ListenerRegistration};
use crate::host::{Clock, DeviceHints, Document, HostDocument, SystemClock};
use crate::message::{Batch, Message};
use crate::negotiator::{Negotiator, StartContext};
use crate::observer::{NoopObserver, Observer};
use crate::pipeline::{MessageBuffer, Ticker};
use crate::safe::{self, CallbackResult};
use crate::session::{OnStartHook, OnStartInfo, SessionIdentity, SessionInfo, StartOptions};
use crate::storage::{MemoryStorage, PersistedState, Storage};
use crate::transport::{ControlMessage, Transport, TransportChannel, WorkerSignal};
use crate::version;
use crate::worker::{HttpWorker, WorkerConfig};

/// Version reported to the ingest service and checked by plugins.
pub const TRACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the orchestrator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    NotActive,
    Starting,
    Active,
}

type Callback = Arc<dyn Fn() -> CallbackResult + Send + Sync>;
type CommitCallback = Arc<dyn Fn(&Batch) -> CallbackResult + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    start: Vec<Callback>,
    stop: Vec<Callback>,
    commit: Vec<CommitCallback>,
}

struct State {
    activity: ActivityState,
    epoch: u64,
    /// Thread arming start callbacks and producers outside the lock
    arming: Option<ThreadId>,
    /// `stop` re-entered from the arming thread; run it once arming is done
    stop_requested: bool,
    /// Teardown in progress
    stopping: bool,
    identity: SessionIdentity,
    buffer: MessageBuffer,
    channel: Option<TransportChannel>,
}

struct Inner {
    project_key: String,
    config: TrackerConfig,
    tracker_version: String,
    hints: DeviceHints,
    persisted: PersistedState,
    negotiator: Negotiator,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    document: Arc<dyn Document>,
    diagnostics: Arc<dyn DiagnosticSink>,
    observer: Arc<dyn Observer>,
    on_start: Option<OnStartHook>,
    state: Mutex<State>,
    /// Signalled when arming finishes
    armed: Condvar,
    callbacks: Mutex<Callbacks>,
    ticker: Mutex<Ticker>,
}

/// Handle to a session orchestrator.
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

/// Non-owning handle, for collaborators the orchestrator itself holds.
#[derive(Clone)]
pub struct WeakApp {
    inner: Weak<Inner>,
}

impl WeakApp {
    pub fn upgrade(&self) -> Option<App> {
        self.inner.upgrade().map(|inner| App { inner })
    }
}

/// Builder for [`App`].
pub struct AppBuilder {
    project_key: String,
    config: TrackerConfig,
    storage_keys: StorageKeys,
    session_token: Option<String>,
    tracker_version: String,
    hints: DeviceHints,
    transport: Option<Arc<dyn Transport>>,
    spawn_http_worker: bool,
    clock: Arc<dyn Clock>,
    document: Arc<dyn Document>,
    session_storage: Option<Arc<dyn Storage>>,
    durable_storage: Option<Arc<dyn Storage>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    observer: Arc<dyn Observer>,
    window_events: Option<Arc<dyn EventTarget>>,
    document_events: Option<Arc<dyn EventTarget>>,
    on_start: Option<OnStartHook>,
}

impl AppBuilder {
    fn new(project_key: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            project_key: project_key.into(),
            config,
            storage_keys: StorageKeys::default(),
            session_token: None,
            tracker_version: TRACKER_VERSION.to_string(),
            hints: DeviceHints::default(),
            transport: None,
            spawn_http_worker: false,
            clock: Arc::new(SystemClock),
            document: Arc::new(HostDocument::new()),
            session_storage: None,
            durable_storage: None,
            diagnostics: None,
            observer: Arc::new(NoopObserver),
            window_events: None,
            document_events: None,
            on_start: None,
        }
    }

    /// Token of a session to continue, stored before the first start.
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = keys;
        self
    }

    pub fn tracker_version(mut self, version: impl Into<String>) -> Self {
        self.tracker_version = version.into();
        self
    }

    pub fn device_hints(mut self, hints: DeviceHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self.spawn_http_worker = false;
        self
    }

    /// Spawn an [`HttpWorker`] at build time. Requires a tokio runtime.
    pub fn http_worker(mut self) -> Self {
        self.transport = None;
        self.spawn_http_worker = true;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn document(mut self, document: Arc<dyn Document>) -> Self {
        self.document = document;
        self
    }

    pub fn session_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    pub fn durable_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.durable_storage = Some(storage);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Targets for the unload-type events that trigger a worker heartbeat.
    pub fn host_events(
        mut self,
        window: Arc<dyn EventTarget>,
        document: Arc<dyn EventTarget>,
    ) -> Self {
        self.window_events = Some(window);
        self.document_events = Some(document);
        self
    }

    pub fn on_start(mut self, hook: OnStartHook) -> Self {
        self.on_start = Some(hook);
        self
    }

    pub fn build(self) -> Result<App> {
        let mut config = self.config;
        config.project_key = self.project_key.clone();
        config.validate()?;

        let diagnostics: Arc<dyn DiagnosticSink> = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(Diagnostics::new(config.debug_report_endpoint.clone())));

        let persisted = PersistedState::new(
            self.storage_keys,
            self.session_storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            self.durable_storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
        );
        if let Some(token) = &self.session_token {
            persisted.set_token(token)?;
        }

        let negotiator = Negotiator::new(&config.ingest_point, NEGOTIATION_TIMEOUT)?;

        let transport = if self.spawn_http_worker {
            let worker_config = WorkerConfig {
                flush_interval: config.worker_flush_interval(),
                ..Default::default()
            };
            match HttpWorker::spawn(worker_config) {
                Ok(worker) => Some(Arc::new(worker) as Arc<dyn Transport>),
                Err(e) => {
                    diagnostics.report("worker_start", &e.to_string());
                    None
                }
            }
        } else {
            self.transport
        };

        let signals = transport.as_ref().and_then(|t| t.take_signals());

        let state = State {
            activity: ActivityState::NotActive,
            epoch: 0,
            arming: None,
            stop_requested: false,
            stopping: false,
            identity: SessionIdentity::default(),
            buffer: MessageBuffer::new(),
            channel: transport.clone().map(TransportChannel::new),
        };

        let app = App {
            inner: Arc::new(Inner {
                project_key: self.project_key,
                config,
                tracker_version: self.tracker_version,
                hints: self.hints,
                persisted,
                negotiator,
                transport,
                clock: self.clock,
                document: self.document,
                diagnostics,
                observer: self.observer,
                on_start: self.on_start,
                state: Mutex::new(state),
                armed: Condvar::new(),
                callbacks: Mutex::new(Callbacks::default()),
                ticker: Mutex::new(Ticker::new()),
            }),
        };

        if let Some(signals) = signals {
            app.spawn_signal_loop(signals);
        }
        if let (Some(window), Some(document)) = (self.window_events, self.document_events) {
            app.attach_heartbeat_listeners(window, document);
        }

        Ok(app)
    }
}

impl App {
    pub fn builder(project_key: impl Into<String>, config: TrackerConfig) -> AppBuilder {
        AppBuilder::new(project_key, config)
    }

    pub fn downgrade(&self) -> WeakApp {
        WeakApp {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Ticker> {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, message: &str) {
        if self.inner.config.verbose {
            tracing::info!(project_key = %self.inner.project_key, "{}", message);
        } else {
            tracing::debug!(project_key = %self.inner.project_key, "{}", message);
        }
    }

    // ============================================
    // Message commit pipeline
    // ============================================

    /// Queue a message for the next commit.
    ///
    /// Dropped unless a session is active. `urgent` commits immediately.
    pub fn send(&self, message: Message, urgent: bool) {
        {
            let mut state = self.lock_state();
            if state.activity != ActivityState::Active || state.stopping {
                return;
            }
            state.buffer.push(message);
        }
        if urgent {
            self.commit();
        }
    }

    /// Hand every buffered message to the transport as one batch.
    pub fn commit(&self) {
        let (batch, posted) = {
            let mut state = self.lock_state();
            if state.buffer.is_empty() {
                return;
            }
            let Some(channel) = state.channel.as_mut() else {
                return;
            };
            if !channel.is_ready() {
                return;
            }
            let timestamp = self.inner.clock.now_ms();
            let Some(batch) = state.buffer.take_batch(timestamp) else {
                return;
            };
            let posted = match state.channel.as_mut() {
                Some(channel) => channel.post_batch(batch.clone()),
                None => Ok(()),
            };
            (batch, posted)
        };

        // Sinks may call back into the app.
        if let Err(e) = posted {
            self.inner.diagnostics.report("commit", &e.to_string());
        }

        let callbacks = self.lock_callbacks().commit.clone();
        for cb in callbacks {
            safe::guard(self.inner.diagnostics.as_ref(), "commit_callback", || cb(&batch));
        }
    }

    /// Number of messages waiting for the next commit.
    pub fn pending_count(&self) -> usize {
        self.lock_state().buffer.len()
    }

    // ============================================
    // Callback registries
    // ============================================

    pub fn attach_start_callback<F>(&self, cb: F)
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.lock_callbacks().start.push(Arc::new(cb));
    }

    pub fn attach_stop_callback<F>(&self, cb: F)
    where
        F: Fn() -> CallbackResult + Send + Sync + 'static,
    {
        self.lock_callbacks().stop.push(Arc::new(cb));
    }

    pub fn attach_commit_callback<F>(&self, cb: F)
    where
        F: Fn(&Batch) -> CallbackResult + Send + Sync + 'static,
    {
        self.lock_callbacks().commit.push(Arc::new(cb));
    }

    /// Wrap `f` so a failure is reported instead of propagated.
    pub fn safe<A, F>(&self, f: F) -> impl Fn(A) -> CallbackResult + Send + Sync
    where
        F: Fn(A) -> CallbackResult + Send + Sync,
    {
        safe::safe(self.inner.diagnostics.clone(), f)
    }

    /// [`App::safe`] for event listeners.
    pub fn safe_listener(&self, listener: Listener) -> Listener {
        let sink = self.inner.diagnostics.clone();
        Arc::new(move |event: &Event| -> CallbackResult {
            safe::guard(sink.as_ref(), safe::SAFE_FN_CONTEXT, || listener(event));
            Ok(())
        })
    }

    /// Add `listener` to `target` on every start and remove it on every stop.
    pub fn attach_event_listener(
        &self,
        target: Arc<dyn EventTarget>,
        event_type: &str,
        listener: Listener,
        use_safe: bool,
        use_capture: bool,
    ) {
        let listener = if use_safe {
            self.safe_listener(listener)
        } else {
            listener
        };
        let registration = ListenerRegistration::new(target, event_type, listener, use_capture);

        let on_start = registration.clone();
        self.attach_start_callback(move || {
            on_start.attach();
            Ok(())
        });
        self.attach_stop_callback(move || {
            registration.detach();
            Ok(())
        });
    }

    fn attach_heartbeat_listeners(
        &self,
        window: Arc<dyn EventTarget>,
        document: Arc<dyn EventTarget>,
    ) {
        let Some(transport) = self.inner.transport.clone() else {
            return;
        };
        let heartbeat: Listener = Arc::new(move |_event: &Event| -> CallbackResult {
            transport
                .post_control(ControlMessage::Heartbeat)
                .map_err(Into::into)
        });
        self.attach_event_listener(window, "beforeunload", heartbeat.clone(), false, true);
        self.attach_event_listener(document.clone(), "mouseleave", heartbeat.clone(), false, false);
        self.attach_event_listener(document, "visibilitychange", heartbeat, false, true);
    }

    fn run_callbacks(&self, callbacks: Vec<Callback>, context: &str) {
        for cb in callbacks {
            safe::guard(self.inner.diagnostics.as_ref(), context, || cb());
        }
    }

    // ============================================
    // Activity state machine
    // ============================================

    /// Negotiate a session and start recording.
    ///
    /// Waits for the document to become visible first.
    pub async fn start(&self, options: StartOptions) -> Result<OnStartInfo> {
        let epoch = {
            let mut state = self.lock_state();
            if state.channel.is_none() {
                return Err(Error::NoTransport);
            }
            if state.activity != ActivityState::NotActive {
                return Err(Error::AlreadyStarted);
            }
            state.activity = ActivityState::Starting;
            state.epoch
        };

        let mut hidden = self.inner.document.hidden();
        let is_hidden = *hidden.borrow_and_update();
        if is_hidden {
            tracing::debug!("Document hidden, deferring start until visible");
            let visible = hidden.wait_for(|h| !*h).await.is_ok();
            if !visible {
                tracing::debug!("Document visibility source closed, starting anyway");
            }
        }

        match self.run_start(epoch, options).await {
            Ok(info) => Ok(info),
            Err(e) => Err(self.fail_start(e)),
        }
    }

    async fn run_start(&self, epoch: u64, options: StartOptions) -> Result<OnStartInfo> {
        let negotiation = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.activity != ActivityState::Starting {
                return Err(Error::Interrupted);
            }
            state.identity.user_id = options.user_id.clone();
            state.identity.metadata = options.metadata.clone();

            let config = &self.inner.config;
            let ctx = StartContext {
                project_key: &self.inner.project_key,
                rev_id: &config.rev_id,
                tracker_version: &self.inner.tracker_version,
                user_id: options.user_id.as_deref(),
                is_snippet: config.is_snippet,
                timestamp: self.inner.clock.now_ms(),
                force_new: options.force_new,
                hints: self.inner.hints,
                conn_attempt_count: config.conn_attempt_count,
                conn_attempt_gap: config.conn_attempt_gap(),
            };
            let negotiation = self.inner.negotiator.prepare(&self.inner.persisted, &ctx)?;
            state
                .channel
                .as_mut()
                .ok_or(Error::NoTransport)?
                .init(negotiation.init.clone())?;
            negotiation
        };

        let result = self
            .inner
            .negotiator
            .request_start(&negotiation.request)
            .await;

        let (info, metadata) = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.activity != ActivityState::Starting {
                return Err(Error::Interrupted);
            }
            let response = result?;
            Negotiator::persist(&self.inner.persisted, &response)?;

            if let Some(session_id) = &response.session_id {
                state.identity.session_id = Some(session_id.clone());
            }
            state.identity.session_token = Some(response.token.clone());
            state.identity.user_uuid = Some(response.user_uuid.clone());

            state
                .channel
                .as_mut()
                .ok_or(Error::NoTransport)?
                .finish_handshake(response.token.clone(), response.beacon_size_limit)?;

            state.activity = ActivityState::Active;
            state.arming = Some(thread::current().id());

            let info = OnStartInfo {
                session_id: state.identity.session_id.clone(),
                session_token: response.token,
                user_uuid: response.user_uuid,
            };
            (info, state.identity.metadata.clone())
        };

        self.arm();
        for (key, value) in metadata {
            self.send(Message::Metadata { key, value }, false);
        }
        self.notify("Tracking started");
        if let Some(hook) = &self.inner.on_start {
            safe::guard(self.inner.diagnostics.as_ref(), "on_start", || {
                hook(&info);
                Ok(())
            });
        }

        let deferred_stop = {
            let mut state = self.lock_state();
            state.arming = None;
            self.inner.armed.notify_all();
            std::mem::take(&mut state.stop_requested)
        };
        if deferred_stop {
            self.stop();
        }

        Ok(info)
    }

    /// Start callbacks, observer and ticker, in that order.
    fn arm(&self) {
        let callbacks = self.lock_callbacks().start.clone();
        self.run_callbacks(callbacks, "start_callback");

        let observer = self.inner.observer.clone();
        let weak = self.downgrade();
        safe::guard(self.inner.diagnostics.as_ref(), "observe", || {
            observer.observe(weak);
            Ok(())
        });

        let weak = self.downgrade();
        self.lock_ticker()
            .start(self.inner.config.commit_interval(), move || match weak.upgrade() {
                Some(app) => {
                    app.commit();
                    true
                }
                None => false,
            });
    }

    fn fail_start(&self, error: Error) -> Error {
        if matches!(error, Error::Interrupted) {
            tracing::debug!("Start interrupted by a concurrent stop");
            return error;
        }

        if let Err(e) = self.inner.persisted.clear_token() {
            tracing::warn!(error = %e, "Failed to clear session token");
        }
        self.stop();

        if error.is_reportable() {
            self.notify("Unable to start tracking");
            self.inner
                .diagnostics
                .report("session_start", &error.to_string());
        } else {
            tracing::debug!(reason = %error, "Session start declined");
        }
        error
    }

    /// Tear down the session. Safe to call in any state, any number of times.
    ///
    /// A stop from another thread while a start is arming blocks until
    /// arming is done and then tears down. A stop re-entered from a start
    /// callback runs right after arming instead.
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            loop {
                if state.activity == ActivityState::NotActive || state.stopping {
                    return;
                }
                let arming = state.arming;
                match arming {
                    Some(id) if id == thread::current().id() => {
                        state.stop_requested = true;
                        return;
                    }
                    Some(_) => {
                        state = self
                            .inner
                            .armed
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    None => break,
                }
            }
            state.stopping = true;
            state.epoch += 1;
        }

        let _deactivate = Deactivate { app: self };
        let sink = self.inner.diagnostics.as_ref();

        safe::guard(sink, "stop", || {
            self.commit();
            Ok(())
        });
        safe::guard(sink, "stop", || {
            if let Some(channel) = self.lock_state().channel.as_mut() {
                channel.stop()?;
            }
            Ok(())
        });

        let observer = &self.inner.observer;
        safe::guard(sink, "stop", || {
            observer.clear_content();
            Ok(())
        });
        safe::guard(sink, "stop", || {
            observer.disconnect();
            Ok(())
        });
        safe::guard(sink, "stop", || {
            observer.clear_nodes();
            Ok(())
        });
        safe::guard(sink, "stop", || {
            self.lock_ticker().stop();
            Ok(())
        });

        let callbacks = self.lock_callbacks().stop.clone();
        self.run_callbacks(callbacks, "stop_callback");
        self.notify("Tracking stopped");
    }

    /// React to an unsolicited worker signal.
    pub async fn handle_signal(&self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Stop => {
                tracing::info!("Worker requested stop");
                self.stop();
            }
            WorkerSignal::Restart => {
                tracing::info!("Worker requested restart");
                self.stop();
                let options = {
                    let mut state = self.lock_state();
                    state.identity.session_id = None;
                    StartOptions {
                        user_id: state.identity.user_id.clone(),
                        metadata: state.identity.metadata.clone(),
                        force_new: true,
                    }
                };
                if let Err(e) = self.start(options).await {
                    tracing::warn!(error = %e, "Restart failed");
                }
            }
        }
    }

    fn spawn_signal_loop(&self, mut signals: mpsc::UnboundedReceiver<WorkerSignal>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, worker signals will not be handled");
            return;
        };
        let weak = self.downgrade();
        handle.spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(app) = weak.upgrade() else {
                    break;
                };
                app.handle_signal(signal).await;
            }
        });
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn active(&self) -> bool {
        self.activity_state() == ActivityState::Active
    }

    pub fn activity_state(&self) -> ActivityState {
        self.lock_state().activity
    }

    pub fn session_info(&self) -> SessionInfo {
        let (session_id, metadata, user_id) = {
            let state = self.lock_state();
            (
                state.identity.session_id.clone(),
                state.identity.metadata.clone(),
                state.identity.user_id.clone(),
            )
        };
        SessionInfo {
            session_id,
            metadata,
            user_uuid: self.inner.persisted.user_uuid().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read user UUID");
                None
            }),
            project_key: self.inner.project_key.clone(),
            rev_id: self.inner.config.rev_id.clone(),
            timestamp: self.inner.clock.now_ms(),
            tracker_version: self.inner.tracker_version.clone(),
            user_id,
            is_snippet: self.inner.config.is_snippet,
        }
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.persisted.token().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read session token");
            None
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_state().identity.session_id.clone()
    }

    /// Host name of the ingest service.
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.inner.config.ingest_point)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    pub fn project_key(&self) -> &str {
        &self.inner.project_key
    }

    pub fn tracker_version(&self) -> &str {
        &self.inner.tracker_version
    }

    pub fn persisted(&self) -> &PersistedState {
        &self.inner.persisted
    }

    /// Base against which page resources are resolved.
    ///
    /// Configured override first, then the document base URI, then the
    /// document location without query or fragment.
    pub fn base_href(&self) -> Result<String> {
        if let Some(base) = &self.inner.config.resource_base_href {
            return Ok(base.clone());
        }
        if let Some(base) = self.inner.document.base_uri() {
            return Ok(base);
        }
        let location = self
            .inner
            .document
            .location()
            .ok_or_else(|| Error::Url("document has no location".to_string()))?;
        let url = reqwest::Url::parse(&location)
            .map_err(|e| Error::Url(format!("{}: {}", location, e)))?;
        Ok(format!("{}{}", url.origin().ascii_serialization(), url.path()))
    }

    /// Rebase the path of `resource_url` onto [`App::base_href`].
    pub fn resolve_resource_url(&self, resource_url: &str) -> Result<String> {
        let base_href = self.base_href()?;
        let mut base = reqwest::Url::parse(&base_href)
            .map_err(|e| Error::Url(format!("{}: {}", base_href, e)))?;
        let resource = reqwest::Url::parse(resource_url)
            .map_err(|e| Error::Url(format!("{}: {}", resource_url, e)))?;

        let joined = format!("{}/{}", base.path(), resource.path());
        base.set_path(&collapse_slashes(&joined));
        Ok(base.to_string())
    }

    pub fn is_service_url(&self, url: &str) -> bool {
        url.starts_with(&self.inner.config.ingest_point)
    }

    pub fn check_required_version(&self, required: &str) -> bool {
        version::check_required_version(&self.inner.tracker_version, required)
    }

    /// Record a metadata entry; sent right away when a session is active.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.lock_state()
            .identity
            .metadata
            .insert(key.clone(), value.clone());
        self.send(Message::Metadata { key, value }, false);
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.lock_state().identity.user_id = Some(user_id.into());
    }

    /// Make the next start, possibly on another page, ask for a new session.
    pub fn reset_next_page_session(&self, flag: bool) -> Result<()> {
        self.inner.persisted.set_reset_flag(flag)
    }
}

/// Finishes a stop even when a teardown step unwinds.
struct Deactivate<'a> {
    app: &'a App,
}

impl Drop for Deactivate<'_> {
    fn drop(&mut self) {
        let mut state = self.app.lock_state();
        state.buffer.clear();
        state.activity = ActivityState::NotActive;
        state.stopping = false;
        state.stop_requested = false;
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("project_key", &self.inner.project_key)
            .field("activity", &self.activity_state())
            .finish_non_exhaustive()
    }
}
