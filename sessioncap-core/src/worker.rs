//! HTTP transport worker.
//!
//! Runs as a tokio task fed over an unbounded channel, so posting from the
//! orchestrator never waits on the network. Buffered messages are delivered
//! to `POST {ingest_point}/v1/web/i` when:
//! - the flush interval elapses
//! - the encoded size reaches the beacon size limit
//! - a heartbeat or stop arrives
//!
//! Delivery problems are reported back as [`WorkerSignal`]s: `401` asks for
//! a restart, exhausting every connection attempt asks for a stop.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::message::{Batch, Message};
use crate::transport::{ControlMessage, InitParams, Transport, WorkerSignal};

/// Beacon size used until the ingest service announces its own.
pub const DEFAULT_BEACON_SIZE_LIMIT: u64 = 200_000;

/// Worker tuning that is fixed at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub flush_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum WorkerCommand {
    Control(ControlMessage),
    Batch(Batch),
    Drain(oneshot::Sender<()>),
}

/// Orchestrator-side handle to a running [`HttpWorker`].
pub struct WorkerTransport {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<WorkerSignal>>>,
}

impl WorkerTransport {
    fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Transport("worker has exited".to_string()))
    }

    /// Resolve once the worker has handled every command posted before.
    ///
    /// Used by short-lived hosts to let a final `Stop` flush complete
    /// before the runtime shuts down.
    pub async fn drain(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerCommand::Drain(tx))?;
        rx.await
            .map_err(|_| Error::Transport("worker has exited".to_string()))
    }
}

impl Transport for WorkerTransport {
    fn post_control(&self, message: ControlMessage) -> Result<()> {
        self.send(WorkerCommand::Control(message))
    }

    fn post_batch(&self, batch: Batch) -> Result<()> {
        self.send(WorkerCommand::Batch(batch))
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<WorkerSignal>> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Delivery state for one negotiated session.
struct WorkerSession {
    batch_url: String,
    conn_attempt_count: u32,
    conn_attempt_gap: Duration,
    token: Option<String>,
    beacon_size_limit: usize,
}

impl WorkerSession {
    fn from_init(params: InitParams) -> Self {
        Self {
            batch_url: format!("{}/v1/web/i", params.ingest_point.trim_end_matches('/')),
            conn_attempt_count: params.conn_attempt_count.max(1),
            conn_attempt_gap: params.conn_attempt_gap,
            token: None,
            beacon_size_limit: DEFAULT_BEACON_SIZE_LIMIT as usize,
        }
    }
}

enum Delivery {
    Delivered,
    Unauthorized,
    Failed,
}

/// Background delivery task.
pub struct HttpWorker {
    http_client: reqwest::Client,
    flush_interval: Duration,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    session: Option<WorkerSession>,
    pending: Vec<Message>,
    pending_bytes: usize,
}

impl HttpWorker {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// Fails when called outside a runtime or when the HTTP client cannot
    /// be built; the orchestrator then runs without a transport.
    pub fn spawn(config: WorkerConfig) -> Result<WorkerTransport> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Transport(format!("no async runtime for worker: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let worker = HttpWorker {
            http_client,
            flush_interval: config.flush_interval,
            signals: signal_tx,
            session: None,
            pending: Vec::new(),
            pending_bytes: 0,
        };
        handle.spawn(worker.run(command_rx));

        Ok(WorkerTransport {
            commands: command_tx,
            signals: Mutex::new(Some(signal_rx)),
        })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        self.flush().await;
                        tracing::debug!("Worker channel closed, exiting");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Control(ControlMessage::Init(params)) => {
                tracing::debug!(page_no = params.page_no, "Worker session initialised");
                self.reset();
                self.session = Some(WorkerSession::from_init(params));
            }
            WorkerCommand::Control(ControlMessage::Handshake {
                token,
                beacon_size_limit,
            }) => match self.session.as_mut() {
                Some(session) => {
                    session.token = Some(token);
                    if let Some(limit) = beacon_size_limit {
                        session.beacon_size_limit = limit.max(1) as usize;
                    }
                }
                None => tracing::warn!("Handshake without init, ignoring"),
            },
            WorkerCommand::Control(ControlMessage::Heartbeat) => self.flush().await,
            WorkerCommand::Control(ControlMessage::Stop) => {
                self.flush().await;
                self.session = None;
            }
            WorkerCommand::Batch(batch) => self.enqueue(batch).await,
            WorkerCommand::Drain(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn enqueue(&mut self, batch: Batch) {
        let Some(limit) = self.session.as_ref().map(|s| s.beacon_size_limit) else {
            tracing::warn!(messages = batch.len(), "Batch without session, dropping");
            return;
        };
        for message in batch.into_messages() {
            self.pending_bytes += encoded_len(&message);
            self.pending.push(message);
        }
        if self.pending_bytes >= limit {
            self.flush().await;
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Some(session) = self.session.take() else {
            self.reset();
            return;
        };
        let Some(token) = session.token.clone() else {
            // Not ready yet; keep the messages for the next flush.
            self.session = Some(session);
            return;
        };

        let messages = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;

        for chunk in split_by_size(messages, session.beacon_size_limit) {
            match self.deliver(&session, &token, &chunk).await {
                Delivery::Delivered => {}
                Delivery::Unauthorized => {
                    tracing::info!("Ingest rejected token, requesting restart");
                    let _ = self.signals.send(WorkerSignal::Restart);
                    return;
                }
                Delivery::Failed => {
                    tracing::warn!(
                        attempts = session.conn_attempt_count,
                        "Giving up on delivery, requesting stop"
                    );
                    let _ = self.signals.send(WorkerSignal::Stop);
                    return;
                }
            }
        }
        self.session = Some(session);
    }

    async fn deliver(&self, session: &WorkerSession, token: &str, chunk: &[Message]) -> Delivery {
        let Ok(auth) = HeaderValue::from_str(&format!("Bearer {}", token)) else {
            tracing::warn!("Token is not a valid header value");
            return Delivery::Unauthorized;
        };

        for attempt in 0..session.conn_attempt_count {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying batch delivery (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    session.conn_attempt_count,
                    session.conn_attempt_gap
                );
                tokio::time::sleep(session.conn_attempt_gap).await;
            }

            let response = self
                .http_client
                .post(&session.batch_url)
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(AUTHORIZATION, auth.clone())
                .json(chunk)
                .send()
                .await;

            match response {
                Ok(r) if r.status().is_success() => {
                    tracing::trace!(messages = chunk.len(), "Batch delivered");
                    return Delivery::Delivered;
                }
                Ok(r) if r.status() == StatusCode::UNAUTHORIZED => return Delivery::Unauthorized,
                Ok(r) => tracing::warn!(status = %r.status(), "Transient error delivering batch"),
                Err(e) => tracing::warn!(error = %e, "Transient error delivering batch"),
            }
        }
        Delivery::Failed
    }
}

fn encoded_len(message: &Message) -> usize {
    serde_json::to_vec(message).map(|v| v.len()).unwrap_or(0)
}

/// Split messages into chunks whose encoded size stays under `limit`.
///
/// A single message larger than the limit travels alone.
fn split_by_size(messages: Vec<Message>, limit: usize) -> Vec<Vec<Message>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for message in messages {
        let len = encoded_len(&message);
        if !current.is_empty() && current_bytes + len > limit {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += len;
        current.push(message);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
