//! Boundary to the transport worker.
//!
//! The worker runs apart from the orchestrator and only ever exchanges
//! messages with it. [`Transport`] is the narrow capability the orchestrator
//! holds; [`TransportChannel`] layers the handshake protocol on top so that
//! messages can only go out in the order the worker expects:
//!
//! ```text
//! Uninitialized --init--> Handshaking --handshake--> Ready --batch*-->
//!       ^                                               |
//!       +-------------------- stop ---------------------+
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::Batch;

/// First message of a session: where and how to deliver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub ingest_point: String,
    pub page_no: u32,
    pub start_timestamp: i64,
    pub conn_attempt_count: u32,
    #[serde(with = "duration_ms")]
    pub conn_attempt_gap: Duration,
}

/// Control messages from the orchestrator to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Init(InitParams),
    /// Negotiated credentials; completes the worker handshake
    Handshake {
        token: String,
        beacon_size_limit: Option<u64>,
    },
    /// Flush and release the session
    Stop,
    /// Flush now; the host may be going away
    Heartbeat,
}

/// Unsolicited signals from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// The ingest service no longer accepts the token; renegotiate
    Restart,
    /// Delivery gave up; stop the session
    Stop,
}

/// Message-passing peer that owns delivery.
///
/// Both post methods must return without waiting on the network.
pub trait Transport: Send + Sync {
    fn post_control(&self, message: ControlMessage) -> Result<()>;
    fn post_batch(&self, batch: Batch) -> Result<()>;

    /// Hand over the worker's signal stream. Yields `Some` at most once.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<WorkerSignal>>;
}

/// Handshake progress on the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Handshaking,
    Ready,
}

/// A [`Transport`] with the handshake order enforced.
pub struct TransportChannel {
    transport: Arc<dyn Transport>,
    state: ChannelState,
}

impl TransportChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: ChannelState::Uninitialized,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    pub fn init(&mut self, params: InitParams) -> Result<()> {
        if self.state != ChannelState::Uninitialized {
            return Err(Error::Transport(format!(
                "init while {:?}",
                self.state
            )));
        }
        self.transport.post_control(ControlMessage::Init(params))?;
        self.state = ChannelState::Handshaking;
        Ok(())
    }

    pub fn finish_handshake(&mut self, token: String, beacon_size_limit: Option<u64>) -> Result<()> {
        if self.state != ChannelState::Handshaking {
            return Err(Error::Transport(format!(
                "handshake while {:?}",
                self.state
            )));
        }
        self.transport.post_control(ControlMessage::Handshake {
            token,
            beacon_size_limit,
        })?;
        self.state = ChannelState::Ready;
        Ok(())
    }

    pub fn post_batch(&mut self, batch: Batch) -> Result<()> {
        if self.state != ChannelState::Ready {
            return Err(Error::Transport(format!(
                "batch while {:?}",
                self.state
            )));
        }
        self.transport.post_batch(batch)
    }

    /// Tell the worker to flush and release. Always returns to `Uninitialized`.
    pub fn stop(&mut self) -> Result<()> {
        self.state = ChannelState::Uninitialized;
        self.transport.post_control(ControlMessage::Stop)
    }
}

/// What a [`RecordingTransport`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Posted {
    Control(ControlMessage),
    Batch(Batch),
}

/// Transport that records everything posted to it.
///
/// Signals are injected with [`RecordingTransport::signal`].
pub struct RecordingTransport {
    posted: Mutex<Vec<Posted>>,
    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerSignal>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            posted: Mutex::new(Vec::new()),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.posted()
            .into_iter()
            .filter_map(|p| match p {
                Posted::Batch(b) => Some(b),
                Posted::Control(_) => None,
            })
            .collect()
    }

    pub fn controls(&self) -> Vec<ControlMessage> {
        self.posted()
            .into_iter()
            .filter_map(|p| match p {
                Posted::Control(c) => Some(c),
                Posted::Batch(_) => None,
            })
            .collect()
    }

    /// Emit a worker signal towards whoever took the signal stream.
    pub fn signal(&self, signal: WorkerSignal) {
        let _ = self.signal_tx.send(signal);
    }

    fn record(&self, posted: Posted) {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(posted);
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn post_control(&self, message: ControlMessage) -> Result<()> {
        self.record(Posted::Control(message));
        Ok(())
    }

    fn post_batch(&self, batch: Batch) -> Result<()> {
        self.record(Posted::Batch(batch));
        Ok(())
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<WorkerSignal>> {
        self.signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn init_params() -> InitParams {
        InitParams {
            ingest_point: "https://ingest.example.com".to_string(),
            page_no: 0,
            start_timestamp: 1,
            conn_attempt_count: 3,
            conn_attempt_gap: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_batch_before_handshake_is_rejected() {
        let transport = Arc::new(RecordingTransport::new());
        let mut channel = TransportChannel::new(transport.clone());

        assert!(channel.post_batch(Batch::new(1, vec![])).is_err());
        channel.init(init_params()).unwrap();
        assert!(channel.post_batch(Batch::new(1, vec![])).is_err());
        assert!(transport.batches().is_empty());
    }

    #[test]
    fn test_protocol_order() {
        let transport = Arc::new(RecordingTransport::new());
        let mut channel = TransportChannel::new(transport.clone());

        assert!(channel
            .finish_handshake("t".to_string(), None)
            .is_err());
        channel.init(init_params()).unwrap();
        assert!(channel.init(init_params()).is_err());
        channel.finish_handshake("t".to_string(), Some(1000)).unwrap();
        assert!(channel.is_ready());

        let batch = Batch::new(
            5,
            vec![Message::Custom {
                name: "n".to_string(),
                payload: "p".to_string(),
            }],
        );
        channel.post_batch(batch.clone()).unwrap();
        channel.stop().unwrap();
        assert_eq!(channel.state(), ChannelState::Uninitialized);

        assert_eq!(
            transport.posted(),
            vec![
                Posted::Control(ControlMessage::Init(init_params())),
                Posted::Control(ControlMessage::Handshake {
                    token: "t".to_string(),
                    beacon_size_limit: Some(1000),
                }),
                Posted::Batch(batch),
                Posted::Control(ControlMessage::Stop),
            ]
        );
    }

    #[test]
    fn test_signals_taken_once() {
        let transport = RecordingTransport::new();
        let mut rx = transport.take_signals().unwrap();
        assert!(transport.take_signals().is_none());

        transport.signal(WorkerSignal::Restart);
        assert_eq!(rx.try_recv().unwrap(), WorkerSignal::Restart);
    }

    #[test]
    fn test_init_params_wire_shape() {
        let json = serde_json::to_value(init_params()).unwrap();
        assert_eq!(json["ingestPoint"], "https://ingest.example.com");
        assert_eq!(json["pageNo"], 0);
        assert_eq!(json["connAttemptGap"], 100);
    }
}
