//! # sessioncap-core
//!
//! Core library for sessioncap - a session capture runtime.
//!
//! This library provides:
//! - The session orchestrator ([`App`]) and its activity state machine
//! - Session negotiation with the ingest service
//! - The message commit pipeline and the worker transport boundary
//! - Fault isolation for host-supplied callbacks
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Messages flow through three stages:
//! - **Producers:** observers and host code call [`App::send`]
//! - **Commit:** buffered messages are batched behind a timestamp on a short timer
//! - **Worker:** batches cross the [`Transport`] boundary and are delivered over HTTP
//!
//! ## Example
//!
//! ```rust,no_run
//! use sessioncap_core::{App, Config, StartOptions};
//!
//! # async fn run() -> sessioncap_core::Result<()> {
//! let config = Config::load()?;
//! let app = App::builder("my-project-key", config.tracker)
//!     .http_worker()
//!     .build()?;
//!
//! let info = app.start(StartOptions::default()).await?;
//! println!("recording session {:?}", info.session_id);
//! app.stop();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use app::{ActivityState, App, AppBuilder, WeakApp, TRACKER_VERSION};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{Batch, Message};
pub use session::{OnStartInfo, SessionInfo, StartOptions};
pub use transport::{Transport, WorkerSignal};

// Public modules
pub mod app;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod message;
pub mod negotiator;
pub mod observer;
pub mod pipeline;
pub mod safe;
pub mod session;
pub mod storage;
pub mod transport;
pub mod version;
pub mod worker;
