//! Command channel between the controller and an isolated OCR worker.
//!
//! The worker is a separate execution context (here: a child process) that
//! only understands unordered, uncorrelated messages. This module turns that
//! into request/response calls with correlation, timeouts, progress
//! notifications and a defined lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Controller (Rust + Tokio)                   │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                 CommandChannel (manager)                  │  │
//! │  │  - lifecycle: Uninitialized → Initializing → Ready → ...  │  │
//! │  │  - CorrelationTable: id → pending completion + timer      │  │
//! │  │  - EventMultiplexer: progress / log / error listeners     │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                 │ CommandEnvelope         ▲ WorkerMessage        │
//! │                 ▼                         │                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │            Transport (ProcessTransport: NDJSON)           │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 OCR Worker (separate context)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ocr_bridge::channel::{listener, ChannelEvent, CommandChannel, InitOptions, ProcessSpawner};
//!
//! let channel = CommandChannel::new(ProcessSpawner::new("./ocr-worker"));
//! let status = channel.initialize(InitOptions::default().with_backend("webgpu")).await?;
//!
//! channel
//!     .load_resources(Some(listener(|event| {
//!         if let ChannelEvent::Progress { update, .. } = event {
//!             println!("{}: {:.0}%", update.message, update.progress * 100.0);
//!         }
//!     })))
//!     .await?;
//!
//! channel.dispose().await;
//! ```

mod correlation;
mod error;
mod events;
mod lifecycle;
mod manager;
pub mod process;
pub mod protocol;
mod transport;

pub use correlation::{Completion, CorrelationId, CorrelationTable, PendingRequest};
pub use error::{ChannelError, ChannelResult};
pub use events::{listener, ChannelEvent, EventKind, EventMultiplexer, Listener};
pub use lifecycle::LifecycleState;
pub use manager::{ChannelConfig, CommandChannel};
pub use process::{ProcessSpawner, ProcessTransport};
pub use protocol::{
    ChannelStatus, CommandEnvelope, CommandKind, ImagePayload, InitOptions, LogLevel, LogRecord,
    ProcessOptions, ProgressUpdate, Region, WorkerMessage,
};
pub use transport::{InboundSink, Transport, TransportSpawner};
