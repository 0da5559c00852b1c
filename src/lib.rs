//! # ocr-bridge
//!
//! Drive a heavy OCR / image preprocessing worker from a controller without
//! blocking it and without sharing memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Application controller (out of scope)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │ initialize / load_resources /
//!                          ▼ process / get_status / dispose
//! ┌─────────────────────────────────────────────────────────┐
//! │                    CommandChannel                        │
//! │   lifecycle · correlation table · event multiplexer      │
//! └─────────────────────────────────────────────────────────┘
//!                          │ CommandEnvelope ▲ WorkerMessage
//!                          ▼                 │
//! ┌─────────────────────────────────────────────────────────┐
//! │              Transport (child process, NDJSON)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                OCR worker (opaque capability)            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod logging;

pub use channel::{
    listener, ChannelConfig, ChannelError, ChannelEvent, ChannelResult, ChannelStatus,
    CommandChannel, CommandKind, EventKind, ImagePayload, InitOptions, LifecycleState, Listener,
    ProcessOptions, ProcessSpawner, Region,
};
pub use config::Settings;
