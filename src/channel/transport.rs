//! Transport seam between the channel and a worker context.
//!
//! A transport only moves messages. It knows nothing about correlation,
//! timeouts or lifecycle; those live in the manager.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ChannelResult;
use super::protocol::{CommandEnvelope, WorkerMessage};

/// Outgoing half of a running worker context.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one command to the worker. Delivery order relative to other
    /// commands is not guaranteed to be preserved by the worker.
    async fn send(&self, envelope: &CommandEnvelope) -> ChannelResult<()>;

    /// Stop the worker context. Must be safe to call more than once.
    async fn terminate(&self);
}

/// Starts worker contexts.
#[async_trait]
pub trait TransportSpawner: Send + Sync {
    /// Start a worker whose inbound messages are delivered to `inbound`.
    ///
    /// Dropping every clone of `inbound` signals that the worker is gone.
    async fn spawn(&self, inbound: InboundSink) -> ChannelResult<Box<dyn Transport>>;
}

/// Where a transport delivers worker messages.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl InboundSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a message. Returns `false` once the channel stopped listening.
    pub fn deliver(&self, message: WorkerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}
