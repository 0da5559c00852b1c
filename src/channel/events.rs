//! Out-of-band notification fan-out.
//!
//! Progress, log and fatal-error notifications are not responses to a single
//! command; they are broadcast to whoever is subscribed at the moment they
//! arrive.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;

use super::correlation::CorrelationId;
use super::error::ChannelError;
use super::protocol::{LogRecord, ProgressUpdate};

/// Callback invoked for every event it is subscribed to.
pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ChannelEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event names subscribers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Log,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Log => "log",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Progress {
        /// Command the worker attributed the progress to, if it said.
        id: Option<CorrelationId>,
        update: ProgressUpdate,
    },
    Log(LogRecord),
    Error(ChannelError),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Progress { .. } => EventKind::Progress,
            ChannelEvent::Log(_) => EventKind::Log,
            ChannelEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Many-to-many publish/subscribe register keyed by [`EventKind`].
#[derive(Default)]
pub struct EventMultiplexer {
    subscribers: DashMap<EventKind, Vec<Listener>>,
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `kind`. Subscribing the same listener twice is
    /// a no-op.
    pub fn on(&self, kind: EventKind, listener: Listener) {
        let mut listeners = self.subscribers.entry(kind).or_default();
        if !listeners.iter().any(|existing| same_listener(existing, &listener)) {
            listeners.push(listener);
        }
    }

    /// Unsubscribe `listener` from `kind`. Returns whether it was subscribed.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        let Some(mut listeners) = self.subscribers.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|existing| !same_listener(existing, listener));
        before != listeners.len()
    }

    /// Deliver `event` to every listener subscribed to its kind. A listener
    /// that panics is logged and skipped. Returns the number of listeners
    /// that completed normally.
    pub fn emit(&self, event: &ChannelEvent) -> usize {
        self.emit_with(event, Vec::new())
    }

    /// Like [`emit`](Self::emit), additionally delivering to `scoped`
    /// listeners that are not subscribed here. A listener present in both is
    /// called once.
    pub fn emit_with(&self, event: &ChannelEvent, scoped: Vec<Listener>) -> usize {
        let kind = event.kind();
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let mut listeners: Vec<Listener> = self
            .subscribers
            .get(&kind)
            .map(|listeners| listeners.value().clone())
            .unwrap_or_default();
        for listener in scoped {
            if !listeners.iter().any(|existing| same_listener(existing, &listener)) {
                listeners.push(listener);
            }
        }

        let mut delivered = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(event = %kind, "event listener panicked"),
            }
        }
        delivered
    }

    /// Number of listeners subscribed to `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .get(&kind)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Whether no listener is subscribed to anything.
    pub fn is_empty(&self) -> bool {
        self.subscribers.iter().all(|entry| entry.value().is_empty())
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}

impl fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.subscribers.iter() {
            map.entry(entry.key(), &entry.value().len());
        }
        map.finish()
    }
}

/// Listeners are compared by the allocation they point at.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
