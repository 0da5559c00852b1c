//! Channel lifecycle states.

use std::fmt;

use super::error::ChannelError;

/// Where a channel is in its lifecycle.
///
/// ```text
/// Uninitialized ──initialize──▶ Initializing ──INIT ok──▶ Ready
///       ▲                            │                      │
///       └────────INIT failed─────────┘                   dispose
///                                                           ▼
///   Disposed ◀──────────────────────────────────────── Disposing
///       │
///       └──initialize──▶ Initializing (fresh session)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Disposing,
    Disposed,
}

impl LifecycleState {
    /// Whether `initialize` starts a new bootstrap from this state.
    pub fn can_bootstrap(self) -> bool {
        matches!(self, LifecycleState::Uninitialized | LifecycleState::Disposed)
    }

    /// Whether commands other than INIT may be sent.
    pub fn accepts_commands(self) -> bool {
        self == LifecycleState::Ready
    }

    /// Error for a command attempted in this state.
    pub fn rejection(self) -> ChannelError {
        match self {
            LifecycleState::Disposing | LifecycleState::Disposed => ChannelError::Disposed,
            _ => ChannelError::NotInitialized,
        }
    }

    /// Whether a transport failure in this state should be reported as fatal.
    /// During teardown the worker going away is expected.
    pub fn is_live(self) -> bool {
        matches!(self, LifecycleState::Initializing | LifecycleState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Disposing => "disposing",
            LifecycleState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
