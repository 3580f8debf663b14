//! Connection State Machine
//!
//! The transition function for a single ingestion connection. It is pure:
//! it maps `(status, event)` to the next status and the action the driver
//! must perform, and knows nothing about sockets or timers.
//!
//! ## State Machine
//!
//! ```text
//!   Undefined ──connect──► Connecting ──ok, queue empty──► Free ◄──────────┐
//!       ▲                     │  │                          │ dispatch     │
//!       │                     │  └──ok, buffer queued──┐    ▼              │
//!       │                fail/timeout                  └─► Writing ──done──┤ (no response)
//!       │                     ▼                             │              │
//!       │               ConnectFailed ◄──write error───────┘│ done         │
//!       │                     ▲                              ▼              │
//!       │                     └──────bad frame / idle──── Waiting ─frame──┘
//!       │
//!   any non-Stopped ──close──► Stopped (terminal)
//! ```
//!
//! Every `(status, event)` pair is handled explicitly; adding a status or an
//! event is a compile error until the table covers it.

use std::fmt;

// ============================================================================
// Status
// ============================================================================

/// Connection status.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum Status {
    /// Constructed, never connected.
    #[default]
    Undefined = 0,
    /// Connect in progress.
    Connecting = 1,
    /// A buffer is being written.
    Writing = 2,
    /// Connected and idle.
    Free = 3,
    /// Last connect or operation failed; socket is closed.
    ConnectFailed = 4,
    /// Waiting for the response to the in-flight buffer.
    Waiting = 5,
    /// Closed for good.
    Stopped = 6,
}

impl Status {
    /// Every status, in discriminant order.
    pub const ALL: [Status; 7] = [
        Status::Undefined,
        Status::Connecting,
        Status::Writing,
        Status::Free,
        Status::ConnectFailed,
        Status::Waiting,
        Status::Stopped,
    ];

    /// Check if no transition can leave this status.
    #[inline(always)]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Check if a socket is established in this status.
    #[inline(always)]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Free | Self::Writing | Self::Waiting)
    }

    /// Check if a buffer is being transmitted or awaiting its response.
    #[inline(always)]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Writing | Self::Waiting)
    }

    /// Status name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Connecting => "connecting",
            Self::Writing => "writing",
            Self::Free => "free",
            Self::ConnectFailed => "connect_failed",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Connect requested.
    AsyncConnect,
    /// Socket established. `queued` tells whether a buffer is waiting.
    Connected { queued: bool },
    /// Connect refused or timed out.
    ConnectFailed,
    /// A queued buffer was picked up while idle.
    Dispatch,
    /// The in-flight buffer was fully written.
    WriteComplete { expects_response: bool },
    /// Socket error (or deadline) during write.
    WriteFailed,
    /// A chunk arrived but the response frame is not complete yet.
    FramePartial,
    /// The response frame is complete.
    FrameComplete,
    /// Read error, malformed frame, or response deadline.
    ResponseFailed,
    /// Idle for too long and the keep-alive probe went unanswered.
    IdleTimeout,
    /// Close requested.
    Close,
}

impl Event {
    /// Event name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AsyncConnect => "async_connect",
            Self::Connected { .. } => "connected",
            Self::ConnectFailed => "connect_failed",
            Self::Dispatch => "dispatch",
            Self::WriteComplete { .. } => "write_complete",
            Self::WriteFailed => "write_failed",
            Self::FramePartial => "frame_partial",
            Self::FrameComplete => "frame_complete",
            Self::ResponseFailed => "response_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Work the driver performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Nothing to do.
    None,
    /// Open the socket and arm the connect timer.
    StartConnect,
    /// Dequeue the head of the queue and start writing it.
    BeginWrite,
    /// Start reading the response into the receive block.
    AwaitResponse,
    /// Keep reading; the frame is incomplete.
    ContinueRead,
    /// Resolve the in-flight buffer as delivered.
    Resolve,
    /// Failure path: cancel timers, close the socket, fail the in-flight buffer.
    HandleFail,
    /// Terminal path: release everything and fail all outstanding buffers.
    DoClose,
}

/// Result of a valid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Next status.
    pub to: Status,
    /// Work to perform.
    pub action: Action,
}

impl Step {
    #[inline(always)]
    const fn new(to: Status, action: Action) -> Self {
        Self { to, action }
    }

    /// Check if the step leaves the status unchanged and does nothing.
    pub fn is_noop(&self, from: Status) -> bool {
        self.to == from && self.action == Action::None
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The event has no edge from this status.
    #[error("Invalid transition from {from} on {event}")]
    Invalid { from: Status, event: Event },

    /// The connection is stopped; only close is accepted.
    #[error("Connection stopped, {0} ignored")]
    Terminal(Event),
}

// ============================================================================
// Transition Function
// ============================================================================

/// Compute the transition for `event` in status `from`.
///
/// # Examples
///
/// ```
/// use sluice_core::status::{transition, Action, Event, Status};
///
/// let step = transition(Status::Undefined, Event::AsyncConnect).unwrap();
/// assert_eq!(step.to, Status::Connecting);
/// assert_eq!(step.action, Action::StartConnect);
/// ```
pub fn transition(from: Status, event: Event) -> Result<Step, TransitionError> {
    use Action as A;
    use Event as E;
    use Status as S;

    let invalid = Err(TransitionError::Invalid { from, event });

    match from {
        S::Stopped => match event {
            E::Close => Ok(Step::new(S::Stopped, A::None)),
            _ => Err(TransitionError::Terminal(event)),
        },
        S::Undefined | S::ConnectFailed => match event {
            E::AsyncConnect => Ok(Step::new(S::Connecting, A::StartConnect)),
            E::IdleTimeout => Ok(Step::new(from, A::None)),
            E::Close => Ok(Step::new(S::Stopped, A::DoClose)),
            E::Connected { .. }
            | E::ConnectFailed
            | E::Dispatch
            | E::WriteComplete { .. }
            | E::WriteFailed
            | E::FramePartial
            | E::FrameComplete
            | E::ResponseFailed => invalid,
        },
        S::Connecting => match event {
            E::AsyncConnect => Ok(Step::new(S::Connecting, A::None)),
            E::Connected { queued: true } => Ok(Step::new(S::Writing, A::BeginWrite)),
            E::Connected { queued: false } => Ok(Step::new(S::Free, A::None)),
            E::ConnectFailed | E::IdleTimeout => Ok(Step::new(S::ConnectFailed, A::HandleFail)),
            E::Close => Ok(Step::new(S::Stopped, A::DoClose)),
            E::Dispatch
            | E::WriteComplete { .. }
            | E::WriteFailed
            | E::FramePartial
            | E::FrameComplete
            | E::ResponseFailed => invalid,
        },
        S::Free => match event {
            E::AsyncConnect => Ok(Step::new(S::Connecting, A::StartConnect)),
            E::Dispatch => Ok(Step::new(S::Writing, A::BeginWrite)),
            E::IdleTimeout => Ok(Step::new(S::ConnectFailed, A::HandleFail)),
            E::Close => Ok(Step::new(S::Stopped, A::DoClose)),
            E::Connected { .. }
            | E::ConnectFailed
            | E::WriteComplete { .. }
            | E::WriteFailed
            | E::FramePartial
            | E::FrameComplete
            | E::ResponseFailed => invalid,
        },
        S::Writing => match event {
            E::AsyncConnect => Ok(Step::new(S::Writing, A::None)),
            E::WriteComplete {
                expects_response: true,
            } => Ok(Step::new(S::Waiting, A::AwaitResponse)),
            E::WriteComplete {
                expects_response: false,
            } => Ok(Step::new(S::Free, A::Resolve)),
            E::WriteFailed | E::IdleTimeout => Ok(Step::new(S::ConnectFailed, A::HandleFail)),
            E::Close => Ok(Step::new(S::Stopped, A::DoClose)),
            E::Connected { .. }
            | E::ConnectFailed
            | E::Dispatch
            | E::FramePartial
            | E::FrameComplete
            | E::ResponseFailed => invalid,
        },
        S::Waiting => match event {
            E::AsyncConnect => Ok(Step::new(S::Waiting, A::None)),
            E::FramePartial => Ok(Step::new(S::Waiting, A::ContinueRead)),
            E::FrameComplete => Ok(Step::new(S::Free, A::Resolve)),
            E::ResponseFailed | E::IdleTimeout => {
                Ok(Step::new(S::ConnectFailed, A::HandleFail))
            }
            E::Close => Ok(Step::new(S::Stopped, A::DoClose)),
            E::Connected { .. }
            | E::ConnectFailed
            | E::Dispatch
            | E::WriteComplete { .. }
            | E::WriteFailed => invalid,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
