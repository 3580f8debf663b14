//! Pending-write queue and the status it is published with.
//!
//! This is the only structure touched from outside the connection task.
//! Producers append under the write guard; the driver changes status and
//! dequeues under the same guard, so `is_free()` is always consistent with
//! the queue. Guards are never held across an `.await`.

use crate::error::{ConnectionError, ErrorKind};
use crate::status::Status;
use crate::write::PendingWrite;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Record of the last failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Rendered error.
    pub message: String,
    /// When it happened.
    pub at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) status: Status,
    pub(crate) queue: VecDeque<PendingWrite>,
    pub(crate) in_flight: bool,
    pub(crate) client_info: String,
    pub(crate) failure: Option<Failure>,
}

impl QueueState {
    /// Pop the head of the queue for transmission.
    pub(crate) fn dequeue(&mut self) -> Option<PendingWrite> {
        let mut write = self.queue.pop_front()?;
        write.mark_dispatched();
        self.in_flight = true;
        Some(write)
    }
}

/// State shared between the connection handle and its driver task.
#[derive(Debug)]
pub(crate) struct SharedState {
    inner: RwLock<QueueState>,
    created: Instant,
    /// Microseconds since `created` of the last successful I/O event.
    last_activity: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(client_info: String) -> Self {
        Self {
            inner: RwLock::new(QueueState {
                client_info,
                ..QueueState::default()
            }),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    /// Run `f` under the write guard.
    #[inline]
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> R {
        f(&mut *self.inner.write())
    }

    pub(crate) fn status(&self) -> Status {
        self.inner.read().status
    }

    pub(crate) fn is_free(&self) -> bool {
        let state = self.inner.read();
        state.status == Status::Free && !state.in_flight
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.inner.read().queue.len()
    }

    pub(crate) fn client_info(&self) -> String {
        self.inner.read().client_info.clone()
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        self.inner.read().failure.clone()
    }

    /// Append a buffer unless the connection is stopped.
    ///
    /// A rejected buffer is returned so it can be resolved outside the guard.
    pub(crate) fn push(&self, write: PendingWrite) -> Result<(), PendingWrite> {
        let mut state = self.inner.write();
        if state.status == Status::Stopped {
            return Err(write);
        }
        state.queue.push_back(write);
        Ok(())
    }

    /// Remove every queued, undispatched buffer.
    pub(crate) fn drain(&self) -> Vec<PendingWrite> {
        self.inner.write().queue.drain(..).collect()
    }

    /// Record activity at `now`. Never moves backwards.
    pub(crate) fn touch(&self, now: Instant) {
        let micros = now.saturating_duration_since(self.created).as_micros() as u64;
        self.last_activity.fetch_max(micros, Ordering::AcqRel);
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.created + Duration::from_micros(self.last_activity.load(Ordering::Acquire))
    }
}

/// Resolve a batch of buffers as failed, outside any guard.
pub(crate) fn fail_all(writes: Vec<PendingWrite>, error: impl Fn() -> ConnectionError) {
    for write in writes {
        write.fail(error());
    }
}
