//! Caller-submitted buffers and their resolution channel.
//!
//! A [`PendingWrite`] is created together with a [`WriteReceipt`]. The
//! buffer travels through the connection (queue, in flight) while the
//! receipt stays with the submitter and completes exactly once with the
//! outcome.
//!
//! ```rust,ignore
//! let (buffer, receipt) = PendingWrite::new(payload);
//! connection.write(buffer);
//! match receipt.await {
//!     Ok(delivery) => println!("acked after {:?}", delivery.latency),
//!     Err(undelivered) => pool.redeliver(undelivered.into_payload()),
//! }
//! ```

use crate::error::{ConnectionError, Undelivered};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome of a write.
pub type WriteResult = Result<Delivery, Undelivered>;

/// A successfully delivered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes written to the socket.
    pub bytes_sent: usize,
    /// Response frame, if the write expected one.
    pub response: Option<Bytes>,
    /// Time spent in the queue before dispatch.
    pub queued_for: Duration,
    /// Time from dispatch to resolution.
    pub latency: Duration,
}

/// One caller-submitted unit of data to transmit.
///
/// Resolution consumes the completion sender, so a buffer can never be
/// resolved twice. Dropping an unresolved buffer resolves it as
/// [`ConnectionError::Cancelled`].
#[derive(Debug)]
pub struct PendingWrite {
    payload: Bytes,
    enqueued_at: Instant,
    dispatched_at: Option<Instant>,
    expects_response: Option<bool>,
    completion: Option<oneshot::Sender<WriteResult>>,
}

impl PendingWrite {
    /// Create a buffer and the receipt that observes its outcome.
    pub fn new(payload: impl Into<Bytes>) -> (Self, WriteReceipt) {
        let (tx, rx) = oneshot::channel();
        let write = Self {
            payload: payload.into(),
            enqueued_at: Instant::now(),
            dispatched_at: None,
            expects_response: None,
            completion: Some(tx),
        };
        (write, WriteReceipt { rx })
    }

    /// Override whether this write waits for a response frame.
    ///
    /// Unset writes follow the connection's `expect_response` setting.
    pub fn expect_response(mut self, expect: bool) -> Self {
        self.expects_response = Some(expect);
        self
    }

    /// The payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// When the buffer was created.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Response expectation, if set explicitly.
    pub fn expects_response(&self) -> Option<bool> {
        self.expects_response
    }

    /// Check if the submitter stopped waiting for the outcome.
    pub fn is_abandoned(&self) -> bool {
        self.completion.as_ref().is_none_or(|tx| tx.is_closed())
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.dispatched_at = Some(Instant::now());
    }

    /// Resolve as delivered.
    pub(crate) fn succeed(mut self, bytes_sent: usize, response: Option<Bytes>) -> Duration {
        let now = Instant::now();
        let dispatched = self.dispatched_at.unwrap_or(self.enqueued_at);
        let latency = now.saturating_duration_since(dispatched);
        let delivery = Delivery {
            bytes_sent,
            response,
            queued_for: dispatched.saturating_duration_since(self.enqueued_at),
            latency,
        };
        self.complete(Ok(delivery));
        latency
    }

    /// Resolve as failed, handing the payload back.
    pub(crate) fn fail(mut self, error: ConnectionError) {
        let payload = self.payload.clone();
        self.complete(Err(Undelivered::new(payload, error)));
    }

    fn complete(&mut self, result: WriteResult) {
        if let Some(tx) = self.completion.take() {
            // The submitter may have dropped its receipt; nothing to report to.
            let _ = tx.send(result);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.completion.is_some() {
            let payload = self.payload.clone();
            self.complete(Err(Undelivered::new(payload, ConnectionError::Cancelled)));
        }
    }
}

/// Future resolving to the outcome of a [`PendingWrite`].
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<WriteResult>,
}

impl WriteReceipt {
    /// Check the outcome without waiting.
    ///
    /// Returns `None` while the write is unresolved.
    pub fn try_result(&mut self) -> Option<WriteResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Undelivered::new(
                Bytes::new(),
                ConnectionError::Cancelled,
            ))),
        }
    }
}

impl Future for WriteReceipt {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            // A sender can only vanish without sending if its buffer was
            // leaked; `PendingWrite::drop` always sends.
            result.unwrap_or_else(|_| Err(Undelivered::new(Bytes::new(), ConnectionError::Cancelled)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_succeed_resolves_receipt() {
        let (mut write, receipt) = PendingWrite::new(&b"hello"[..]);
        write.mark_dispatched();
        write.succeed(5, Some(Bytes::from_static(b"ok")));

        let delivery = receipt.await.unwrap();
        assert_eq!(delivery.bytes_sent, 5);
        assert_eq!(delivery.response, Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_fail_returns_payload() {
        let (write, receipt) = PendingWrite::new(&b"payload"[..]);
        write.fail(ConnectionError::Write("reset".into()));

        let undelivered = receipt.await.unwrap_err();
        assert_eq!(undelivered.kind(), ErrorKind::Write);
        assert_eq!(undelivered.payload, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_drop_resolves_as_cancelled() {
        let (write, receipt) = PendingWrite::new(&b"x"[..]);
        drop(write);

        let undelivered = receipt.await.unwrap_err();
        assert_eq!(undelivered.kind(), ErrorKind::Cancelled);
        assert_eq!(undelivered.payload, Bytes::from_static(b"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_times_follow_runtime_clock() {
        let (mut write, receipt) = PendingWrite::new(&b"x"[..]);
        tokio::time::advance(Duration::from_millis(50)).await;
        write.mark_dispatched();
        tokio::time::advance(Duration::from_millis(20)).await;
        let latency = write.succeed(1, None);

        let delivery = receipt.await.unwrap();
        assert_eq!(delivery.queued_for, Duration::from_millis(50));
        assert_eq!(delivery.latency, Duration::from_millis(20));
        assert_eq!(latency, delivery.latency);
    }

    #[test]
    fn test_try_result_pending_then_ready() {
        let (write, mut receipt) = PendingWrite::new(&b"x"[..]);
        assert!(receipt.try_result().is_none());
        write.succeed(1, None);
        assert!(matches!(receipt.try_result(), Some(Ok(_))));
    }

    #[test]
    fn test_receipt_pending_until_resolved() {
        use tokio_test::{assert_pending, assert_ready, task};

        let (write, receipt) = PendingWrite::new(&b"x"[..]);
        let mut receipt = task::spawn(receipt);
        assert_pending!(receipt.poll());

        write.fail(ConnectionError::Cancelled);
        assert!(receipt.is_woken());
        let undelivered = assert_ready!(receipt.poll()).unwrap_err();
        assert_eq!(undelivered.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_abandoned_when_receipt_dropped() {
        let (write, receipt) = PendingWrite::new(&b"x"[..]);
        assert!(!write.is_abandoned());
        drop(receipt);
        assert!(write.is_abandoned());
    }

    #[test]
    fn test_expect_response_override() {
        let (write, _receipt) = PendingWrite::new(&b"x"[..]);
        assert_eq!(write.expects_response(), None);
        let write = write.expect_response(false);
        assert_eq!(write.expects_response(), Some(false));
        assert_eq!(write.len(), 1);
        assert!(!write.is_empty());
    }
}
