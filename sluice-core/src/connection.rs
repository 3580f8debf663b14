//! The pool-facing connection handle.
//!
//! A [`Connection`] is one TCP connection to an ingestion node. Creating it
//! spawns its task on the given runtime but does not connect; the owner
//! calls [`Connection::async_connect`] and then submits buffers with
//! [`Connection::write`]. Everything the handle does is non-blocking except
//! [`Connection::close`], which waits for the task to stop.
//!
//! ```rust,no_run
//! use sluice_core::{Connection, PendingWrite};
//! use tokio::runtime::Handle;
//!
//! # async fn run() {
//! let conn = Connection::new(&Handle::current(), "ingest.local", 9000);
//! conn.async_connect();
//!
//! let (write, receipt) = PendingWrite::new(&b"\0\0\0\x05hello"[..]);
//! conn.write(write);
//! match receipt.await {
//!     Ok(delivery) => println!("delivered in {:?}", delivery.latency),
//!     Err(undelivered) => eprintln!("failed: {}", undelivered.error),
//! }
//! conn.close().await;
//! # }
//! ```

use crate::codec::{FrameCodec, LengthPrefixedCodec};
use crate::config::ConnectionConfig;
use crate::driver::{Command, Driver, DriverParts};
use crate::error::{ConnectionError, Result};
use crate::queue::{Failure, SharedState};
use crate::stats::ConnectionStats;
use crate::status::Status;
use crate::write::PendingWrite;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

/// Remote ingestion node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handle to one connection and its task.
///
/// Dropping the handle closes the connection; queued buffers resolve as
/// cancelled.
pub struct Connection {
    endpoint: Endpoint,
    config: Arc<ConnectionConfig>,
    shared: Arc<SharedState>,
    stats: Arc<ConnectionStats>,
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<Status>,
}

impl Connection {
    /// Create a connection with default configuration and codec.
    ///
    /// The connection starts in `Undefined`; nothing happens on the network
    /// until [`async_connect`](Self::async_connect).
    pub fn new(handle: &Handle, host: impl Into<String>, port: u16) -> Self {
        Self::spawn(
            handle,
            Endpoint::new(host, port),
            ConnectionConfig::default(),
            Box::new(LengthPrefixedCodec::default()),
            None,
        )
    }

    /// Start building a connection.
    pub fn builder(host: impl Into<String>, port: u16) -> ConnectionBuilder {
        ConnectionBuilder {
            endpoint: Endpoint::new(host, port),
            config: ConnectionConfig::default(),
            codec: None,
            client_name: None,
        }
    }

    fn spawn(
        handle: &Handle,
        endpoint: Endpoint,
        config: ConnectionConfig,
        codec: Box<dyn FrameCodec>,
        client_name: Option<String>,
    ) -> Self {
        let info = match &client_name {
            Some(name) => format!("{name} -> {endpoint}"),
            None => format!("-> {endpoint}"),
        };
        let config = Arc::new(config);
        let shared = Arc::new(SharedState::new(info));
        let stats = Arc::new(ConnectionStats::new());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::Undefined);

        let parts = DriverParts {
            endpoint: endpoint.clone(),
            config: Arc::clone(&config),
            shared: Arc::clone(&shared),
            stats: Arc::clone(&stats),
            commands: commands_rx,
            status_tx,
            codec,
            client_name,
        };
        handle.spawn(async move { Driver::new(parts).run().await });

        Self {
            endpoint,
            config,
            shared,
            stats,
            commands,
            status_rx,
        }
    }

    /// Ask the connection to connect.
    ///
    /// Ignored while connecting or busy; from `Free` it reconnects.
    pub fn async_connect(&self) {
        self.send(Command::Connect);
    }

    /// Queue a buffer.
    ///
    /// On a stopped connection the buffer resolves as cancelled at once.
    /// Buffers queued while disconnected wait for the next connect or for
    /// [`take_pending`](Self::take_pending).
    pub fn write(&self, write: PendingWrite) {
        match self.shared.push(write) {
            Ok(()) => self.send(Command::Wake),
            Err(rejected) => {
                self.stats.record_write_cancelled(1);
                rejected.fail(ConnectionError::Cancelled);
            }
        }
    }

    /// Check if the connection is connected, idle and has nothing in flight.
    pub fn is_free(&self) -> bool {
        self.shared.is_free()
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// Human readable identifier, `local -> remote` once connected.
    pub fn client_info(&self) -> String {
        self.shared.client_info()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Time of the last successful socket activity.
    pub fn last_activity(&self) -> Instant {
        self.shared.last_activity()
    }

    /// Buffers queued and not yet dispatched.
    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Shared, read-only statistics.
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// The most recent failure, if any.
    pub fn last_failure(&self) -> Option<Failure> {
        self.shared.failure()
    }

    /// Check if the connection failed at least `retry_interval` ago.
    pub fn is_retry_eligible(&self) -> bool {
        self.status() == Status::ConnectFailed
            && self
                .last_failure()
                .is_none_or(|f| f.at.elapsed() >= self.config.retry_interval)
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Remove every queued, undispatched buffer, e.g. to re-route it.
    pub fn take_pending(&self) -> Vec<PendingWrite> {
        self.shared.drain()
    }

    /// Close and wait until the connection is stopped.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(Some(tx))).is_ok() {
            // An error means the task already exited.
            let _ = rx.await;
        }
    }

    /// Close without waiting.
    pub fn shutdown(&self) {
        self.send(Command::Close(None));
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(conn = %self.endpoint, "Connection task gone, command dropped");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.shared.status() != Status::Stopped {
            let _ = self.commands.send(Command::Close(None));
        }
    }
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    endpoint: Endpoint,
    config: ConnectionConfig,
    codec: Option<Box<dyn FrameCodec>>,
    client_name: Option<String>,
}

impl ConnectionBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Response framing. Defaults to [`LengthPrefixedCodec`].
    pub fn codec(mut self, codec: impl FrameCodec) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Label prepended to the client info.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Validate the configuration and spawn the connection task.
    pub fn spawn(self, handle: &Handle) -> Result<Connection> {
        self.config.validate()?;
        let codec = self.codec.unwrap_or_else(|| {
            Box::new(LengthPrefixedCodec::default().max_frame(self.config.max_frame_size))
        });
        Ok(Connection::spawn(
            handle,
            self.endpoint,
            self.config,
            codec,
            self.client_name,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("node-1", 9000).to_string(), "node-1:9000");
    }

    #[tokio::test]
    async fn test_new_connection_is_undefined() {
        let conn = Connection::new(&Handle::current(), "127.0.0.1", 1);
        assert_eq!(conn.status(), Status::Undefined);
        assert!(!conn.is_free());
        assert_eq!(conn.client_info(), "-> 127.0.0.1:1");
        assert_eq!(conn.pending_len(), 0);
        assert!(!conn.is_retry_eligible());
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let config = ConnectionConfig {
            detection_interval: Duration::ZERO,
            ..ConnectionConfig::default()
        };
        let err = Connection::builder("127.0.0.1", 1)
            .config(config)
            .spawn(&Handle::current())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Config(_)));
    }

    #[tokio::test]
    async fn test_write_queues_while_undefined() {
        let conn = Connection::builder("127.0.0.1", 1)
            .client_name("ingest-0")
            .spawn(&Handle::current())
            .unwrap();
        assert_eq!(conn.client_info(), "ingest-0 -> 127.0.0.1:1");

        let (write, mut receipt) = PendingWrite::new(&b"x"[..]);
        conn.write(write);
        tokio::task::yield_now().await;
        assert_eq!(conn.pending_len(), 1);
        assert!(receipt.try_result().is_none());

        let taken = conn.take_pending();
        assert_eq!(taken.len(), 1);
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels_queue() {
        let conn = Connection::new(&Handle::current(), "127.0.0.1", 1);
        let (write, receipt) = PendingWrite::new(&b"x"[..]);
        conn.write(write);

        conn.close().await;
        assert_eq!(conn.status(), Status::Stopped);
        assert_eq!(receipt.await.unwrap_err().kind(), ErrorKind::Cancelled);

        conn.close().await;
        conn.shutdown();
        assert_eq!(conn.status(), Status::Stopped);
        assert_eq!(*conn.subscribe().borrow(), Status::Stopped);
    }

    #[tokio::test]
    async fn test_write_after_close_cancelled_immediately() {
        let conn = Connection::new(&Handle::current(), "127.0.0.1", 1);
        conn.close().await;

        let (write, mut receipt) = PendingWrite::new(&b"late"[..]);
        conn.write(write);
        let undelivered = receipt.try_result().unwrap().unwrap_err();
        assert_eq!(undelivered.kind(), ErrorKind::Cancelled);
        assert_eq!(undelivered.payload.as_ref(), b"late");
        assert_eq!(conn.stats().writes_cancelled(), 1);
    }
}
