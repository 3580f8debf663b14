//! A minimal connection pool.
//!
//! Connections live in an arena addressed by generational
//! [`ConnectionHandle`]s, so a handle to a removed connection never resolves
//! to its replacement. The pool owns the retry policy: connections never
//! reconnect on their own, [`ConnectionPool::reconnect_failed`] does it for
//! those whose retry interval has passed.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{ConnectionError, Result};
use crate::status::Status;
use crate::write::PendingWrite;
use tokio::runtime::Handle;
use tracing::debug;

/// Stable reference to a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Arena of connections with round-robin selection.
#[derive(Debug)]
pub struct ConnectionPool {
    runtime: Handle,
    config: ConnectionConfig,
    slots: Vec<Slot>,
    free_indices: Vec<usize>,
    cursor: usize,
}

impl ConnectionPool {
    /// Create an empty pool spawning connections on `runtime`.
    pub fn new(runtime: Handle, config: ConnectionConfig) -> Self {
        Self {
            runtime,
            config,
            slots: Vec::new(),
            free_indices: Vec::new(),
            cursor: 0,
        }
    }

    /// Add a connection to `host:port`. It is not connected yet.
    pub fn add(&mut self, host: impl Into<String>, port: u16) -> Result<ConnectionHandle> {
        let conn = Connection::builder(host, port)
            .config(self.config.clone())
            .spawn(&self.runtime)?;

        let index = match self.free_indices.pop() {
            Some(index) => {
                self.slots[index].conn = Some(conn);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                self.slots.len() - 1
            }
        };
        let index = u32::try_from(index)
            .map_err(|_| ConnectionError::Config("connection pool is full".into()))?;
        Ok(ConnectionHandle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Look up a live connection.
    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.conn.as_ref()
    }

    /// Remove and close a connection.
    ///
    /// Returns its queued, undispatched buffers so they can be submitted
    /// elsewhere. Anything in flight resolves as cancelled.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Vec<PendingWrite> {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return Vec::new();
        };
        if slot.generation != handle.generation {
            return Vec::new();
        }
        let Some(conn) = slot.conn.take() else {
            return Vec::new();
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push(handle.index as usize);

        let pending = conn.take_pending();
        conn.shutdown();
        pending
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live connections.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionHandle, &Connection)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.conn.as_ref().map(|conn| {
                (
                    ConnectionHandle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    conn,
                )
            })
        })
    }

    /// Connect every connection that has never connected or has failed.
    ///
    /// Returns how many connects were issued.
    pub fn connect_all(&self) -> usize {
        let mut issued = 0;
        for (_, conn) in self.iter() {
            if matches!(conn.status(), Status::Undefined | Status::ConnectFailed) {
                conn.async_connect();
                issued += 1;
            }
        }
        issued
    }

    /// Reconnect failed connections whose retry interval has passed.
    pub fn reconnect_failed(&self) -> usize {
        let mut issued = 0;
        for (_, conn) in self.iter() {
            if conn.is_retry_eligible() {
                debug!(conn = %conn.client_info(), "Reconnecting");
                conn.async_connect();
                issued += 1;
            }
        }
        issued
    }

    /// Pick the next free connection, round-robin.
    pub fn select_free(&mut self) -> Option<ConnectionHandle> {
        let n = self.slots.len();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            let slot = &self.slots[index];
            if slot.conn.as_ref().is_some_and(Connection::is_free) {
                self.cursor = (index + 1) % n;
                return Some(ConnectionHandle {
                    index: index as u32,
                    generation: slot.generation,
                });
            }
        }
        None
    }

    /// Submit a buffer.
    ///
    /// Goes to a free connection if there is one, else to the connected (or
    /// connecting) connection with the shortest queue. With no usable
    /// connection the buffer resolves as cancelled and `None` is returned.
    pub fn submit(&mut self, write: PendingWrite) -> Option<ConnectionHandle> {
        self.submit_excluding(write, None)
    }

    /// Move queued buffers of `from` onto other connections.
    ///
    /// Returns how many were moved.
    pub fn reroute_pending(&mut self, from: ConnectionHandle) -> usize {
        let Some(conn) = self.get(from) else {
            return 0;
        };
        let pending = conn.take_pending();
        let mut moved = 0;
        for write in pending {
            if self.submit_excluding(write, Some(from)).is_some() {
                moved += 1;
            }
        }
        moved
    }

    /// Close every connection and empty the pool.
    pub async fn close_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(conn) = slot.conn.take() {
                conn.close().await;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free_indices = (0..self.slots.len()).collect();
    }

    fn submit_excluding(
        &mut self,
        write: PendingWrite,
        exclude: Option<ConnectionHandle>,
    ) -> Option<ConnectionHandle> {
        let target = self
            .select_free()
            .filter(|h| Some(*h) != exclude)
            .or_else(|| {
                self.iter()
                    .filter(|(h, conn)| {
                        Some(*h) != exclude
                            && (conn.status().is_connected() || conn.status() == Status::Connecting)
                    })
                    .min_by_key(|(_, conn)| conn.pending_len())
                    .map(|(h, _)| h)
            });

        match target.and_then(|h| self.get(h).map(|conn| (h, conn))) {
            Some((handle, conn)) => {
                conn.write(write);
                Some(handle)
            }
            None => {
                write.fail(ConnectionError::Cancelled);
                None
            }
        }
    }
}
