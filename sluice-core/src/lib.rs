// Connection core for the Sluice ingestion SDK
// One TCP connection to an ingestion node: state machine, pending-write queue,
// receive block, connect/op timer, keep-alive and statistics.

pub mod block;
pub mod codec;
pub mod config;
pub mod connection;
mod driver;
pub mod error;
pub mod logging;
pub mod pool;
mod queue;
pub mod stats;
pub mod status;
pub mod timer;
pub mod tuning;
pub mod write;

// Re-export commonly used types
pub use block::ReceiveBlock;
pub use codec::{FrameCodec, HeaderWidth, LengthPrefixedCodec, Verdict};
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{Connection, ConnectionBuilder, Endpoint};
pub use error::{ConnectionError, ErrorKind, Result, Undelivered};
pub use pool::{ConnectionHandle, ConnectionPool};
pub use queue::Failure;
pub use stats::{ConnectionStats, StatsSnapshot};
pub use status::{Action, Event, Status, Step, TransitionError, transition};
pub use tuning::{TcpConfig, TcpKeepalive};
pub use write::{Delivery, PendingWrite, WriteReceipt, WriteResult};
