//! Testing utilities for Sluice.
//!
//! [`MockNode`] is a local ingestion node for integration tests. It speaks
//! 4-byte big-endian length-prefixed frames, the format of the default
//! `LengthPrefixedCodec`, records every data frame it receives, and answers
//! according to a [`Behavior`].
//!
//! ## Quick Start
//!
//! ```
//! use sluice_testing::{Behavior, MockNode, frame};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # tokio_test::block_on(async {
//! let node = MockNode::start(Behavior::Ack).await.unwrap();
//!
//! let mut client = tokio::net::TcpStream::connect(node.addr()).await.unwrap();
//! client.write_all(&frame(b"event")).await.unwrap();
//!
//! let mut reply = [0u8; 6];
//! client.read_exact(&mut reply).await.unwrap();
//! assert_eq!(&reply[4..], b"ok");
//! assert_eq!(node.received().len(), 1);
//! # });
//! ```
//!
//! ## Behaviors
//!
//! | Behavior | Reply |
//! |----------|-------|
//! | `Ack` | the frame `ok` |
//! | `Split { delay }` | the `ok` frame in two chunks |
//! | `Silent` | nothing |
//! | `Garbage` | an invalid frame |
//! | `CloseOnFrame` | closes the socket |

mod node;

pub use node::{ACK, Behavior, MockNode, frame, probe};
