// Mock ingestion node

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::debug;

/// Response frame sent by [`Behavior::Ack`].
pub const ACK: &[u8] = b"ok";

/// How the node answers a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply with the frame `ok`.
    Ack,
    /// Reply with the `ok` frame in two chunks, `delay` apart.
    Split { delay: Duration },
    /// Never reply.
    Silent,
    /// Reply with bytes that are not a valid frame.
    Garbage,
    /// Drop the connection on receipt.
    CloseOnFrame,
}

/// Encode `payload` as a 4-byte big-endian length-prefixed frame.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.into()
}

/// The keep-alive probe understood by the node: an empty frame.
pub fn probe() -> Bytes {
    frame(&[])
}

#[derive(Debug)]
struct NodeState {
    behavior: Mutex<Behavior>,
    answer_probes: AtomicBool,
    frames: Mutex<Vec<Bytes>>,
    connections: AtomicUsize,
    probes: AtomicUsize,
}

/// TCP server speaking length-prefixed frames, scripted by [`Behavior`].
///
/// Empty frames are keep-alive probes; they are counted, not recorded, and
/// echoed back only when probe answering is on.
#[derive(Debug)]
pub struct MockNode {
    addr: SocketAddr,
    state: Arc<NodeState>,
    stop: watch::Sender<bool>,
}

impl MockNode {
    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    pub async fn start(behavior: Behavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(NodeState {
            behavior: Mutex::new(behavior),
            answer_probes: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        });
        let (stop, stop_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, Arc::clone(&state), stop_rx));
        debug!(%addr, ?behavior, "Mock node listening");

        Ok(Self { addr, state, stop })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Change the behavior for frames received from now on.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Echo keep-alive probes.
    pub fn set_answer_probes(&self, answer: bool) {
        self.state.answer_probes.store(answer, Ordering::SeqCst);
    }

    /// Data frames received so far, in arrival order.
    pub fn received(&self) -> Vec<Bytes> {
        self.state.frames.lock().clone()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Keep-alive probes received so far.
    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = stop.changed() => return,
        };
        match accepted {
            Ok((socket, peer)) => {
                state.connections.fetch_add(1, Ordering::SeqCst);
                debug!(%peer, "Mock node accepted connection");
                tokio::spawn(serve(socket, Arc::clone(&state), stop.clone()));
            }
            Err(e) => {
                debug!(error = %e, "Mock node accept failed");
                return;
            }
        }
    }
}

async fn serve(mut socket: TcpStream, state: Arc<NodeState>, mut stop: watch::Receiver<bool>) {
    loop {
        let read = tokio::select! {
            res = read_frame(&mut socket) => res,
            _ = stop.changed() => return,
        };
        let Ok(Some(payload)) = read else {
            return;
        };

        if payload.is_empty() {
            state.probes.fetch_add(1, Ordering::SeqCst);
            if state.answer_probes.load(Ordering::SeqCst) && socket.write_all(&probe()).await.is_err() {
                return;
            }
            continue;
        }

        state.frames.lock().push(payload);
        let behavior = *state.behavior.lock();
        let replied = match behavior {
            Behavior::Ack => socket.write_all(&frame(ACK)).await,
            Behavior::Split { delay } => {
                let reply = frame(ACK);
                let (head, tail) = reply.split_at(3);
                match socket.write_all(head).await {
                    Ok(()) => {
                        socket.flush().await.ok();
                        tokio::time::sleep(delay).await;
                        socket.write_all(tail).await
                    }
                    Err(e) => Err(e),
                }
            }
            Behavior::Silent => Ok(()),
            Behavior::Garbage => socket.write_all(b"\xff\xff\xff\xffgarbage").await,
            Behavior::CloseOnFrame => return,
        };
        if replied.is_err() {
            return;
        }
    }
}

/// Read one frame; `None` on clean EOF.
async fn read_frame(socket: &mut TcpStream) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; 4];
    match socket.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await?;
    Ok(Some(body.into()))
}
