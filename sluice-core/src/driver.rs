//! The connection task.
//!
//! Each connection is one spawned task that owns the socket, both timers,
//! the receive block, the codec and the in-flight write. It runs one phase
//! per status; a phase waits for whatever can happen in that status and
//! returns a [`Signal`]. [`Driver::fire`] turns the signal into an [`Event`],
//! applies the transition table under the shared guard, and performs the
//! resulting action outside it.
//!
//! Socket futures that are not cancel safe (`write_all`) are pinned for the
//! whole phase, so commands that need no action never interrupt them.

use crate::block::ReceiveBlock;
use crate::codec::{FrameCodec, Verdict};
use crate::config::ConnectionConfig;
use crate::connection::Endpoint;
use crate::error::{ConnectionError, ErrorKind, Result};
use crate::queue::{Failure, SharedState, fail_all};
use crate::stats::ConnectionStats;
use crate::status::{Action, Event, Status, Step, TransitionError, transition};
use crate::timer::{Deadline, IdleCheck, KeepAlive};
use crate::write::PendingWrite;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests from the connection handle.
#[derive(Debug)]
pub(crate) enum Command {
    /// Connect (or reconnect).
    Connect,
    /// A buffer was queued.
    Wake,
    /// Close; the sender, if any, is notified once stopped.
    Close(Option<oneshot::Sender<()>>),
}

/// What a phase observed.
#[derive(Debug)]
enum Signal {
    Connect,
    Close(Option<oneshot::Sender<()>>),
    Connected { stream: TcpStream, took: Duration },
    ConnectFailed(ConnectionError),
    Dispatch,
    Written { bytes: usize },
    WriteFailed(ConnectionError),
    Partial,
    Frame { len: usize },
    ResponseFailed(ConnectionError),
    Idle(Duration),
    /// Nothing for the state machine; run the phase again.
    Continue,
}

/// Data a signal carries into the action.
enum Cause {
    None,
    Stream(TcpStream, Duration),
    Sent(usize),
    Frame(usize),
    Error(ConnectionError),
}

/// Outcome of one `select!` in a busy phase.
enum Busy<T> {
    Done(T),
    Deadline(Duration),
    Tick(Instant),
    Command(Option<Command>),
}

type Applied = std::result::Result<Option<(Status, Event, Step, Effects)>, TransitionError>;

/// Queue mutations performed together with a transition.
#[derive(Default)]
struct Effects {
    write: Option<PendingWrite>,
    drained: Vec<PendingWrite>,
}

fn command_signal(cmd: Option<Command>) -> Signal {
    match cmd {
        Some(Command::Connect) => Signal::Connect,
        Some(Command::Wake) => Signal::Continue,
        Some(Command::Close(waiter)) => Signal::Close(waiter),
        // Every handle is gone.
        None => Signal::Close(None),
    }
}

/// Read one chunk into the block. Cancel safe.
async fn read_chunk(stream: &mut TcpStream, block: &mut ReceiveBlock) -> Result<usize> {
    block.reserve_for_read()?;
    let mut spare = block.spare();
    let n = stream
        .read_buf(&mut spare)
        .await
        .map_err(|e| ConnectionError::Protocol(format!("read failed: {e}")))?;
    if n == 0 {
        return Err(ConnectionError::Protocol("connection closed by peer".into()));
    }
    Ok(n)
}

pub(crate) struct DriverParts {
    pub(crate) endpoint: Endpoint,
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) stats: Arc<ConnectionStats>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) status_tx: watch::Sender<Status>,
    pub(crate) codec: Box<dyn FrameCodec>,
    pub(crate) client_name: Option<String>,
}

pub(crate) struct Driver {
    endpoint: Endpoint,
    config: Arc<ConnectionConfig>,
    shared: Arc<SharedState>,
    stats: Arc<ConnectionStats>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<Status>,
    codec: Box<dyn FrameCodec>,
    client_name: Option<String>,
    /// Log label, kept in sync with the shared client info.
    conn: String,
    stream: Option<TcpStream>,
    deadline: Deadline,
    keepalive: KeepAlive,
    block: ReceiveBlock,
    in_flight: Option<PendingWrite>,
    exiting: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl Driver {
    /// Must be called inside the runtime the driver runs on.
    pub(crate) fn new(parts: DriverParts) -> Self {
        let DriverParts {
            endpoint,
            config,
            shared,
            stats,
            commands,
            status_tx,
            codec,
            client_name,
        } = parts;
        Self {
            conn: shared.client_info(),
            keepalive: KeepAlive::new(config.idle_time, config.detection_interval),
            block: ReceiveBlock::new(config.receive_block_size, config.max_frame_size),
            deadline: Deadline::new(),
            stream: None,
            in_flight: None,
            exiting: false,
            close_waiters: Vec::new(),
            endpoint,
            config,
            shared,
            stats,
            commands,
            status_tx,
            codec,
            client_name,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(conn = %self.conn, "Connection task started");
        while !self.exiting {
            let signal = match self.shared.status() {
                Status::Undefined | Status::ConnectFailed => self.idle_phase().await,
                Status::Connecting => self.connect_phase().await,
                Status::Free => self.free_phase().await,
                Status::Writing => self.write_phase().await,
                Status::Waiting => self.wait_phase().await,
                Status::Stopped => break,
            };
            self.fire(signal);
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// `Undefined` / `ConnectFailed`: no socket; queued buffers wait.
    async fn idle_phase(&mut self) -> Signal {
        loop {
            match self.commands.recv().await {
                Some(Command::Wake) => continue,
                other => return command_signal(other),
            }
        }
    }

    async fn connect_phase(&mut self) -> Signal {
        let started = Instant::now();
        let host = self.endpoint.host.clone();
        let connect = TcpStream::connect((host.as_str(), self.endpoint.port));
        tokio::pin!(connect);

        loop {
            let outcome = tokio::select! {
                res = &mut connect => Busy::Done(res),
                d = self.deadline.expired() => Busy::Deadline(d),
                cmd = self.commands.recv() => Busy::Command(cmd),
            };
            match outcome {
                Busy::Done(Ok(stream)) => {
                    return Signal::Connected {
                        stream,
                        took: started.elapsed(),
                    };
                }
                Busy::Done(Err(e)) => {
                    return Signal::ConnectFailed(ConnectionError::Connect(format!(
                        "{}: {e}",
                        self.endpoint
                    )));
                }
                Busy::Deadline(d) => return Signal::ConnectFailed(ConnectionError::ConnectTimeout(d)),
                Busy::Command(Some(Command::Wake | Command::Connect)) => continue,
                Busy::Command(other) => return command_signal(other),
                Busy::Tick(_) => continue,
            }
        }
    }

    async fn free_phase(&mut self) -> Signal {
        if !self.keepalive.is_probing() && self.shared.pending_len() > 0 {
            return Signal::Dispatch;
        }

        loop {
            let probing = self.keepalive.is_probing();
            let Some(stream) = self.stream.as_mut() else {
                return Signal::Idle(self.idle_for());
            };
            let outcome = tokio::select! {
                cmd = self.commands.recv() => Busy::Command(cmd),
                now = self.keepalive.tick() => Busy::Tick(now),
                res = read_chunk(stream, &mut self.block), if probing => Busy::Done(res),
            };

            match outcome {
                Busy::Command(Some(Command::Wake)) => {
                    if !probing && self.shared.pending_len() > 0 {
                        return Signal::Dispatch;
                    }
                }
                Busy::Command(other) => return command_signal(other),
                Busy::Tick(now) => {
                    let can_probe = self.codec.probe_frame().is_some();
                    match self
                        .keepalive
                        .check(Status::Free, self.shared.last_activity(), now, can_probe)
                    {
                        IdleCheck::Active => {}
                        IdleCheck::Probe => {
                            if let Err(e) = self.send_probe(now).await {
                                debug!(conn = %self.conn, error = %e, "Keep-alive probe failed");
                                return Signal::Idle(self.idle_for());
                            }
                        }
                        IdleCheck::Expired(idle) => return Signal::Idle(idle),
                    }
                }
                Busy::Done(Ok(n)) => {
                    self.stats.record_received(n);
                    match self.codec.check(self.block.filled()) {
                        Verdict::Partial => {}
                        Verdict::Complete(len) if len == self.block.len() => {
                            debug!(conn = %self.conn, "Keep-alive probe answered");
                            self.keepalive.clear_probe();
                            self.block.reset();
                            self.touch();
                            // Dispatch anything queued while probing.
                            return Signal::Continue;
                        }
                        Verdict::Complete(_) | Verdict::Malformed(_) => {
                            return Signal::Idle(self.idle_for());
                        }
                    }
                }
                Busy::Done(Err(e)) => {
                    debug!(conn = %self.conn, error = %e, "Keep-alive probe unanswered");
                    return Signal::Idle(self.idle_for());
                }
                Busy::Deadline(_) => {}
            }
        }
    }

    async fn write_phase(&mut self) -> Signal {
        let Some(payload) = self.in_flight.as_ref().map(|w| w.payload().clone()) else {
            return Signal::WriteFailed(ConnectionError::Write("no buffer in flight".into()));
        };
        let Some(stream) = self.stream.as_mut() else {
            return Signal::WriteFailed(ConnectionError::Write("socket closed".into()));
        };
        let write = async {
            stream.write_all(&payload).await?;
            stream.flush().await?;
            Ok::<_, io::Error>(())
        };
        tokio::pin!(write);

        loop {
            let outcome = tokio::select! {
                res = &mut write => Busy::Done(res),
                d = self.deadline.expired() => Busy::Deadline(d),
                now = self.keepalive.tick() => Busy::Tick(now),
                cmd = self.commands.recv() => Busy::Command(cmd),
            };
            match outcome {
                Busy::Done(Ok(())) => {
                    return Signal::Written {
                        bytes: payload.len(),
                    };
                }
                Busy::Done(Err(e)) => return Signal::WriteFailed(ConnectionError::Write(e.to_string())),
                Busy::Deadline(d) => {
                    return Signal::WriteFailed(ConnectionError::Write(format!(
                        "request timed out after {d:?}"
                    )));
                }
                Busy::Tick(now) => {
                    if let IdleCheck::Expired(idle) =
                        self.keepalive
                            .check(Status::Writing, self.shared.last_activity(), now, false)
                    {
                        return Signal::Idle(idle);
                    }
                }
                Busy::Command(Some(Command::Wake | Command::Connect)) => {}
                Busy::Command(other) => return command_signal(other),
            }
        }
    }

    async fn wait_phase(&mut self) -> Signal {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Signal::ResponseFailed(ConnectionError::Protocol("socket closed".into()));
            };
            let outcome = tokio::select! {
                res = read_chunk(stream, &mut self.block) => Busy::Done(res),
                d = self.deadline.expired() => Busy::Deadline(d),
                now = self.keepalive.tick() => Busy::Tick(now),
                cmd = self.commands.recv() => Busy::Command(cmd),
            };
            match outcome {
                Busy::Done(Ok(n)) => {
                    self.stats.record_received(n);
                    self.touch();
                    return self.response_verdict();
                }
                Busy::Done(Err(e)) => return Signal::ResponseFailed(e),
                Busy::Deadline(d) => {
                    return Signal::ResponseFailed(ConnectionError::Protocol(format!(
                        "no response within {d:?}"
                    )));
                }
                Busy::Tick(now) => {
                    if let IdleCheck::Expired(idle) =
                        self.keepalive
                            .check(Status::Waiting, self.shared.last_activity(), now, false)
                    {
                        return Signal::Idle(idle);
                    }
                }
                Busy::Command(Some(Command::Wake | Command::Connect)) => {}
                Busy::Command(other) => return command_signal(other),
            }
        }
    }

    fn response_verdict(&mut self) -> Signal {
        let filled = self.block.len();
        match self.codec.check(self.block.filled()) {
            Verdict::Complete(len) if len == filled => Signal::Frame { len },
            Verdict::Complete(len) => Signal::ResponseFailed(ConnectionError::Protocol(format!(
                "{} unexpected bytes after {len}-byte response",
                filled.saturating_sub(len)
            ))),
            Verdict::Partial => Signal::Partial,
            Verdict::Malformed(reason) => Signal::ResponseFailed(ConnectionError::Protocol(reason)),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn fire(&mut self, signal: Signal) {
        let (event, cause) = match signal {
            Signal::Continue => return,
            Signal::Connect => (Event::AsyncConnect, Cause::None),
            Signal::Close(waiter) => {
                self.close_waiters.extend(waiter);
                (Event::Close, Cause::None)
            }
            Signal::Connected { stream, took } => {
                (Event::Connected { queued: false }, Cause::Stream(stream, took))
            }
            Signal::ConnectFailed(e) => (Event::ConnectFailed, Cause::Error(e)),
            Signal::Dispatch => (Event::Dispatch, Cause::None),
            Signal::Written { bytes } => {
                let expects_response = self
                    .in_flight
                    .as_ref()
                    .and_then(PendingWrite::expects_response)
                    .unwrap_or(self.config.expect_response);
                (Event::WriteComplete { expects_response }, Cause::Sent(bytes))
            }
            Signal::WriteFailed(e) => (Event::WriteFailed, Cause::Error(e)),
            Signal::Partial => (Event::FramePartial, Cause::None),
            Signal::Frame { len } => (Event::FrameComplete, Cause::Frame(len)),
            Signal::ResponseFailed(e) => (Event::ResponseFailed, Cause::Error(e)),
            Signal::Idle(idle) => (
                Event::IdleTimeout,
                Cause::Error(ConnectionError::IdleTimeout(idle)),
            ),
        };

        let failure = match &cause {
            Cause::Error(e) => Some(Failure {
                kind: e.kind(),
                message: e.to_string(),
                at: Instant::now(),
            }),
            _ => None,
        };

        let applied = self.shared.with(|state| -> Applied {
            let event = match event {
                Event::Connected { .. } => Event::Connected {
                    queued: !state.queue.is_empty(),
                },
                // Drained by the owner since the phase looked.
                Event::Dispatch if state.queue.is_empty() => return Ok(None),
                other => other,
            };
            let from = state.status;
            let step = transition(from, event)?;
            state.status = step.to;

            let mut effects = Effects::default();
            match step.action {
                Action::BeginWrite => effects.write = state.dequeue(),
                Action::Resolve => state.in_flight = false,
                Action::HandleFail => {
                    state.in_flight = false;
                    state.failure = failure;
                }
                Action::DoClose => {
                    state.in_flight = false;
                    effects.drained = state.queue.drain(..).collect();
                }
                Action::None
                | Action::StartConnect
                | Action::AwaitResponse
                | Action::ContinueRead => {}
            }
            Ok(Some((from, event, step, effects)))
        });

        let (from, event, step, effects) = match applied {
            Ok(Some(applied)) => applied,
            Ok(None) => return,
            Err(TransitionError::Terminal(event)) => {
                debug!(conn = %self.conn, %event, "Event after close discarded");
                return;
            }
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "Unexpected event ignored");
                return;
            }
        };

        if step.to != from {
            self.stats.record_transition();
            self.status_tx.send_replace(step.to);
            debug!(conn = %self.conn, %from, to = %step.to, %event, "Transition");
        }

        self.perform(step, effects, cause);
    }

    fn perform(&mut self, step: Step, effects: Effects, cause: Cause) {
        let (frame, error) = match cause {
            Cause::None => (None, None),
            Cause::Stream(stream, took) => {
                self.on_connected(stream, took);
                (None, None)
            }
            Cause::Sent(bytes) => {
                self.stats.record_sent(bytes);
                self.touch();
                (None, None)
            }
            Cause::Frame(len) => (Some(len), None),
            Cause::Error(e) => (None, Some(e)),
        };

        match step.action {
            Action::None | Action::ContinueRead => {}
            Action::StartConnect => self.start_connect(),
            Action::BeginWrite => self.begin_write(effects.write),
            Action::AwaitResponse => self.block.reset(),
            Action::Resolve => self.resolve(frame),
            Action::HandleFail => self.handle_fail(
                error.unwrap_or_else(|| ConnectionError::Protocol("connection failed".into())),
            ),
            Action::DoClose => self.do_close(effects.drained),
        }
    }

    // ========================================================================
    // Actions
    // ========================================================================

    fn start_connect(&mut self) {
        // Reconnect from Free drops the old socket.
        self.stream = None;
        self.keepalive.clear_probe();
        self.block.reset();
        self.stats.record_connect_attempt();
        self.deadline.arm(self.config.connect_timeout);
        debug!(conn = %self.conn, endpoint = %self.endpoint, "Connecting");
    }

    fn on_connected(&mut self, stream: TcpStream, took: Duration) {
        self.deadline.cancel();
        if let Err(e) = self.config.tcp.apply(&stream) {
            warn!(conn = %self.conn, error = %e, "Failed to apply socket options");
        }

        let route = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("{local} -> {peer}"),
            _ => format!("-> {}", self.endpoint),
        };
        let info = match &self.client_name {
            Some(name) => format!("{name} {route}"),
            None => route,
        };
        self.shared.with(|state| state.client_info = info.clone());
        self.conn = info;

        self.stats.record_connected(took);
        self.stream = Some(stream);
        self.touch();
        info!(conn = %self.conn, took_ms = took.as_millis() as u64, "Connected");
    }

    fn begin_write(&mut self, write: Option<PendingWrite>) {
        self.in_flight = write;
        self.block.reset();
        match self.config.request_timeout {
            Some(timeout) => self.deadline.arm(timeout),
            None => self.deadline.cancel(),
        }
    }

    fn resolve(&mut self, frame: Option<usize>) {
        self.deadline.cancel();
        let response = frame.map(|len| {
            self.stats.record_response();
            self.block.take_frame(len)
        });
        self.block.reset();
        if let Some(write) = self.in_flight.take() {
            let bytes = write.len();
            let latency = write.succeed(bytes, response);
            self.stats.record_write_succeeded(latency);
        }
    }

    fn handle_fail(&mut self, error: ConnectionError) {
        self.deadline.cancel();
        self.keepalive.clear_probe();
        self.stream = None;
        self.block.reset();

        match error.kind() {
            ErrorKind::Connect => self.stats.record_connect_failure(),
            ErrorKind::IdleTimeout => self.stats.record_idle_timeout(),
            _ => {}
        }
        warn!(conn = %self.conn, error = %error, timeout = error.is_timeout(), "Connection failed");

        if let Some(write) = self.in_flight.take() {
            self.stats.record_write_failed();
            write.fail(error);
        }
    }

    fn do_close(&mut self, drained: Vec<PendingWrite>) {
        self.exiting = true;
        self.deadline.cancel();
        self.keepalive.clear_probe();
        self.stream = None;
        self.block.release();

        let mut cancelled = drained.len() as u64;
        if let Some(write) = self.in_flight.take() {
            cancelled += 1;
            write.fail(ConnectionError::Cancelled);
        }
        fail_all(drained, || ConnectionError::Cancelled);
        self.stats.record_write_cancelled(cancelled);
        info!(conn = %self.conn, cancelled, "Connection closed");
    }

    // ========================================================================
    // Keep-alive helpers
    // ========================================================================

    async fn send_probe(&mut self, now: Instant) -> Result<()> {
        let Some(probe) = self.codec.probe_frame() else {
            return Err(ConnectionError::IdleTimeout(self.idle_for()));
        };
        let Some(stream) = self.stream.as_mut() else {
            return Err(ConnectionError::Write("socket closed".into()));
        };
        send_all(stream, &probe, self.keepalive.detection_interval()).await?;

        self.block.reset();
        self.keepalive.probe_sent(now);
        self.stats.record_probe();
        self.stats.record_sent(probe.len());
        debug!(conn = %self.conn, "Keep-alive probe sent");
        Ok(())
    }

    fn touch(&mut self) {
        self.shared.touch(Instant::now());
        self.keepalive.touch();
    }

    fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.shared.last_activity())
    }
}

async fn send_all(stream: &mut TcpStream, frame: &Bytes, limit: Duration) -> Result<()> {
    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Write(e.to_string())),
        Err(_) => Err(ConnectionError::Write(format!("probe not sent within {limit:?}"))),
    }
}
