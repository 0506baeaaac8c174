//! Tunnel session
//!
//! A session owns one hijacked connection and multiplexes many concurrent
//! request/response exchanges over it. Lifecycle: Connected (handshake done,
//! waiting for the client's Ready frame) -> Ready (requests flow) -> Closed.
//! While Connected, dispatched requests wait in a bounded queue; the queue is
//! drained in order when the Ready frame arrives. A single writer task
//! serializes request frames onto the wire; a single reader task routes
//! response frames back to their waiters by request id.

use crate::config::RelayConfig;
use crate::pending::{InFlight, PendingRequest};
use lobber_proto::{codec, Request, Response};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Extra time a waiter is given beyond the queue TTL before its dispatch
/// times out with a 504.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the channel feeding the writer task.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Lifecycle state of a tunnel session. Transitions are monotone:
/// Connected -> Ready -> Closed, or Connected -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection established, waiting for the client's Ready frame.
    Connected,
    /// Ready frame received, requests go straight to the wire.
    Ready,
    /// Connection closed. Terminal.
    Closed,
}

/// Dispatch failures, mapped to HTTP status codes by the public handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Pre-ready queue full. Maps to 503 with `Retry-After: 1`.
    #[error("tunnel not ready, queue full")]
    Overloaded,

    /// Session closed before the request completed. Maps to 502.
    #[error("tunnel closed")]
    Closed,

    /// No response from the remote within the deadline. Maps to 504.
    #[error("tunnel response timeout")]
    ResponseTimeout,
}

/// Cleanup hook invoked exactly once when the session closes. It receives
/// the closing session so cleanup can be scoped to that exact instance.
pub type OnClose = Box<dyn FnOnce(&TunnelSession) + Send>;

/// Channel ends held between construction and `start`.
struct IoChannels {
    req_rx: mpsc::Receiver<PendingRequest>,
    shutdown_rx: watch::Receiver<bool>,
}

/// One live tunnel: one connection, one hostname, one user identity.
pub struct TunnelSession {
    domain: String,
    user_id: String,
    max_pending_queue: usize,
    pending_queue_ttl: Duration,
    state: RwLock<SessionState>,
    pending_queue: Mutex<VecDeque<PendingRequest>>,
    in_flight: InFlight,
    req_tx: mpsc::Sender<PendingRequest>,
    shutdown: watch::Sender<bool>,
    on_close: Mutex<Option<OnClose>>,
    io: Mutex<Option<IoChannels>>,
}

impl TunnelSession {
    /// Create a session in Connected state, without touching the wire. The
    /// `on_close` hook (typically registry unregistration) runs exactly once,
    /// on whichever path closes the session first. Dispatches queue from the
    /// moment of construction; nothing moves until `start` attaches the
    /// hijacked connection.
    pub fn new(
        domain: String,
        user_id: String,
        config: &RelayConfig,
        on_close: Option<OnClose>,
    ) -> Arc<Self> {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            domain,
            user_id,
            max_pending_queue: config.max_pending_queue,
            pending_queue_ttl: config.pending_queue_ttl,
            state: RwLock::new(SessionState::Connected),
            pending_queue: Mutex::new(VecDeque::new()),
            in_flight: InFlight::new(),
            req_tx,
            shutdown,
            on_close: Mutex::new(on_close),
            io: Mutex::new(Some(IoChannels {
                req_rx,
                shutdown_rx,
            })),
        })
    }

    /// Attach the hijacked connection and start the I/O tasks. The reader
    /// task consumes exactly one Ready frame, drains the pre-ready queue,
    /// then demultiplexes responses until the connection dies. Callers
    /// register the session before starting it, so it is reachable before
    /// it can close itself. A second call is a no-op.
    pub fn start<R, W>(self: Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(channels) = self.io.lock().unwrap().take() else {
            warn!(domain = %self.domain, "session already started");
            return;
        };

        tokio::spawn(Self::write_loop(
            self.clone(),
            writer,
            channels.req_rx,
            channels.shutdown_rx.clone(),
        ));
        tokio::spawn(Self::read_loop(self, reader, channels.shutdown_rx));
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// Perform one request/response exchange. Blocks the caller until the
    /// response arrives, the session closes, or the deadline (queue TTL plus
    /// a grace period) elapses. Synthetic responses produced on close or
    /// queue expiry are returned as ordinary responses.
    pub async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        let (pending_request, response_rx) = PendingRequest::new(request);
        let deadline = self.pending_queue_ttl + RESPONSE_GRACE;

        let mut pending = Some(pending_request);
        while let Some(pr) = pending.take() {
            match self.state() {
                SessionState::Closed => return Err(DispatchError::Closed),
                SessionState::Ready => {
                    if self.req_tx.send(pr).await.is_err() {
                        return Err(DispatchError::Closed);
                    }
                }
                SessionState::Connected => {
                    let mut queue = self.pending_queue.lock().unwrap();
                    // Recheck under the queue lock so an entry can never be
                    // added after close() or the ready drain swept the queue.
                    match self.state() {
                        SessionState::Connected => {
                            if queue.len() >= self.max_pending_queue {
                                return Err(DispatchError::Overloaded);
                            }
                            queue.push_back(pr);
                        }
                        SessionState::Ready => {
                            drop(queue);
                            pending = Some(pr);
                        }
                        SessionState::Closed => return Err(DispatchError::Closed),
                    }
                }
            }
        }

        match tokio::time::timeout(deadline, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => Err(DispatchError::ResponseTimeout),
        }
    }

    /// Close the session. Idempotent: the first caller flips the state, wakes
    /// the I/O tasks (dropping their halves closes the connection), fails
    /// every queued and in-flight request, and runs the on-close hook.
    pub fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        let _ = self.shutdown.send(true);

        let drained: Vec<PendingRequest> =
            { self.pending_queue.lock().unwrap().drain(..).collect() };
        debug!(
            domain = %self.domain,
            queued = drained.len(),
            in_flight = self.in_flight.len(),
            "failing outstanding requests"
        );
        for pr in drained {
            pr.fail(503, "tunnel closed");
        }
        self.in_flight.fail_all(503, "tunnel closed");

        let callback = self.on_close.lock().unwrap().take();
        if let Some(on_close) = callback {
            on_close(self);
        }

        info!(domain = %self.domain, user_id = %self.user_id, "tunnel session closed");
    }

    /// Remove the on-close hook without running it. Used when a session is
    /// replaced so its close cannot unregister its replacement.
    pub(crate) fn detach_on_close(&self) -> Option<OnClose> {
        self.on_close.lock().unwrap().take()
    }

    fn mark_ready(&self) -> bool {
        let mut state = self.state.write().unwrap();
        match *state {
            SessionState::Connected => {
                *state = SessionState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Hand queued requests to the writer in FIFO order. Entries that aged
    /// past the TTL are failed and never touch the wire.
    async fn drain_pending_queue(&self) {
        let drained: Vec<PendingRequest> =
            { self.pending_queue.lock().unwrap().drain(..).collect() };

        for pr in drained {
            if pr.queued_at.elapsed() > self.pending_queue_ttl {
                debug!(
                    domain = %self.domain,
                    id = %pr.request.id,
                    "queued request expired before tunnel became ready"
                );
                pr.fail(503, "request timeout in queue");
                continue;
            }
            if let Err(mpsc::error::SendError(pr)) = self.req_tx.send(pr).await {
                pr.fail(503, "tunnel closed");
            }
        }
    }

    async fn read_loop<R>(session: Arc<Self>, reader: R, mut shutdown_rx: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);

        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            ready = codec::read_ready(&mut reader) => {
                if let Err(e) = ready {
                    debug!(domain = %session.domain, "waiting for ready frame: {e}");
                    session.close();
                    return;
                }
            }
        }

        if !session.mark_ready() {
            return;
        }
        info!(domain = %session.domain, "tunnel ready");
        session.drain_pending_queue().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                response = codec::read_response(&mut reader) => match response {
                    Ok(response) => {
                        session.in_flight.complete(response);
                    }
                    Err(e) => {
                        debug!(domain = %session.domain, "read loop ending: {e}");
                        break;
                    }
                }
            }
        }

        session.close();
    }

    async fn write_loop<W>(
        session: Arc<Self>,
        writer: W,
        mut req_rx: mpsc::Receiver<PendingRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut writer = BufWriter::new(writer);

        loop {
            let pr = tokio::select! {
                _ = shutdown_rx.changed() => break,
                maybe = req_rx.recv() => match maybe {
                    Some(pr) => pr,
                    None => break,
                },
            };

            if session.state() == SessionState::Closed {
                pr.fail(503, "tunnel closed");
                continue;
            }

            let PendingRequest {
                request, responder, ..
            } = pr;
            session.in_flight.insert(request.id.clone(), responder);

            if let Err(e) = codec::write_request(&mut writer, &request).await {
                warn!(domain = %session.domain, id = %request.id, "request write failed: {e}");
                session.in_flight.fail(&request.id, 502, "tunnel write error");
                session.close();
                break;
            }
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        // Tasks hold Arcs to the session, so by the time this runs they are
        // gone; closing here only covers a session that never registered.
        let _ = self.shutdown.send(true);
    }
}
