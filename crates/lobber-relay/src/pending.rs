//! Pending request tracking
//!
//! A `PendingRequest` pairs a tunnel request with the capacity-one slot its
//! public-side waiter blocks on. The `InFlight` table holds the slots of
//! requests already written to the wire, keyed by request id, and routes
//! each incoming response to its waiter.

use dashmap::DashMap;
use lobber_proto::{Request, Response};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A request waiting for its response, either in the pre-ready queue or in
/// the in-flight table.
pub(crate) struct PendingRequest {
    pub request: Request,
    pub responder: oneshot::Sender<Response>,
    pub queued_at: Instant,
}

impl PendingRequest {
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                responder: tx,
                queued_at: Instant::now(),
            },
            rx,
        )
    }

    /// Complete the waiter with a relay-produced response. A waiter that
    /// already gave up is ignored.
    pub fn fail(self, status_code: u16, message: &str) {
        let response = Response::synthetic(&self.request.id, status_code, message);
        if self.responder.send(response).is_err() {
            debug!(id = %self.request.id, "waiter gone before synthetic response");
        }
    }
}

/// Requests written to the wire but not yet answered, keyed by request id.
pub(crate) struct InFlight {
    requests: DashMap<String, oneshot::Sender<Response>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
        }
    }

    /// Track a request about to be written to the wire.
    pub fn insert(&self, id: String, responder: oneshot::Sender<Response>) {
        self.requests.insert(id, responder);
    }

    /// Route a response to its waiter. Returns false if the id matched no
    /// in-flight request or the waiter already gave up; either way the read
    /// loop carries on.
    pub fn complete(&self, response: Response) -> bool {
        let id = response.id.clone();
        match self.requests.remove(&id) {
            Some((_, responder)) => {
                if responder.send(response).is_err() {
                    warn!(%id, "response arrived after waiter gave up");
                    return false;
                }
                true
            }
            None => {
                warn!(%id, "response matches no in-flight request, dropping");
                false
            }
        }
    }

    /// Fail one in-flight request with a synthetic response.
    pub fn fail(&self, id: &str, status_code: u16, message: &str) {
        if let Some((id, responder)) = self.requests.remove(id) {
            let _ = responder.send(Response::synthetic(&id, status_code, message));
        }
    }

    /// Fail every in-flight request. Used on session close so no waiter is
    /// left blocked.
    pub fn fail_all(&self, status_code: u16, message: &str) {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.fail(&id, status_code, message);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
