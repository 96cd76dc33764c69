//! Request/response correlation engine
//!
//! Allocates message ids, tracks pending requests, matches inbound
//! responses and enforces timeouts. Each node instance owns its own pending
//! table; there is no global state.
//!
//! A caller of [`Exchange::call`] suspends until one of exactly three
//! outcomes resolves its pending entry: a correlated response arrives
//! (`ResultCode::Ok`), the deadline elapses (`ResultCode::Timeout`), or the
//! owning connection is lost (`ResultCode::NetworkError`). Each entry is
//! resolved at most once; late or duplicate responses are orphans.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::frame::{ErrorDetail, Frame, Payload};
use crate::router::Router;
use crate::signing::{SignaturePolicy, VerificationStatus};
use crate::types::{NodeId, SourceRouting};

/// Protocol-level outcome of a send-style operation.
///
/// Distinct from business-level status: a rejected reset still completes
/// with `Ok`. Callers must check this before interpreting the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Timeout,
    NetworkError,
}

/// The correlated answer to a call
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// CALLRESULT payload
    Result(Payload),
    /// CALLERROR / CALLRESULTERROR triple
    Error(ErrorDetail),
}

/// What a caller of [`Exchange::call`] gets back
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub code: ResultCode,
    /// Present only when `code == Ok`
    pub response: Option<Response>,
    /// Signature check result for the response payload
    pub verification: VerificationStatus,
    /// Human-readable detail for Timeout / NetworkError
    pub detail: Option<String>,
}

impl CallOutcome {
    fn ok(response: Response, verification: VerificationStatus) -> Self {
        Self {
            code: ResultCode::Ok,
            response: Some(response),
            verification,
            detail: None,
        }
    }

    fn timeout() -> Self {
        Self {
            code: ResultCode::Timeout,
            response: None,
            verification: VerificationStatus::Unverified,
            detail: Some("no response before deadline".into()),
        }
    }

    fn network_error(detail: impl Into<String>) -> Self {
        Self {
            code: ResultCode::NetworkError,
            response: None,
            verification: VerificationStatus::Unverified,
            detail: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }

    /// Parse the result payload as a typed response. `None` when the
    /// outcome is not `Ok` with a CALLRESULT, or when parsing fails.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        match &self.response {
            Some(Response::Result(payload)) => payload.parse().ok(),
            _ => None,
        }
    }

    /// The peer's error triple, when the outcome is `Ok` with an error frame
    pub fn remote_error(&self) -> Option<&ErrorDetail> {
        match &self.response {
            Some(Response::Error(e)) => Some(e),
            _ => None,
        }
    }
}

enum Resolution {
    Answered(Response, VerificationStatus),
    ConnectionLost,
}

struct PendingRequest {
    destination: NodeId,
    action: String,
    /// Session seq of the connection the request went out on
    conn_seq: u64,
    tx: oneshot::Sender<Resolution>,
}

/// Per-node correlation engine
pub struct Exchange {
    node_id: NodeId,
    router: Arc<Router>,
    policy: Arc<SignaturePolicy>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    default_timeout: Duration,
}

impl Exchange {
    pub fn new(
        node_id: NodeId,
        router: Arc<Router>,
        policy: Arc<SignaturePolicy>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            router,
            policy,
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Issue a request and suspend until response, timeout, or connection
    /// loss.
    ///
    /// An unresolvable destination returns `NetworkError` immediately; no
    /// message id is consumed and nothing touches the transport.
    pub async fn call(
        &self,
        destination: &str,
        action: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        let conn = match self.router.resolve(destination) {
            Ok(conn) => conn,
            Err(e) => return CallOutcome::network_error(e.to_string()),
        };

        let message_id = Uuid::new_v4().to_string();
        let signatures = self.policy.sign(action, &payload);

        let mut frame = Frame::call(message_id.clone(), action, payload).with_signatures(signatures);
        if conn.peer() != destination {
            // Relayed: annotate with the hop path so forwarding nodes and
            // the responder can route
            frame.extras_mut().routing = Some(SourceRouting::from_origin(
                self.node_id.clone(),
                destination,
            ));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            message_id.clone(),
            PendingRequest {
                destination: destination.to_string(),
                action: action.to_string(),
                conn_seq: conn.seq(),
                tx,
            },
        );

        if let Err(e) = conn.write(&frame).await {
            self.pending.lock().remove(&message_id);
            return CallOutcome::network_error(format!(
                "failed to send to {}: {}",
                destination, e
            ));
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Resolution::Answered(response, verification))) => {
                CallOutcome::ok(response, verification)
            }
            Ok(Ok(Resolution::ConnectionLost)) | Ok(Err(_)) => {
                CallOutcome::network_error(format!("connection to {} lost", destination))
            }
            Err(_elapsed) => {
                // Release the slot; a response arriving later is an orphan
                self.pending.lock().remove(&message_id);
                debug!(message_id, destination, action, "request timed out");
                CallOutcome::timeout()
            }
        }
    }

    /// Fire-and-forget SEND frame: never correlated, no reply expected
    pub async fn send(
        &self,
        destination: &str,
        action: &str,
        payload: Payload,
    ) -> Result<(), CallOutcome> {
        let conn = match self.router.resolve(destination) {
            Ok(conn) => conn,
            Err(e) => return Err(CallOutcome::network_error(e.to_string())),
        };

        let message_id = Uuid::new_v4().to_string();
        let signatures = self.policy.sign(action, &payload);
        let mut frame = Frame::send(message_id, action, payload).with_signatures(signatures);
        if conn.peer() != destination {
            frame.extras_mut().routing = Some(SourceRouting::from_origin(
                self.node_id.clone(),
                destination,
            ));
        }

        conn.write(&frame)
            .await
            .map_err(|e| CallOutcome::network_error(format!("failed to send: {}", e)))
    }

    /// Action of the pending request for `message_id`, if one is live.
    /// Used as the verification context for its response.
    pub fn pending_action(&self, message_id: &str) -> Option<String> {
        self.pending
            .lock()
            .get(message_id)
            .map(|p| p.action.clone())
    }

    /// Resolve a pending entry with an inbound response. Returns false for
    /// orphans (already resolved, expired, or never sent); the caller's
    /// continuation can never fire twice.
    pub fn resolve(
        &self,
        message_id: &str,
        response: Response,
        verification: VerificationStatus,
    ) -> bool {
        match self.pending.lock().remove(message_id) {
            Some(entry) => {
                let _ = entry.tx.send(Resolution::Answered(response, verification));
                true
            }
            None => {
                debug!(message_id, "orphan response, ignoring");
                false
            }
        }
    }

    /// Bulk-fail every pending request that went out on the given
    /// connection session. Called on connection loss.
    pub fn fail_for_connection(&self, conn: &Connection) {
        let mut pending = self.pending.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.conn_seq == conn.seq())
            .map(|(id, _)| id.clone())
            .collect();

        if !ids.is_empty() {
            warn!(
                peer = conn.peer(),
                count = ids.len(),
                "failing pending requests on lost connection"
            );
        }
        for id in ids {
            if let Some(entry) = pending.remove(&id) {
                debug!(message_id = %id, destination = %entry.destination, "pending request failed");
                let _ = entry.tx.send(Resolution::ConnectionLost);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
