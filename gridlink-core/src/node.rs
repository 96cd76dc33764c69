//! Node façade wiring the engine together
//!
//! Outbound: the correlation engine signs, encodes and routes. Inbound:
//! transport bytes are decoded, verified, and then either dispatched (frame
//! addressed to this node), correlated (response to one of our requests),
//! or forwarded unchanged to the next hop (relay role).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::connection::{Connection, WirePayload};
use crate::dispatch::{DispatchRegistry, InboundContext};
use crate::exchange::{CallOutcome, Exchange, Response};
use crate::frame::{ErrorCode, Frame, Payload};
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::signing::{SignaturePolicy, VerificationStatus};
use crate::types::{NodeId, SourceRouting, WireFormat};

/// Queue depth between the engine and a connection's writer task
const OUTBOUND_QUEUE: usize = 64;

/// One networking node: station, CSMS, or relay. The role is entirely
/// determined by which handlers are registered and which transports are
/// attached.
pub struct Node {
    config: NodeConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    policy: Arc<SignaturePolicy>,
    exchange: Arc<Exchange>,
    dispatch: Arc<DispatchRegistry>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(registry.clone()));
        let policy = Arc::new(SignaturePolicy::new());
        let exchange = Arc::new(Exchange::new(
            config.node_id.clone(),
            router.clone(),
            policy.clone(),
            config.default_request_timeout,
        ));

        Arc::new(Self {
            config,
            registry,
            router,
            policy,
            exchange,
            dispatch: Arc::new(DispatchRegistry::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn policy(&self) -> &Arc<SignaturePolicy> {
        &self.policy
    }

    pub fn dispatch(&self) -> &Arc<DispatchRegistry> {
        &self.dispatch
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Request/response call with the node's default timeout
    pub async fn call(&self, destination: &str, action: &str, payload: Payload) -> CallOutcome {
        self.exchange.call(destination, action, payload, None).await
    }

    pub async fn call_with_timeout(
        &self,
        destination: &str,
        action: &str,
        payload: Payload,
        timeout: Duration,
    ) -> CallOutcome {
        self.exchange
            .call(destination, action, payload, Some(timeout))
            .await
    }

    /// Fire-and-forget message
    pub async fn send(
        &self,
        destination: &str,
        action: &str,
        payload: Payload,
    ) -> Result<(), CallOutcome> {
        self.exchange.send(destination, action, payload).await
    }

    /// Register a transport session to `peer` and return it together with
    /// the outbound frame stream the transport driver must drain.
    ///
    /// Any existing session for the same peer is superseded and closed.
    pub fn open_link(
        &self,
        peer: impl Into<NodeId>,
        format: WireFormat,
    ) -> (Arc<Connection>, mpsc::Receiver<WirePayload>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn = Arc::new(Connection::new(
            peer.into(),
            self.registry.next_seq(),
            format,
            tx,
        ));
        self.registry.register(conn.clone());
        (conn, rx)
    }

    /// Tear down a session: close it, bulk-fail its pending requests with
    /// `NetworkError`, then drop it from the registry.
    pub fn connection_lost(&self, conn: &Arc<Connection>) {
        conn.close();
        self.exchange.fail_for_connection(conn);
        if self.registry.remove(conn) {
            self.router.forget_routes_via(conn.peer());
        }
    }

    /// Feed one inbound transport frame into the engine.
    ///
    /// Codec and transport faults never escape: malformed input is dropped
    /// with a log record (no message id is recoverable from it).
    pub async fn ingest(self: &Arc<Self>, conn: &Arc<Connection>, data: WirePayload) {
        let decoded = match &data {
            WirePayload::Text(text) => Frame::from_json_bytes(text.as_bytes()),
            WirePayload::Binary(bytes) => Frame::from_binary_bytes(bytes),
        };

        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = conn.peer(), %e, "dropping undecodable frame");
                return;
            }
        };

        // Relay role: a frame addressed elsewhere is forwarded unchanged
        // (payload untouched), with our hop appended to the path.
        if let Some(routing) = frame.extras().routing.as_ref() {
            if routing.destination != self.id() {
                self.forward(conn, frame).await;
                return;
            }
            // Learn the reverse path so replies to the far origin resolve
            if let Some(origin) = routing.origin() {
                if origin != conn.peer() && origin != self.id() {
                    self.router.learn_route(origin, conn.peer());
                }
            }
        }

        match frame {
            Frame::Call { .. } | Frame::Send { .. } => self.handle_inbound_call(conn, frame),
            Frame::CallResult { .. } | Frame::CallError { .. } | Frame::CallResultError { .. } => {
                self.handle_inbound_response(frame)
            }
        }
    }

    /// Forward a frame committed to another destination. The business
    /// payload is not decoded here.
    async fn forward(&self, conn: &Arc<Connection>, mut frame: Frame) {
        let destination = match frame.extras().routing.as_ref() {
            Some(r) => r.destination.clone(),
            None => return,
        };

        if let Some(routing) = frame.extras_mut().routing.as_mut() {
            if routing.has_hop(self.id()) {
                warn!(
                    message_id = frame.message_id(),
                    %destination,
                    "routing loop detected, dropping frame"
                );
                return;
            }
            // Learn the reverse path while relaying, so replies flowing
            // back through a chain of relays can resolve the origin
            if let Some(origin) = routing.origin() {
                if origin != conn.peer() && origin != self.id() {
                    self.router.learn_route(origin, conn.peer());
                }
            }
            routing.push_hop(self.id().to_string());
        }

        match self.router.resolve(&destination) {
            Ok(next) => {
                debug!(
                    message_id = frame.message_id(),
                    %destination,
                    next_hop = next.peer(),
                    "forwarding frame"
                );
                if let Err(e) = next.write(&frame).await {
                    warn!(%destination, %e, "failed to forward frame");
                }
            }
            Err(e) => {
                warn!(message_id = frame.message_id(), %e, "cannot forward frame");
            }
        }
    }

    /// Inbound CALL or SEND addressed to this node
    fn handle_inbound_call(self: &Arc<Self>, conn: &Arc<Connection>, frame: Frame) {
        let (message_id, action, payload, extras, wants_reply) = match frame {
            Frame::Call {
                message_id,
                action,
                payload,
                extras,
            } => (message_id, action, payload, extras, true),
            Frame::Send {
                message_id,
                action,
                payload,
                extras,
            } => (message_id, action, payload, extras, false),
            _ => return,
        };

        let outcome = self.policy.verify(&action, &payload, &extras.signatures);
        let routing = extras.routing;

        if outcome.should_reject() {
            warn!(
                %action,
                message_id,
                status = ?outcome.status,
                "rejecting frame with invalid signature"
            );
            if wants_reply {
                let reply = Frame::call_error(
                    message_id,
                    ErrorCode::SecurityError,
                    "signature verification failed",
                );
                let node = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    node.send_reply(&conn, routing.as_ref(), reply).await;
                });
            }
            return;
        }

        let source = routing
            .as_ref()
            .and_then(|r| r.origin())
            .unwrap_or(conn.peer())
            .to_string();

        let ctx = InboundContext {
            message_id,
            action,
            source,
            local_node: self.id().to_string(),
            verification: outcome.status,
        };

        // Handlers run in their own task so a slow one never blocks the
        // connection's receive loop for other in-flight requests.
        let node = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if wants_reply {
                let mut reply = node.dispatch.dispatch_call(&ctx, payload).await;
                if let Frame::CallResult {
                    payload, extras, ..
                } = &mut reply
                {
                    extras.signatures = node.policy.sign(&ctx.action, payload);
                }
                node.send_reply(&conn, routing.as_ref(), reply).await;
            } else {
                node.dispatch.dispatch_send(&ctx, payload).await;
            }
        });
    }

    /// Route a reply back toward the origin of the call it answers
    async fn send_reply(
        &self,
        conn: &Arc<Connection>,
        inbound_routing: Option<&SourceRouting>,
        mut reply: Frame,
    ) {
        if let Some(origin) = inbound_routing.and_then(|r| r.origin()) {
            if origin != conn.peer() {
                // The call came through a relay; address the reply and let
                // the router pick the next hop
                let origin = origin.to_string();
                reply.extras_mut().routing = Some(SourceRouting::from_origin(
                    self.id().to_string(),
                    origin.clone(),
                ));
                match self.router.resolve(&origin) {
                    Ok(next) => {
                        if let Err(e) = next.write(&reply).await {
                            warn!(%origin, %e, "failed to send routed reply");
                        }
                    }
                    Err(e) => warn!(%origin, %e, "cannot route reply to origin"),
                }
                return;
            }
        }

        if let Err(e) = conn.write(&reply).await {
            warn!(peer = conn.peer(), %e, "failed to send reply");
        }
    }

    /// Inbound CALLRESULT / CALLERROR / CALLRESULTERROR addressed to this
    /// node
    fn handle_inbound_response(&self, frame: Frame) {
        let (message_id, response, extras) = match frame {
            Frame::CallResult {
                message_id,
                payload,
                extras,
            } => (message_id, Response::Result(payload), extras),
            Frame::CallError {
                message_id, error, extras,
            }
            | Frame::CallResultError {
                message_id, error, extras,
            } => (message_id, Response::Error(error), extras),
            _ => return,
        };

        // The verification context is the action of the request this
        // response answers; an orphan has no context and is dropped here.
        let action = match self.exchange.pending_action(&message_id) {
            Some(action) => action,
            None => {
                debug!(message_id, "orphan response, ignoring");
                return;
            }
        };

        let verification = match &response {
            Response::Result(payload) => {
                let outcome = self.policy.verify(&action, payload, &extras.signatures);
                if outcome.should_reject() {
                    warn!(
                        message_id,
                        %action,
                        status = ?outcome.status,
                        "dropping response with invalid signature"
                    );
                    return;
                }
                outcome.status
            }
            // Error frames carry no payload to verify
            Response::Error(_) => VerificationStatus::Unverified,
        };

        self.exchange.resolve(&message_id, response, verification);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.node_id)
            .field("connections", &self.registry.len())
            .finish()
    }
}
