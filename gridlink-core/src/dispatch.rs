//! Inbound action dispatch
//!
//! Maps action strings to locally registered handlers and produces reply
//! frames. Per action there is exactly one handler, which produces the
//! canonical reply, plus any number of observers that are fanned out in
//! registration order and never reply.
//!
//! The map is built at initialization and mutated explicitly; nothing is
//! populated reflectively at call time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{ErrorCode, Frame, Payload};
use crate::signing::VerificationStatus;
use crate::types::NodeId;

/// Context handed to handlers and observers for one inbound frame
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub message_id: String,
    pub action: String,
    /// Node that originated the frame (the far origin when relayed, not the
    /// direct peer)
    pub source: NodeId,
    /// Node the handler runs on
    pub local_node: NodeId,
    /// Signature check outcome for the inbound payload
    pub verification: VerificationStatus,
}

/// Handler failure, converted to a CALLRESULTERROR at the dispatch boundary.
/// Raw faults never reach the transport.
#[derive(Debug, Error)]
pub enum HandlerFault {
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl HandlerFault {
    pub fn internal(reason: impl Into<String>) -> Self {
        HandlerFault::Internal(reason.into())
    }
}

/// Produces the canonical reply payload for one action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &InboundContext, payload: Payload) -> Result<Payload, HandlerFault>;
}

/// Passive subscriber: sees the inbound payload, never replies
#[async_trait]
pub trait ActionObserver: Send + Sync {
    async fn observe(&self, ctx: &InboundContext, payload: &Payload);
}

/// Wrap an async closure as an [`ActionHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(InboundContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerFault>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> ActionHandler for FnHandler<F>
    where
        F: Fn(InboundContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerFault>> + Send + 'static,
    {
        async fn handle(
            &self,
            ctx: &InboundContext,
            payload: Payload,
        ) -> Result<Payload, HandlerFault> {
            (self.0)(ctx.clone(), payload).await
        }
    }

    Arc::new(FnHandler(f))
}

struct ActionEntry {
    handler: Arc<dyn ActionHandler>,
    observers: Vec<Arc<dyn ActionObserver>>,
}

/// Action-string → handler/observer map for one node
#[derive(Default)]
pub struct DispatchRegistry {
    actions: RwLock<HashMap<String, ActionEntry>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the canonical handler for an action, replacing any previous
    /// one. Observers already subscribed to the action are kept.
    pub fn register(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action = action.into();
        let mut actions = self.actions.write();
        match actions.get_mut(&action) {
            Some(entry) => entry.handler = handler,
            None => {
                actions.insert(
                    action,
                    ActionEntry {
                        handler,
                        observers: Vec::new(),
                    },
                );
            }
        }
    }

    /// Subscribe an observer to an action. Observers run in registration
    /// order, before the canonical reply is produced. Subscribing to an
    /// action with no handler is an error surfaced at registration time.
    pub fn subscribe(
        &self,
        action: &str,
        observer: Arc<dyn ActionObserver>,
    ) -> Result<(), UnknownAction> {
        let mut actions = self.actions.write();
        match actions.get_mut(action) {
            Some(entry) => {
                entry.observers.push(observer);
                Ok(())
            }
            None => Err(UnknownAction(action.to_string())),
        }
    }

    pub fn registered_actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.actions.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    fn lookup(&self, action: &str) -> Option<(Arc<dyn ActionHandler>, Vec<Arc<dyn ActionObserver>>)> {
        self.actions
            .read()
            .get(action)
            .map(|e| (e.handler.clone(), e.observers.clone()))
    }

    /// Dispatch an inbound CALL and produce its reply frame.
    ///
    /// Unknown action → CALLERROR `NotImplemented`. Handler fault →
    /// CALLRESULTERROR `InternalError`. Exactly one reply per call,
    /// regardless of observer count.
    pub async fn dispatch_call(&self, ctx: &InboundContext, payload: Payload) -> Frame {
        let (handler, observers) = match self.lookup(&ctx.action) {
            Some(entry) => entry,
            None => {
                warn!(action = %ctx.action, source = %ctx.source, "no handler for action");
                return Frame::call_error(
                    ctx.message_id.clone(),
                    ErrorCode::NotImplemented,
                    format!("action {} is not implemented", ctx.action),
                );
            }
        };

        for observer in observers {
            observer.observe(ctx, &payload).await;
        }

        match handler.handle(ctx, payload).await {
            Ok(reply) => Frame::call_result(ctx.message_id.clone(), reply),
            Err(fault) => {
                warn!(action = %ctx.action, %fault, "handler fault");
                Frame::call_result_error(
                    ctx.message_id.clone(),
                    ErrorCode::InternalError,
                    fault.to_string(),
                )
            }
        }
    }

    /// Dispatch an inbound SEND: same lookup and fan-out, but no reply is
    /// ever produced.
    pub async fn dispatch_send(&self, ctx: &InboundContext, payload: Payload) {
        let (handler, observers) = match self.lookup(&ctx.action) {
            Some(entry) => entry,
            None => {
                debug!(action = %ctx.action, "no handler for send, dropping");
                return;
            }
        };

        for observer in observers {
            observer.observe(ctx, &payload).await;
        }

        if let Err(fault) = handler.handle(ctx, payload).await {
            warn!(action = %ctx.action, %fault, "handler fault on send frame");
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);
