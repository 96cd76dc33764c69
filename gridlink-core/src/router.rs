//! Destination router
//!
//! Resolves a logical destination node id to the next-hop connection.
//! Directly connected peers win; otherwise a learned route maps the
//! destination to a forwarding node. Entirely unknown destinations fail
//! without any transport I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown destination: {0}")]
    UnknownDestination(NodeId),

    #[error("next hop {via} for {destination} is not connected")]
    NextHopDown { destination: NodeId, via: NodeId },
}

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    /// destination → forwarding node that can reach it
    routes: RwLock<HashMap<NodeId, NodeId>>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Next-hop connection for `destination`, or a typed failure with no
    /// frame sent
    pub fn resolve(&self, destination: &str) -> Result<Arc<Connection>, RouteError> {
        if let Some(conn) = self.registry.get(destination) {
            return Ok(conn);
        }

        let via = self.routes.read().get(destination).cloned();
        match via {
            Some(via) => self
                .registry
                .get(&via)
                .ok_or_else(|| RouteError::NextHopDown {
                    destination: destination.to_string(),
                    via,
                }),
            None => Err(RouteError::UnknownDestination(destination.to_string())),
        }
    }

    /// Whether a frame for `destination` would be relayed rather than
    /// delivered directly
    pub fn is_relayed(&self, destination: &str) -> bool {
        self.registry.get(destination).is_none() && self.routes.read().contains_key(destination)
    }

    /// Record that `destination` is reachable through `via`
    pub fn learn_route(&self, destination: impl Into<NodeId>, via: impl Into<NodeId>) {
        let destination = destination.into();
        let via = via.into();
        debug!(%destination, %via, "learned route");
        self.routes.write().insert(destination, via);
    }

    pub fn forget_route(&self, destination: &str) {
        self.routes.write().remove(destination);
    }

    /// Drop every route that goes through `via` (e.g. when the forwarding
    /// node disconnects)
    pub fn forget_routes_via(&self, via: &str) {
        self.routes.write().retain(|_, v| v != via);
    }
}
