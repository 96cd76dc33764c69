//! Core types shared across the GridLink engine

use serde::{Deserialize, Serialize};

/// Unique identifier for a networking node (station, CSMS or relay)
pub type NodeId = String;

/// Wire encoding negotiated per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text frames (the default subprotocol)
    #[default]
    Json,
    /// Binary frames with length-prefixed payload blocks, for large transfers
    Binary,
}

/// Ordered hop path from origin to destination.
///
/// A direct single-hop delivery carries an empty `via` list aside from the
/// origin. Forwarding nodes append their own id when relaying, so the path
/// always records where the frame has been.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRouting {
    /// Final destination node
    pub destination: NodeId,
    /// Hops traversed so far, origin first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<NodeId>,
}

impl SourceRouting {
    /// Direct delivery to a single destination
    pub fn to(destination: impl Into<NodeId>) -> Self {
        Self {
            destination: destination.into(),
            via: Vec::new(),
        }
    }

    /// Path originating at `origin`, addressed to `destination`
    pub fn from_origin(origin: impl Into<NodeId>, destination: impl Into<NodeId>) -> Self {
        Self {
            destination: destination.into(),
            via: vec![origin.into()],
        }
    }

    /// The node that created the frame, when recorded
    pub fn origin(&self) -> Option<&str> {
        self.via.first().map(|s| s.as_str())
    }

    /// Whether `node` already appears in the hop path
    pub fn has_hop(&self, node: &str) -> bool {
        self.via.iter().any(|h| h == node)
    }

    /// Record a hop taken while forwarding
    pub fn push_hop(&mut self, node: impl Into<NodeId>) {
        self.via.push(node.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_routing_hops() {
        let mut path = SourceRouting::from_origin("csms", "CS001");
        assert_eq!(path.origin(), Some("csms"));
        assert!(!path.has_hop("relay-1"));

        path.push_hop("relay-1");
        assert!(path.has_hop("relay-1"));
        assert_eq!(path.via, vec!["csms".to_string(), "relay-1".to_string()]);
    }

    #[test]
    fn test_source_routing_serialization() {
        let path = SourceRouting::to("CS001");
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"{"destination":"CS001"}"#);

        let parsed: SourceRouting = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, path);
        assert!(parsed.via.is_empty());
    }
}
