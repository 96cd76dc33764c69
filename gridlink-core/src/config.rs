//! Node configuration

use std::time::Duration;

use crate::types::{NodeId, WireFormat};

/// Configuration consumed by the engine for one node instance
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identity of this node in the protocol graph
    pub node_id: NodeId,

    /// Applied when a caller passes no per-request timeout
    pub default_request_timeout: Duration,

    /// Preferred wire format for outbound client connections
    pub wire_format: WireFormat,

    /// Initial reconnect delay for client connections
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            default_request_timeout: Duration::from_secs(30),
            wire_format: WireFormat::Json,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("CS001")
            .with_request_timeout(Duration::from_secs(10))
            .with_wire_format(WireFormat::Binary);

        assert_eq!(config.node_id, "CS001");
        assert_eq!(config.default_request_timeout, Duration::from_secs(10));
        assert_eq!(config.wire_format, WireFormat::Binary);
    }
}
