//! Node configuration.

use std::time::Duration;

/// Configuration for a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to listen on.
    pub host: String,

    /// Port to listen on. Port 0 asks the OS for a free port; the bound
    /// address is available from `Node::local_addr` once running.
    pub port: u16,

    /// Stable identifier of this node across the mesh.
    pub node_id: String,

    /// Upper bound on an outbound connection attempt.
    pub connect_timeout: Duration,

    /// Per-connection outbound queue depth.
    pub write_queue: usize,

    /// How many node events to retain for introspection.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 8000)
    }
}

impl NodeConfig {
    /// Creates a configuration listening on `host:port` with a port-derived
    /// node id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            node_id: format!("node_{port}"),
            connect_timeout: Duration::from_secs(5),
            write_queue: 32,
            event_capacity: 100,
        }
    }

    /// Builder: set the node id.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Builder: set the outbound connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set the per-connection outbound queue depth.
    pub fn with_write_queue(mut self, depth: usize) -> Self {
        self.write_queue = depth.max(1);
        self
    }

    /// Builder: set the retained event count.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Registry key used when `connect` is given no peer id.
pub fn default_peer_id(port: u16) -> String {
    format!("peer_{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.node_id, "node_8000");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn node_id_derived_from_port() {
        let config = NodeConfig::new("0.0.0.0", 9001);
        assert_eq!(config.node_id, "node_9001");
    }

    #[test]
    fn builders() {
        let config = NodeConfig::new("127.0.0.1", 9001)
            .with_node_id("financial_node_1")
            .with_connect_timeout(Duration::from_secs(2))
            .with_write_queue(8)
            .with_event_capacity(10);

        assert_eq!(config.node_id, "financial_node_1");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.write_queue, 8);
        assert_eq!(config.event_capacity, 10);
    }

    #[test]
    fn queue_and_capacity_floors() {
        let config = NodeConfig::default().with_write_queue(0).with_event_capacity(0);
        assert_eq!(config.write_queue, 1);
        assert_eq!(config.event_capacity, 1);
    }

    #[test]
    fn peer_id_derived_from_port() {
        assert_eq!(default_peer_id(9002), "peer_9002");
    }
}
