//! Node-level events and the bounded event log.
//!
//! Alert and chat envelopes are terminal observations: the node surfaces
//! them here and forwards nothing into the mesh. Peer churn lands here too,
//! so a UI or status collaborator can render what the node has seen lately.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};

use finmesh_protocol::{AlertRecord, ChatPayload};

/// Something the node observed that a local consumer may care about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A peer entered the registry.
    PeerRegistered { peer_id: String },
    /// A peer left the registry (closed connection or failed send).
    PeerDisconnected { peer_id: String },
    /// Alert records arrived from a peer.
    AlertReceived {
        sender_id: String,
        alerts: Vec<AlertRecord>,
    },
    /// A shared chat exchange arrived from a peer.
    ChatReceived {
        sender_id: String,
        chat: ChatPayload,
    },
}

/// A retained event with its capture time.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// When the node observed the event.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub event: NodeEvent,
}

/// Capacity-bounded event history plus live fan-out.
///
/// Only the most recent `capacity` records are retained; subscribers that
/// fall behind the broadcast channel miss events rather than block the node.
pub(crate) struct EventLog {
    capacity: usize,
    records: RwLock<VecDeque<EventRecord>>,
    tx: broadcast::Sender<NodeEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            capacity,
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            tx,
        }
    }

    /// Records an event and fans it out to any live subscribers.
    pub async fn publish(&self, event: NodeEvent) {
        let record = EventRecord {
            at: Utc::now(),
            event: event.clone(),
        };

        let mut records = self.records.write().await;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        drop(records);

        // No subscribers is the normal case, not an error.
        let _ = self.tx.send(event);
    }

    /// Returns the retained history, oldest first.
    pub async fn recent(&self) -> Vec<EventRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    /// Subscribes to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_caps_at_capacity() {
        let log = EventLog::new(3);
        for i in 0..10 {
            log.publish(NodeEvent::PeerRegistered {
                peer_id: format!("peer_{i}"),
            })
            .await;
        }

        let recent = log.recent().await;
        assert_eq!(recent.len(), 3);
        match &recent[0].event {
            NodeEvent::PeerRegistered { peer_id } => assert_eq!(peer_id, "peer_7"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscriber_observes_events() {
        let log = EventLog::new(10);
        let mut rx = log.subscribe();

        log.publish(NodeEvent::PeerDisconnected {
            peer_id: "peer_1".to_string(),
        })
        .await;

        match rx.recv().await.unwrap() {
            NodeEvent::PeerDisconnected { peer_id } => assert_eq!(peer_id, "peer_1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = NodeEvent::AlertReceived {
            sender_id: "node_a".to_string(),
            alerts: vec![AlertRecord::new("low_balance", "balance below threshold")],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "alert_received");
        assert_eq!(value["alerts"][0]["type"], "low_balance");
    }
}
