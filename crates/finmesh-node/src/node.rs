//! The peer node: listener lifecycle, outbound connections, dispatch,
//! and broadcast/unicast sending.
//!
//! A [`Node`] is a cheap clone over shared state, so collaborators (the
//! chatbot, the alert monitor, a status page) can each hold a handle without
//! owning the node. One task runs the accept loop; every connection gets its
//! own receive loop plus a writer task, so no peer can stall another.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use finmesh_protocol::{
    AlertRecord, ChatPayload, DiscoveryAction, DiscoveryPayload, Envelope, HeartbeatPayload,
    MessageKind, ProtocolError,
};

use crate::config::{NodeConfig, default_peer_id};
use crate::connection;
use crate::error::{NodeError, NodeResult};
use crate::events::{EventLog, EventRecord, NodeEvent};
use crate::registry::{PeerRegistry, PeerSender};

/// Lifecycle states of a node.
///
/// `Stopped` is terminal; a stopped node is not restarted, a new one is
/// constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, not yet listening.
    Idle,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutdown requested, accept loop winding down.
    Stopping,
    /// Listener released.
    Stopped,
}

/// Result of one broadcast sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// The registry was empty; nothing was attempted.
    NoPeers,
    /// Delivery was attempted to every registered peer; `failed` lists the
    /// peers that were removed because their connection was gone.
    Delivered { sent: usize, failed: Vec<String> },
}

impl BroadcastOutcome {
    /// True when there was no peer to deliver to.
    pub fn is_no_peers(&self) -> bool {
        matches!(self, Self::NoPeers)
    }

    /// Number of peers the envelope was handed to.
    pub fn sent(&self) -> usize {
        match self {
            Self::NoPeers => 0,
            Self::Delivered { sent, .. } => *sent,
        }
    }

    /// Peers whose delivery failed during the sweep.
    pub fn failed(&self) -> &[String] {
        match self {
            Self::NoPeers => &[],
            Self::Delivered { failed, .. } => failed,
        }
    }
}

struct NodeInner {
    config: NodeConfig,
    state: RwLock<NodeState>,
    registry: PeerRegistry,
    events: EventLog,
    shutdown_tx: watch::Sender<bool>,
    ready_tx: watch::Sender<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// A node in the mesh.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Creates an idle node from the given configuration.
    pub fn new(config: NodeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (ready_tx, _) = watch::channel(false);
        let event_capacity = config.event_capacity;
        Self {
            inner: Arc::new(NodeInner {
                config,
                state: RwLock::new(NodeState::Idle),
                registry: PeerRegistry::new(),
                events: EventLog::new(event_capacity),
                shutdown_tx,
                ready_tx,
                local_addr: RwLock::new(None),
            }),
        }
    }

    /// This node's identifier across the mesh.
    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// The configuration the node was built with.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> NodeState {
        *self.inner.state.read().await
    }

    /// True while the accept loop is live.
    pub async fn is_running(&self) -> bool {
        *self.inner.state.read().await == NodeState::Running
    }

    /// The bound listener address, once running. With port 0 in the config
    /// this is where the OS-assigned port shows up.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().await
    }

    /// Suspends until the listener is bound and accepting.
    pub async fn wait_ready(&self) {
        let mut ready_rx = self.inner.ready_tx.subscribe();
        while !*ready_rx.borrow_and_update() {
            if ready_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Binds the listener and accepts connections until stopped.
    ///
    /// Valid from `Idle` only; from any other state this logs and returns
    /// `Ok(false)` without touching the running node. The call suspends for
    /// the node's whole lifetime, so callers normally spawn it and use
    /// [`Node::wait_ready`] before the first `connect`. Returns `Ok(true)`
    /// after a clean shutdown.
    pub async fn start(&self) -> NodeResult<bool> {
        {
            let mut state = self.inner.state.write().await;
            if *state != NodeState::Idle {
                warn!(
                    node_id = %self.node_id(),
                    state = ?*state,
                    "start ignored: node is not idle"
                );
                return Ok(false);
            }
            *state = NodeState::Starting;
        }

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        let bind_addr = (self.inner.config.host.as_str(), self.inner.config.port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    host = %self.inner.config.host,
                    port = self.inner.config.port,
                    error = %e,
                    "failed to bind listener"
                );
                *self.inner.state.write().await = NodeState::Idle;
                return Err(e.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                *self.inner.state.write().await = NodeState::Idle;
                return Err(e.into());
            }
        };

        *self.inner.local_addr.write().await = Some(local_addr);
        *self.inner.state.write().await = NodeState::Running;
        self.inner.ready_tx.send_replace(true);
        info!(node_id = %self.node_id(), addr = %local_addr, "node listening");

        // stop() may have raced the bind; honor it before accepting anything.
        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "accepted inbound connection");
                        let (outbound, read_half) =
                            connection::open(stream, self.inner.config.write_queue);
                        let node = self.clone();
                        tokio::spawn(async move {
                            node.receive_loop(read_half, outbound, None).await;
                        });
                    }
                    Err(e) => {
                        // Keep accepting despite errors.
                        error!(error = %e, "failed to accept connection");
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        *self.inner.state.write().await = NodeState::Stopped;
        info!(node_id = %self.node_id(), "node stopped");
        Ok(true)
    }

    /// Opens an outbound connection, registers the peer, and runs the
    /// discovery handshake.
    ///
    /// The peer is keyed by `peer_id` when given, else `peer_{port}`. The
    /// attempt is bounded by the configured connect timeout and is never
    /// retried here. Returns the registry key on success.
    pub async fn connect(
        &self,
        peer_host: &str,
        peer_port: u16,
        peer_id: Option<String>,
    ) -> NodeResult<String> {
        let addr = format!("{peer_host}:{peer_port}");
        let attempt = TcpStream::connect(addr.as_str());
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(addr = %addr, error = %e, "outbound connection failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(addr = %addr, "outbound connection timed out");
                return Err(NodeError::ConnectTimeout {
                    addr,
                    timeout: self.inner.config.connect_timeout,
                });
            }
        };

        let peer_id = peer_id.unwrap_or_else(|| default_peer_id(peer_port));
        let (outbound, read_half) = connection::open(stream, self.inner.config.write_queue);

        self.inner.registry.register(&peer_id, outbound.clone()).await;

        let join = Envelope::broadcast(
            MessageKind::Discovery,
            payload_value(&DiscoveryPayload::join(self.node_id())),
            self.node_id(),
        );
        if outbound.send(join).await.is_err() {
            self.inner.registry.remove_if_same(&peer_id, &outbound).await;
            warn!(peer_id = %peer_id, addr = %addr, "connection lost before discovery");
            return Err(NodeError::unreachable(peer_id));
        }

        info!(peer_id = %peer_id, addr = %addr, "connected to peer");
        self.inner
            .events
            .publish(NodeEvent::PeerRegistered {
                peer_id: peer_id.clone(),
            })
            .await;

        let node = self.clone();
        let loop_outbound = outbound.clone();
        let loop_peer = peer_id.clone();
        tokio::spawn(async move {
            node.receive_loop(read_half, loop_outbound, Some(loop_peer)).await;
        });

        Ok(peer_id)
    }

    /// Requests shutdown. Idempotent, valid from any state.
    ///
    /// Only the listener is affected; live peer connections keep their
    /// receive loops and are reclaimed individually when they close or a
    /// send to them fails.
    pub async fn stop(&self) {
        let mut state = self.inner.state.write().await;
        match *state {
            NodeState::Stopping | NodeState::Stopped => {
                debug!(node_id = %self.node_id(), "stop ignored: already stopped");
            }
            NodeState::Idle => {
                *state = NodeState::Stopped;
                info!(node_id = %self.node_id(), "node stopped before starting");
            }
            NodeState::Starting | NodeState::Running => {
                *state = NodeState::Stopping;
                drop(state);
                self.inner.shutdown_tx.send_replace(true);
                info!(node_id = %self.node_id(), "node stopping");
            }
        }
    }

    /// Sends an envelope to a single registered peer.
    ///
    /// A `target_id` absent from the registry is a contract violation and
    /// comes back as [`NodeError::UnknownPeer`]. A write failure removes the
    /// peer and reports [`NodeError::PeerUnreachable`].
    pub async fn send(&self, kind: MessageKind, content: Value, target_id: &str) -> NodeResult<()> {
        let Some(outbound) = self.inner.registry.get(target_id).await else {
            return Err(NodeError::unknown_peer(target_id));
        };

        let envelope = Envelope::addressed(kind, content, self.node_id(), target_id);
        if outbound.send(envelope).await.is_err() {
            if self.inner.registry.remove_if_same(target_id, &outbound).await {
                warn!(peer_id = %target_id, "removed unreachable peer");
                self.inner
                    .events
                    .publish(NodeEvent::PeerDisconnected {
                        peer_id: target_id.to_string(),
                    })
                    .await;
            }
            return Err(NodeError::unreachable(target_id));
        }

        debug!(peer_id = %target_id, kind = %kind, "message sent");
        Ok(())
    }

    /// Attempts delivery of one envelope to every registered peer.
    ///
    /// The registry is snapshotted up front; failures are collected during
    /// the sweep and the failed entries removed in one pass afterwards, so a
    /// dead peer can neither block the others nor mutate the registry while
    /// it is being walked. No peer is guaranteed to have processed the
    /// message by the time this returns.
    pub async fn broadcast(&self, kind: MessageKind, content: Value) -> BroadcastOutcome {
        let peers = self.inner.registry.snapshot().await;
        if peers.is_empty() {
            info!(kind = %kind, "broadcast skipped: no peers connected");
            return BroadcastOutcome::NoPeers;
        }

        let envelope = Envelope::broadcast(kind, content, self.node_id());
        let mut sent = 0;
        let mut failed: Vec<(String, PeerSender)> = Vec::new();

        for (peer_id, outbound) in &peers {
            if outbound.send(envelope.clone()).await.is_ok() {
                sent += 1;
            } else {
                warn!(peer_id = %peer_id, "broadcast delivery failed");
                failed.push((peer_id.clone(), outbound.clone()));
            }
        }

        let mut removed = Vec::with_capacity(failed.len());
        for (peer_id, outbound) in failed {
            if self.inner.registry.remove_if_same(&peer_id, &outbound).await {
                self.inner
                    .events
                    .publish(NodeEvent::PeerDisconnected {
                        peer_id: peer_id.clone(),
                    })
                    .await;
            }
            removed.push(peer_id);
        }

        info!(kind = %kind, sent, failed = removed.len(), "broadcast complete");
        BroadcastOutcome::Delivered {
            sent,
            failed: removed,
        }
    }

    /// Broadcasts critical-condition alert records to every peer.
    pub async fn broadcast_alert(&self, alerts: &[AlertRecord]) -> NodeResult<BroadcastOutcome> {
        info!(count = alerts.len(), "broadcasting critical alerts");
        let content = serde_json::to_value(alerts).map_err(ProtocolError::from)?;
        Ok(self.broadcast(MessageKind::Alert, content).await)
    }

    /// Shares one user/bot conversation turn with every peer.
    pub async fn share_chat(
        &self,
        user_input: &str,
        bot_response: &str,
    ) -> NodeResult<BroadcastOutcome> {
        debug!(user_input = %user_input, "sharing chat with peers");
        let payload = ChatPayload::new(user_input, bot_response);
        let content = serde_json::to_value(&payload).map_err(ProtocolError::from)?;
        Ok(self.broadcast(MessageKind::Chat, content).await)
    }

    /// Registered peer ids as of this call; no staleness guarantee beyond
    /// that.
    pub async fn get_connected_peers(&self) -> Vec<String> {
        self.inner.registry.peer_ids().await
    }

    /// The node's retained event history, oldest first.
    pub async fn recent_events(&self) -> Vec<EventRecord> {
        self.inner.events.recent().await
    }

    /// Subscribes to node events published after this call.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Reads envelopes off one connection until it closes or breaks, then
    /// cleans up the registry entry this connection registered (if it still
    /// points here; an overwritten entry belongs to the newer connection).
    async fn receive_loop(
        self,
        mut reader: OwnedReadHalf,
        outbound: PeerSender,
        registered: Option<String>,
    ) {
        let mut registered = registered;
        loop {
            match connection::read_envelope(&mut reader).await {
                Ok(Some(envelope)) => {
                    self.dispatch(envelope, &outbound, &mut registered).await;
                }
                Ok(None) => {
                    debug!("peer connection closed");
                    break;
                }
                Err(e) if connection::frame_error_is_recoverable(&e) => {
                    warn!(error = %e, "dropping undecodable message");
                }
                Err(e) => {
                    warn!(error = %e, "connection read failed");
                    break;
                }
            }
        }

        if let Some(peer_id) = registered
            && self.inner.registry.remove_if_same(&peer_id, &outbound).await
        {
            warn!(peer_id = %peer_id, "peer disconnected");
            self.inner
                .events
                .publish(NodeEvent::PeerDisconnected { peer_id })
                .await;
        }
    }

    /// Routes one decoded envelope to its handler.
    async fn dispatch(
        &self,
        envelope: Envelope,
        outbound: &PeerSender,
        registered: &mut Option<String>,
    ) {
        debug!(
            kind = %envelope.kind,
            sender_id = %envelope.sender_id,
            message_id = %envelope.message_id,
            "dispatching message"
        );
        match envelope.kind {
            MessageKind::Discovery => {
                self.handle_discovery(envelope, outbound, registered).await;
            }
            MessageKind::Heartbeat => self.handle_heartbeat(envelope, outbound).await,
            MessageKind::Alert => self.handle_alert(envelope).await,
            MessageKind::Chat => self.handle_chat(envelope).await,
            MessageKind::Query | MessageKind::Response => {
                debug!(kind = %envelope.kind, "no handler for message kind, dropping");
            }
        }
    }

    async fn handle_discovery(
        &self,
        envelope: Envelope,
        outbound: &PeerSender,
        registered: &mut Option<String>,
    ) {
        let payload: DiscoveryPayload = match serde_json::from_value(envelope.content.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "dropping discovery with unusable payload");
                return;
            }
        };

        match payload.action {
            DiscoveryAction::Join => {
                let peer_id = envelope.sender_id;
                // Last writer wins on id collision; the replaced entry is not
                // drained.
                self.inner.registry.register(&peer_id, outbound.clone()).await;
                *registered = Some(peer_id.clone());
                info!(peer_id = %peer_id, "registered new peer");
                self.inner
                    .events
                    .publish(NodeEvent::PeerRegistered {
                        peer_id: peer_id.clone(),
                    })
                    .await;

                let welcome = Envelope::addressed(
                    MessageKind::Discovery,
                    payload_value(&DiscoveryPayload::welcome(self.node_id())),
                    self.node_id(),
                    peer_id.clone(),
                );
                if outbound.send(welcome).await.is_err() {
                    warn!(peer_id = %peer_id, "failed to queue welcome reply");
                }
            }
            DiscoveryAction::Welcome => {
                debug!(peer_id = %payload.node_id, "peer acknowledged our join");
            }
        }
    }

    async fn handle_heartbeat(&self, envelope: Envelope, outbound: &PeerSender) {
        debug!(sender_id = %envelope.sender_id, "heartbeat received");
        // Liveness echo only; there is no last-seen bookkeeping and no
        // timeout-based eviction of quiet peers.
        let reply = Envelope::addressed(
            MessageKind::Heartbeat,
            payload_value(&HeartbeatPayload::alive()),
            self.node_id(),
            envelope.sender_id,
        );
        if outbound.send(reply).await.is_err() {
            warn!("failed to queue heartbeat reply");
        }
    }

    async fn handle_alert(&self, envelope: Envelope) {
        let alerts = parse_alerts(&envelope.content);
        for record in &alerts {
            warn!(
                sender_id = %envelope.sender_id,
                alert_type = %record.alert_type,
                message = %record.message,
                "critical alert received"
            );
        }
        self.inner
            .events
            .publish(NodeEvent::AlertReceived {
                sender_id: envelope.sender_id,
                alerts,
            })
            .await;
    }

    async fn handle_chat(&self, envelope: Envelope) {
        let chat: ChatPayload = match serde_json::from_value(envelope.content.clone()) {
            Ok(chat) => chat,
            Err(e) => {
                warn!(
                    error = %e,
                    sender_id = %envelope.sender_id,
                    "dropping chat with unusable payload"
                );
                return;
            }
        };
        info!(
            sender_id = %envelope.sender_id,
            user_input = %chat.user_input,
            "chat shared by peer"
        );
        self.inner
            .events
            .publish(NodeEvent::ChatReceived {
                sender_id: envelope.sender_id,
                chat,
            })
            .await;
    }
}

/// Serializes a payload struct into envelope content. The payload types used
/// here contain only plain fields, so failure degrades to a null content
/// rather than a panic.
fn payload_value<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Interprets alert content leniently: a list of records, a single record,
/// or anything else surfaced as one opaque record.
fn parse_alerts(content: &Value) -> Vec<AlertRecord> {
    if let Ok(records) = serde_json::from_value::<Vec<AlertRecord>>(content.clone()) {
        return records;
    }
    if let Ok(record) = serde_json::from_value::<AlertRecord>(content.clone()) {
        return vec![record];
    }
    vec![AlertRecord::new("unknown", content.to_string())]
}
