//! Periodic critical-condition monitor.
//!
//! Bridges the (external) condition detector and the node: on a fixed
//! interval it invokes a caller-supplied detection function and broadcasts
//! whatever alert records come back. A failed detection shortens the next
//! wait instead of stopping the loop. Commands arrive over a channel via a
//! cloneable handle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use finmesh_protocol::AlertRecord;

use crate::node::{BroadcastOutcome, Node};

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between scans.
    pub check_interval: Duration,
    /// Wait before retrying after a failed detection.
    pub error_retry: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            error_retry: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    /// Creates a config with the given scan interval.
    pub fn new(check_interval: Duration) -> Self {
        Self {
            check_interval,
            ..Default::default()
        }
    }

    /// Builder: set the retry delay after a failed detection.
    pub fn with_error_retry(mut self, retry: Duration) -> Self {
        self.error_retry = retry;
        self
    }
}

/// Commands that can be sent to a running monitor.
#[derive(Debug, Clone)]
pub enum MonitorCommand {
    /// Scan immediately instead of waiting for the interval.
    CheckNow,
    /// Stop the monitor loop.
    Stop,
}

/// Snapshot of what the monitor has done so far.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    /// Scans completed (including failed ones).
    pub scans: u64,
    /// Alert records handed to the node for broadcast.
    pub alerts_sent: u64,
    /// When the last scan ran.
    pub last_scan: Option<DateTime<Utc>>,
    /// Error from the most recent scan, if it failed.
    pub last_error: Option<String>,
}

type SharedMonitorState = Arc<RwLock<MonitorState>>;

/// Periodic detect-then-broadcast driver.
pub struct AlertMonitor {
    node: Node,
    config: MonitorConfig,
    state: SharedMonitorState,
    command_tx: mpsc::Sender<MonitorCommand>,
    command_rx: Option<mpsc::Receiver<MonitorCommand>>,
}

impl AlertMonitor {
    /// Creates a monitor driving the given node.
    pub fn new(node: Node, config: MonitorConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            node,
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Returns a handle for commanding the running monitor.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs the monitor loop with the given detection function.
    ///
    /// The detector returns the critical conditions currently in effect, or
    /// an error message when detection itself failed.
    pub async fn run<F, Fut>(mut self, detect: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<AlertRecord>, String>> + Send,
    {
        let mut command_rx = self.command_rx.take().expect("run called twice");

        info!(
            interval_secs = self.config.check_interval.as_secs(),
            node_id = %self.node.node_id(),
            "alert monitor started"
        );

        let mut delay = self.config.check_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = self.scan(&detect).await;
                }
                cmd = command_rx.recv() => match cmd {
                    Some(MonitorCommand::CheckNow) => {
                        debug!("received CheckNow command");
                        delay = self.scan(&detect).await;
                    }
                    Some(MonitorCommand::Stop) | None => {
                        info!("alert monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one scan and returns the wait before the next one.
    async fn scan<F, Fut>(&self, detect: &F) -> Duration
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Vec<AlertRecord>, String>>,
    {
        match detect().await {
            Ok(alerts) => {
                {
                    let mut state = self.state.write().await;
                    state.scans += 1;
                    state.last_scan = Some(Utc::now());
                    state.last_error = None;
                }

                if alerts.is_empty() {
                    debug!("no critical conditions detected");
                } else {
                    info!(count = alerts.len(), "critical conditions detected");
                    match self.node.broadcast_alert(&alerts).await {
                        Ok(BroadcastOutcome::NoPeers) => {
                            debug!("alerts detected but no peers connected");
                        }
                        Ok(outcome) => {
                            self.state.write().await.alerts_sent += alerts.len() as u64;
                            debug!(sent = outcome.sent(), "alerts broadcast");
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to broadcast alerts");
                        }
                    }
                }
                self.config.check_interval
            }
            Err(e) => {
                warn!(error = %e, "alert detection failed");
                let mut state = self.state.write().await;
                state.scans += 1;
                state.last_scan = Some(Utc::now());
                state.last_error = Some(e);
                self.config.error_retry
            }
        }
    }
}

/// Handle for sending commands to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    command_tx: mpsc::Sender<MonitorCommand>,
    state: SharedMonitorState,
}

impl MonitorHandle {
    /// Triggers an immediate scan.
    pub async fn check_now(&self) -> Result<(), mpsc::error::SendError<MonitorCommand>> {
        self.command_tx.send(MonitorCommand::CheckNow).await
    }

    /// Stops the monitor.
    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<MonitorCommand>> {
        self.command_tx.send(MonitorCommand::Stop).await
    }

    /// Returns the current monitor state.
    pub async fn state(&self) -> MonitorState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_node() -> Node {
        Node::new(NodeConfig::new("127.0.0.1", 0).with_node_id("monitor_node"))
    }

    #[test]
    fn config_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.error_retry, Duration::from_secs(5));
    }

    #[test]
    fn config_builder() {
        let config =
            MonitorConfig::new(Duration::from_secs(10)).with_error_retry(Duration::from_secs(2));
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.error_retry, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn scans_on_interval() {
        let monitor = AlertMonitor::new(test_node(), MonitorConfig::new(Duration::from_secs(30)));
        let handle = monitor.handle();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        tokio::spawn(monitor.run(move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        }));

        tokio::time::sleep(Duration::from_secs(95)).await;
        let _ = handle.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = handle.state().await;
        assert_eq!(state.scans, 3);
        assert!(state.last_error.is_none());
        assert!(state.last_scan.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_detection_retries_sooner() {
        let config =
            MonitorConfig::new(Duration::from_secs(60)).with_error_retry(Duration::from_secs(5));
        let monitor = AlertMonitor::new(test_node(), config);
        let handle = monitor.handle();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        tokio::spawn(monitor.run(move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("database unavailable".to_string())
            }
        }));

        // First scan at 60s, then retries at 65s and 70s.
        tokio::time::sleep(Duration::from_secs(72)).await;
        let _ = handle.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = handle.state().await;
        assert_eq!(state.last_error.as_deref(), Some("database unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_now_scans_immediately() {
        let monitor = AlertMonitor::new(test_node(), MonitorConfig::new(Duration::from_secs(3600)));
        let handle = monitor.handle();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        tokio::spawn(monitor.run(move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![AlertRecord::new("low_balance", "balance below threshold")])
            }
        }));

        handle.check_now().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = handle.state().await;
        assert_eq!(state.scans, 1);
        // No peers were connected, so nothing counts as sent.
        assert_eq!(state.alerts_sent, 0);

        let _ = handle.stop().await;
    }
}
