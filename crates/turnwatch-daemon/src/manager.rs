//! The connection manager actor.
//!
//! One task owns the lease scanner, every [`EndpointConnection`], and the
//! [`TurnAggregator`]. Socket pumps and the directory watcher only feed it
//! channels, so nothing here needs a lock. Consumers see immutable
//! [`EndpointRow`] snapshots and deduplicated [`MonitorEvent`]s.

use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use turnwatch_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use turnwatch_core::{AggregatorConfig, EndpointRow, RuntimeEndpointLease, TurnAggregator};
use url::Url;

use crate::connection::{ConnectionOutput, EndpointConnection};
use crate::lease_watch::LeaseDirWatcher;
use crate::scanner::LeaseScanner;
use crate::transport::{ConnectionSignal, TransportFactory};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub scan_interval: Duration,
    pub refresh_interval: Duration,
    pub snapshot_throttle: Duration,
    pub eviction_interval: Duration,
    pub watch_debounce: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub max_frame_bytes: usize,
    pub aggregator: AggregatorConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            refresh_interval: Duration::from_secs(5),
            snapshot_throttle: Duration::from_millis(500),
            eviction_interval: Duration::from_secs(1),
            watch_debounce: Duration::from_millis(250),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            aggregator: AggregatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ConnectionStateChanged(ConnectionState),
    /// Sorted ids of endpoints whose connection currently reports connected.
    EndpointIdsChanged(Vec<String>),
}

/// Consumer side of a [`ConnectionManager`].
pub struct MonitorHandle {
    pub events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub rows: watch::Receiver<Vec<EndpointRow>>,
}

pub struct ConnectionManager {
    config: ManagerConfig,
    scanner: LeaseScanner,
    watch_chain: Vec<PathBuf>,
    transport: Arc<dyn TransportFactory>,
    aggregator: TurnAggregator,
    connections: HashMap<String, EndpointConnection>,
    next_generation: u64,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
    signal_rx: Option<mpsc::UnboundedReceiver<ConnectionSignal>>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    rows: watch::Sender<Vec<EndpointRow>>,
    state: ConnectionState,
    endpoint_ids: Vec<String>,
    published_revision: Option<u64>,
    backoff: Duration,
    reconnect_at: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        scanner: LeaseScanner,
        watch_chain: Vec<PathBuf>,
        transport: Arc<dyn TransportFactory>,
    ) -> (Self, MonitorHandle) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (rows_tx, rows_rx) = watch::channel(Vec::new());
        let aggregator = TurnAggregator::new(config.aggregator.clone());
        let backoff = config.reconnect_initial;
        let manager = Self {
            config,
            scanner,
            watch_chain,
            transport,
            aggregator,
            connections: HashMap::new(),
            next_generation: 1,
            signal_tx,
            signal_rx: Some(signal_rx),
            events: events_tx,
            rows: rows_tx,
            state: ConnectionState::Disconnected,
            endpoint_ids: Vec::new(),
            published_revision: None,
            backoff,
            reconnect_at: None,
        };
        let handle = MonitorHandle {
            events: events_rx,
            rows: rows_rx,
        };
        (manager, handle)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn connected_endpoint_ids(&self) -> &[String] {
        &self.endpoint_ids
    }

    pub fn aggregator(&self) -> &TurnAggregator {
        &self.aggregator
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut signals) = self.signal_rx.take() else {
            warn!(event = "manager_already_running");
            return;
        };
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let mut watcher = match LeaseDirWatcher::new(self.watch_chain.clone(), watch_tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(event = "lease_watch_unavailable", error = %err);
                None
            }
        };
        if let Some(watcher) = watcher.as_mut() {
            watcher.rearm();
        }
        let watching = watcher
            .as_ref()
            .and_then(LeaseDirWatcher::target)
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        info!(
            event = "manager_start",
            lease_dir = %self.scanner.dir().display(),
            watching = %watching
        );
        self.scan_and_reconcile();

        let start = Instant::now();
        let mut scan_tick = interval_at(start + self.config.scan_interval, self.config.scan_interval);
        let mut refresh_tick =
            interval_at(start + self.config.refresh_interval, self.config.refresh_interval);
        let mut eviction_tick =
            interval_at(start + self.config.eviction_interval, self.config.eviction_interval);
        for ticker in [&mut scan_tick, &mut refresh_tick, &mut eviction_tick] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        // Fixed from the first event of a burst so steady traffic cannot postpone the rescan.
        let mut watch_deadline: Option<Instant> = None;

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(signal) = signals.recv() => {
                    self.handle_signal(signal);
                }
                Some(()) = watch_rx.recv(), if watcher.is_some() => {
                    if watch_deadline.is_none() {
                        watch_deadline = Some(Instant::now() + self.config.watch_debounce);
                    }
                }
                _ = sleep_until(watch_deadline.unwrap_or_else(Instant::now)), if watch_deadline.is_some() => {
                    watch_deadline = None;
                    if let Some(watcher) = watcher.as_mut() {
                        watcher.rearm();
                    }
                    self.scan_and_reconcile();
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    debug!(event = "manager_reconnect_pass");
                    self.scan_and_reconcile();
                }
                _ = scan_tick.tick() => {
                    if let Some(watcher) = watcher.as_mut() {
                        watcher.rearm();
                    }
                    self.scan_and_reconcile();
                }
                _ = refresh_tick.tick() => {
                    self.refresh_all();
                }
                _ = eviction_tick.tick() => {
                    self.on_tick();
                }
            }
        }

        self.stop_all();
        info!(event = "manager_stop");
    }

    fn scan_and_reconcile(&mut self) {
        let leases = self.scanner.scan(Utc::now());
        self.reconcile(&leases);
    }

    /// Brings the connection set in line with `leases`.
    fn reconcile(&mut self, leases: &BTreeMap<String, RuntimeEndpointLease>) {
        let mut discovered: BTreeMap<&str, Url> = BTreeMap::new();
        for (endpoint_id, lease) in leases {
            match Url::parse(&lease.connect_url) {
                Ok(url) => {
                    discovered.insert(endpoint_id.as_str(), url);
                }
                Err(err) => {
                    warn!(event = "lease_url_invalid", endpoint_id = %endpoint_id, error = %err);
                }
            }
        }

        let removed: Vec<String> = self
            .connections
            .keys()
            .filter(|endpoint_id| !discovered.contains_key(endpoint_id.as_str()))
            .cloned()
            .collect();
        for endpoint_id in removed {
            if let Some(mut connection) = self.connections.remove(&endpoint_id) {
                connection.stop();
            }
            let interrupted = self.aggregator.retire_endpoint(&endpoint_id, Utc::now());
            info!(event = "endpoint_removed", endpoint_id = %endpoint_id, interrupted);
        }

        let now = std::time::Instant::now();
        for (endpoint_id, url) in discovered {
            self.aggregator.track_endpoint(endpoint_id);
            let outputs = match self.connections.get_mut(endpoint_id) {
                Some(existing) if existing.url() == &url && !existing.is_closed() => {
                    existing.refresh_snapshot_if_needed(now)
                }
                Some(existing) => {
                    if existing.url() != &url {
                        info!(
                            event = "endpoint_url_changed",
                            endpoint_id = %endpoint_id,
                            from = %existing.url(),
                            to = %url
                        );
                    }
                    existing.stop();
                    self.open_connection(endpoint_id, url);
                    Vec::new()
                }
                None => {
                    self.open_connection(endpoint_id, url);
                    Vec::new()
                }
            };
            self.apply_outputs(endpoint_id, outputs);
        }

        self.publish_connection_status();
        self.publish_rows(false);
    }

    fn open_connection(&mut self, endpoint_id: &str, url: Url) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let mut connection = EndpointConnection::new(
            endpoint_id,
            url,
            generation,
            self.config.snapshot_throttle,
            self.config.max_frame_bytes,
        );
        connection.start(self.transport.as_ref(), self.signal_tx.clone());
        self.connections.insert(endpoint_id.to_string(), connection);
    }

    fn handle_signal(&mut self, signal: ConnectionSignal) {
        let endpoint_id = signal.endpoint_id().to_string();
        let Some(connection) = self.connections.get_mut(&endpoint_id) else {
            return;
        };
        if connection.generation() != signal.generation() {
            debug!(
                event = "endpoint_signal_stale",
                endpoint_id = %endpoint_id,
                generation = signal.generation()
            );
            return;
        }
        let outputs = match signal {
            ConnectionSignal::Opened { .. } => {
                self.backoff = self.config.reconnect_initial;
                connection.handle_opened()
            }
            ConnectionSignal::Frame { text, .. } => {
                connection.handle_frame(&text, std::time::Instant::now())
            }
            ConnectionSignal::Closed { reason, .. } => connection.handle_closed(&reason),
        };
        self.apply_outputs(&endpoint_id, outputs);
    }

    fn apply_outputs(&mut self, endpoint_id: &str, outputs: Vec<ConnectionOutput>) {
        if outputs.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut disconnected = false;
        for output in outputs {
            match output {
                ConnectionOutput::Notification(notification) => {
                    if !self
                        .aggregator
                        .apply_notification(endpoint_id, &notification, now)
                    {
                        debug!(
                            event = "notification_dropped",
                            endpoint_id = %endpoint_id,
                            method = notification.method()
                        );
                    }
                }
                ConnectionOutput::Disconnected { reason } => {
                    info!(event = "endpoint_disconnect", endpoint_id = %endpoint_id, reason = %reason);
                    disconnected = true;
                }
            }
        }
        if disconnected {
            self.schedule_reconnect();
            self.publish_connection_status();
        }
        self.publish_rows(false);
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + self.backoff);
        self.backoff = next_backoff(self.backoff, self.config.reconnect_max);
    }

    fn refresh_all(&mut self) {
        let now = std::time::Instant::now();
        let mut ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.sort();
        for endpoint_id in ids {
            let outputs = match self.connections.get_mut(&endpoint_id) {
                Some(connection) => connection.refresh_snapshot_if_needed(now),
                None => continue,
            };
            self.apply_outputs(&endpoint_id, outputs);
        }
    }

    fn on_tick(&mut self) {
        let evicted = self.aggregator.evict_expired_turns(Utc::now());
        if evicted > 0 {
            debug!(event = "turns_evicted", count = evicted);
        }
        // Live timelines grow with the clock even when nothing else changed.
        let force = self.aggregator.has_live_turns();
        self.publish_rows(force);
    }

    fn publish_rows(&mut self, force: bool) {
        let revision = self.aggregator.revision();
        if !force && self.published_revision == Some(revision) {
            return;
        }
        let rows = self.aggregator.endpoint_rows(Utc::now());
        self.rows.send_replace(rows);
        self.published_revision = Some(revision);
    }

    fn coarse_state(&self) -> ConnectionState {
        if self.connections.values().any(EndpointConnection::is_connected) {
            ConnectionState::Connected
        } else if self.connections.is_empty() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        }
    }

    fn publish_connection_status(&mut self) {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_connected())
            .map(|(endpoint_id, _)| endpoint_id.clone())
            .collect();
        ids.sort();
        if ids != self.endpoint_ids {
            self.endpoint_ids = ids.clone();
            let _ = self.events.send(MonitorEvent::EndpointIdsChanged(ids));
        }
        self.set_state(self.coarse_state());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        info!(event = "connection_state_changed", from = %self.state, to = %state);
        self.state = state.clone();
        let _ = self.events.send(MonitorEvent::ConnectionStateChanged(state));
    }

    fn stop_all(&mut self) {
        for connection in self.connections.values_mut() {
            connection.stop();
        }
        self.connections.clear();
        self.reconnect_at = None;
        if !self.endpoint_ids.is_empty() {
            self.endpoint_ids.clear();
            let _ = self.events.send(MonitorEvent::EndpointIdsChanged(Vec::new()));
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_mul(2);
    if next > max {
        max
    } else {
        next
    }
}
