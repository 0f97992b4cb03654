//! One JSON-RPC session with a runtime endpoint.
//!
//! The connection never reconnects by itself: any transport failure tears it
//! down and reports [`ConnectionOutput::Disconnected`] to the owner.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use turnwatch_core::notification::{SnapshotSummaryParams, ThreadParams, TurnParams};
use turnwatch_core::protocol::{
    decode_message, encode_notification, encode_request, method, ActiveTurnRef, ActiveTurnsResponse,
    IncomingMessage, InitializeParams, RequestId, ThreadLoadedListParams,
    ThreadLoadedListResponse, ThreadReadParams, ThreadReadResponse,
};
use turnwatch_core::{non_blank, snapshot_turn_key, Notification};
use url::Url;

use crate::transport::{ConnectionSignal, TransportError, TransportFactory, TransportHandle};

const ALREADY_INITIALIZED: &str = "Already initialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open { initialized: bool },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRequest {
    Initialize,
    ActiveTurns { requested_at: DateTime<Utc> },
    ThreadRead { thread_id: String },
    LoadedThreads,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutput {
    Notification(Notification),
    Disconnected { reason: String },
}

pub struct EndpointConnection {
    endpoint_id: String,
    url: Url,
    generation: u64,
    phase: ConnectionPhase,
    transport: Option<TransportHandle>,
    pending: HashMap<RequestId, PendingRequest>,
    next_request_id: i64,
    last_snapshot_request: Option<Instant>,
    snapshot_throttle: Duration,
    max_frame_bytes: usize,
}

impl EndpointConnection {
    pub fn new(
        endpoint_id: &str,
        url: Url,
        generation: u64,
        snapshot_throttle: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            url,
            generation,
            phase: ConnectionPhase::Idle,
            transport: None,
            pending: HashMap::new(),
            next_request_id: 1,
            last_snapshot_request: None,
            snapshot_throttle,
            max_frame_bytes,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Optimistic: a connection counts as connected from the moment it starts.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Open { .. }
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.phase == ConnectionPhase::Open { initialized: true }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn start(
        &mut self,
        factory: &dyn TransportFactory,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) {
        if self.phase != ConnectionPhase::Idle {
            return;
        }
        info!(
            event = "endpoint_connect",
            endpoint_id = %self.endpoint_id,
            url = %self.url,
            generation = self.generation
        );
        self.transport = Some(factory.open(&self.endpoint_id, &self.url, self.generation, signals));
        self.phase = ConnectionPhase::Connecting;
    }

    /// Transport is up: send the capability handshake.
    pub fn handle_opened(&mut self) -> Vec<ConnectionOutput> {
        if self.phase != ConnectionPhase::Connecting {
            return Vec::new();
        }
        self.phase = ConnectionPhase::Open { initialized: false };
        let params = InitializeParams::turnwatch();
        match self.send_request(method::INITIALIZE, Some(&params), PendingRequest::Initialize) {
            Ok(()) => Vec::new(),
            Err(err) => vec![self.teardown(err.to_string())],
        }
    }

    pub fn handle_closed(&mut self, reason: &str) -> Vec<ConnectionOutput> {
        if self.is_closed() {
            return Vec::new();
        }
        vec![self.teardown(reason.to_string())]
    }

    pub fn handle_frame(&mut self, text: &str, now: Instant) -> Vec<ConnectionOutput> {
        if !matches!(self.phase, ConnectionPhase::Open { .. }) {
            return Vec::new();
        }
        let message = match decode_message(text, self.max_frame_bytes) {
            Ok(message) => message,
            Err(err) => {
                debug!(event = "endpoint_frame_dropped", endpoint_id = %self.endpoint_id, error = %err);
                return Vec::new();
            }
        };
        let mut outputs = Vec::new();
        let result = match message {
            IncomingMessage::Response { id, result } => match self.pending.remove(&id) {
                Some(request) => self.handle_response(request, result, now, &mut outputs),
                None => {
                    debug!(event = "endpoint_unmatched_response", endpoint_id = %self.endpoint_id, id = ?id);
                    Ok(())
                }
            },
            IncomingMessage::ErrorResponse { id, code, message } => {
                match self.pending.remove(&id) {
                    Some(PendingRequest::Initialize) if message.contains(ALREADY_INITIALIZED) => {
                        self.on_initialized(now)
                    }
                    Some(request) => {
                        warn!(
                            event = "endpoint_request_failed",
                            endpoint_id = %self.endpoint_id,
                            request = ?request,
                            code,
                            message = %message
                        );
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            IncomingMessage::Notification { method, params } => {
                match Notification::decode(&method, params) {
                    Ok(Some(notification)) => {
                        outputs.push(ConnectionOutput::Notification(notification));
                    }
                    Ok(None) => {
                        debug!(event = "endpoint_notification_ignored", endpoint_id = %self.endpoint_id, method = %method);
                    }
                    Err(err) => {
                        debug!(event = "endpoint_notification_invalid", endpoint_id = %self.endpoint_id, error = %err);
                    }
                }
                Ok(())
            }
            IncomingMessage::Request { method, .. } => {
                debug!(event = "endpoint_request_ignored", endpoint_id = %self.endpoint_id, method = %method);
                Ok(())
            }
        };
        if let Err(err) = result {
            outputs.push(self.teardown(err.to_string()));
        }
        outputs
    }

    /// Requests a fresh active-turn snapshot unless one went out within the throttle window.
    pub fn refresh_snapshot_if_needed(&mut self, now: Instant) -> Vec<ConnectionOutput> {
        if !self.is_initialized() {
            return Vec::new();
        }
        if let Some(last) = self.last_snapshot_request {
            if now.saturating_duration_since(last) < self.snapshot_throttle {
                return Vec::new();
            }
        }
        match self.request_snapshot(now) {
            Ok(()) => Vec::new(),
            Err(err) => vec![self.teardown(err.to_string())],
        }
    }

    /// Owner-initiated shutdown. Pending requests are discarded silently.
    pub fn stop(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        info!(event = "endpoint_stop", endpoint_id = %self.endpoint_id, generation = self.generation);
        self.pending.clear();
        self.transport = None;
        self.phase = ConnectionPhase::Closed;
    }

    fn teardown(&mut self, reason: String) -> ConnectionOutput {
        self.pending.clear();
        self.transport = None;
        self.phase = ConnectionPhase::Closed;
        ConnectionOutput::Disconnected { reason }
    }

    fn on_initialized(&mut self, now: Instant) -> Result<(), TransportError> {
        self.phase = ConnectionPhase::Open { initialized: true };
        info!(event = "endpoint_initialized", endpoint_id = %self.endpoint_id);
        let frame = encode_notification::<Value>(method::INITIALIZED, None, self.max_frame_bytes)
            .map_err(|err| TransportError::Send(err.to_string()))?;
        self.send_text(frame)?;
        self.request_snapshot(now)
    }

    fn request_snapshot(&mut self, now: Instant) -> Result<(), TransportError> {
        self.last_snapshot_request = Some(now);
        let pending = PendingRequest::ActiveTurns {
            requested_at: Utc::now(),
        };
        self.send_request::<Value>(method::TURN_ACTIVE, None, pending)
    }

    fn handle_response(
        &mut self,
        request: PendingRequest,
        result: Value,
        now: Instant,
        outputs: &mut Vec<ConnectionOutput>,
    ) -> Result<(), TransportError> {
        match request {
            PendingRequest::Initialize => self.on_initialized(now),
            PendingRequest::ActiveTurns { requested_at } => {
                let refs = match serde_json::from_value::<ActiveTurnsResponse>(result) {
                    Ok(response) => response.into_refs(),
                    Err(err) => {
                        debug!(event = "endpoint_snapshot_invalid", endpoint_id = %self.endpoint_id, error = %err);
                        return Ok(());
                    }
                };
                self.apply_active_turns(refs, requested_at, outputs)
            }
            PendingRequest::ThreadRead { thread_id } => {
                match serde_json::from_value::<ThreadReadResponse>(result) {
                    Ok(mut response) => {
                        if non_blank(response.thread.id.as_deref()).is_none() {
                            response.thread.id = Some(thread_id);
                        }
                        outputs.push(ConnectionOutput::Notification(Notification::ThreadSnapshot(
                            ThreadParams {
                                thread: response.thread,
                            },
                        )));
                    }
                    Err(err) => {
                        debug!(event = "endpoint_thread_read_invalid", endpoint_id = %self.endpoint_id, error = %err);
                    }
                }
                Ok(())
            }
            PendingRequest::LoadedThreads => {
                let first = serde_json::from_value::<ThreadLoadedListResponse>(result)
                    .ok()
                    .and_then(|response| {
                        response
                            .data
                            .into_iter()
                            .find(|id| non_blank(Some(id.as_str())).is_some())
                    });
                match first {
                    Some(thread_id) => self.read_thread(thread_id),
                    None => Ok(()),
                }
            }
        }
    }

    fn apply_active_turns(
        &mut self,
        refs: Vec<ActiveTurnRef>,
        requested_at: DateTime<Utc>,
        outputs: &mut Vec<ConnectionOutput>,
    ) -> Result<(), TransportError> {
        let mut keys = BTreeSet::new();
        let mut threads = BTreeSet::new();
        for active in &refs {
            let Some(turn_id) = non_blank(Some(active.turn_id.as_str())) else {
                continue;
            };
            let thread_id = active.thread_id.trim();
            if !keys.insert(snapshot_turn_key(thread_id, turn_id)) {
                continue;
            }
            outputs.push(ConnectionOutput::Notification(Notification::TurnStarted(
                TurnParams::snapshot(thread_id, turn_id),
            )));
            if !thread_id.is_empty() {
                threads.insert(thread_id.to_string());
            }
        }

        if keys.is_empty() {
            self.send_request(
                method::THREAD_LOADED_LIST,
                Some(&ThreadLoadedListParams::default()),
                PendingRequest::LoadedThreads,
            )?;
        }
        for thread_id in threads {
            self.read_thread(thread_id)?;
        }
        outputs.push(ConnectionOutput::Notification(Notification::SnapshotSummary(
            SnapshotSummaryParams {
                active_turn_keys: keys.into_iter().collect(),
                requested_at: Some(requested_at),
            },
        )));
        Ok(())
    }

    fn read_thread(&mut self, thread_id: String) -> Result<(), TransportError> {
        let params = ThreadReadParams {
            thread_id: thread_id.clone(),
            include_turns: true,
        };
        self.send_request(
            method::THREAD_READ,
            Some(&params),
            PendingRequest::ThreadRead { thread_id },
        )
    }

    fn send_request<T: Serialize>(
        &mut self,
        method_name: &str,
        params: Option<&T>,
        pending: PendingRequest,
    ) -> Result<(), TransportError> {
        let id = RequestId::Integer(self.next_request_id);
        self.next_request_id += 1;
        let frame = encode_request(&id, method_name, params, self.max_frame_bytes)
            .map_err(|err| TransportError::Send(err.to_string()))?;
        self.send_text(frame)?;
        self.pending.insert(id, pending);
        Ok(())
    }

    fn send_text(&self, frame: String) -> Result<(), TransportError> {
        match &self.transport {
            Some(transport) => transport.send(frame),
            None => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use serde_json::json;
    use turnwatch_core::protocol::DEFAULT_MAX_FRAME_BYTES;

    struct Harness {
        transport: RecordingTransport,
        connection: EndpointConnection,
        _signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    }

    impl Harness {
        fn new() -> Self {
            let transport = RecordingTransport::default();
            let (tx, rx) = mpsc::unbounded_channel();
            let mut connection = EndpointConnection::new(
                "ep",
                Url::parse("ws://127.0.0.1:9000").expect("url"),
                3,
                Duration::from_millis(500),
                DEFAULT_MAX_FRAME_BYTES,
            );
            connection.start(&transport, tx);
            Self {
                transport,
                connection,
                _signals: rx,
            }
        }

        fn sent(&self) -> Vec<Value> {
            self.transport
                .drain_sent("ep", 3)
                .iter()
                .map(|frame| serde_json::from_str(frame).expect("json"))
                .collect()
        }

        fn reply(&mut self, id: &Value, result: Value, now: Instant) -> Vec<ConnectionOutput> {
            let frame = json!({"id": id, "result": result}).to_string();
            self.connection.handle_frame(&frame, now)
        }

        /// Runs the handshake and returns the outstanding `turn/active` request id.
        fn initialize(&mut self, now: Instant) -> Value {
            assert!(self.connection.handle_opened().is_empty());
            let init = self.sent().remove(0);
            assert_eq!(init["method"], "initialize");
            assert!(self.reply(&init["id"], json!({}), now).is_empty());
            let sent = self.sent();
            assert_eq!(sent[0]["method"], "initialized");
            assert!(sent[0].get("id").is_none());
            assert_eq!(sent[1]["method"], "turn/active");
            sent[1]["id"].clone()
        }
    }

    #[test]
    fn start_is_optimistically_connected() {
        let harness = Harness::new();
        assert!(harness.connection.is_connected());
        assert!(!harness.connection.is_initialized());
        assert_eq!(harness.transport.opened().len(), 1);
    }

    #[test]
    fn active_turns_expand_into_snapshot_notifications_and_thread_reads() {
        let mut harness = Harness::new();
        let now = Instant::now();
        let snapshot_id = harness.initialize(now);
        assert!(harness.connection.is_initialized());

        let outputs = harness.reply(
            &snapshot_id,
            json!([
                {"threadId": "th-b", "turnId": "tu-2"},
                {"threadId": "th-a", "turnId": "tu-1"},
                {"threadId": "th-a", "turnId": "tu-1"}
            ]),
            now,
        );
        assert_eq!(outputs.len(), 3);
        assert!(matches!(
            &outputs[0],
            ConnectionOutput::Notification(Notification::TurnStarted(params))
                if params.from_snapshot && params.turn_id() == Some("tu-2")
        ));
        let ConnectionOutput::Notification(Notification::SnapshotSummary(summary)) = &outputs[2]
        else {
            panic!("expected summary");
        };
        assert_eq!(summary.active_turn_keys, vec!["th-a:tu-1", "th-b:tu-2"]);
        assert!(summary
            .requested_at
            .is_some_and(|at| at <= chrono::Utc::now()));

        let reads: Vec<Value> = harness.sent();
        let threads: Vec<&str> = reads
            .iter()
            .map(|frame| {
                assert_eq!(frame["method"], "thread/read");
                assert_eq!(frame["params"]["includeTurns"], true);
                frame["params"]["threadId"].as_str().expect("thread id")
            })
            .collect();
        assert_eq!(threads, vec!["th-a", "th-b"]);

        let outputs = harness.reply(&reads[0]["id"], json!({"thread": {"name": "Alpha", "cwd": "/a"}}), now);
        let ConnectionOutput::Notification(Notification::ThreadSnapshot(params)) = &outputs[0] else {
            panic!("expected thread snapshot");
        };
        assert_eq!(params.thread.id.as_deref(), Some("th-a"));
        assert_eq!(params.thread.name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn empty_snapshot_falls_back_to_loaded_threads() {
        let mut harness = Harness::new();
        let now = Instant::now();
        let snapshot_id = harness.initialize(now);

        let outputs = harness.reply(&snapshot_id, json!({"activeTurns": []}), now);
        assert!(matches!(
            &outputs[..],
            [ConnectionOutput::Notification(Notification::SnapshotSummary(summary))]
                if summary.active_turn_keys.is_empty()
        ));
        let sent = harness.sent();
        assert_eq!(sent[0]["method"], "thread/loaded/list");

        assert!(harness
            .reply(&sent[0]["id"], json!({"data": ["", "th-z"], "nextCursor": null}), now)
            .is_empty());
        let sent = harness.sent();
        assert_eq!(sent[0]["method"], "thread/read");
        assert_eq!(sent[0]["params"]["threadId"], "th-z");
    }

    #[test]
    fn already_initialized_error_counts_as_success() {
        let mut harness = Harness::new();
        harness.connection.handle_opened();
        let init = harness.sent().remove(0);
        let frame = json!({"id": init["id"], "error": {"code": -32600, "message": "Already initialized"}});
        assert!(harness.connection.handle_frame(&frame.to_string(), Instant::now()).is_empty());
        assert!(harness.connection.is_initialized());
    }

    #[test]
    fn error_responses_resolve_pending_requests() {
        let mut harness = Harness::new();
        let now = Instant::now();
        let snapshot_id = harness.initialize(now);
        assert_eq!(harness.connection.pending_requests(), 1);
        let frame = json!({"id": snapshot_id, "error": {"code": -1, "message": "boom"}});
        assert!(harness.connection.handle_frame(&frame.to_string(), now).is_empty());
        assert_eq!(harness.connection.pending_requests(), 0);
        assert!(harness.connection.is_connected());
    }

    #[test]
    fn refresh_is_throttled() {
        let mut harness = Harness::new();
        let now = Instant::now();
        assert!(harness.connection.refresh_snapshot_if_needed(now).is_empty());
        assert!(harness.sent().is_empty());

        harness.initialize(now);
        harness.connection.refresh_snapshot_if_needed(now + Duration::from_millis(100));
        assert!(harness.sent().is_empty());
        harness.connection.refresh_snapshot_if_needed(now + Duration::from_millis(600));
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "turn/active");
    }

    #[test]
    fn notifications_pass_through_and_garbage_is_dropped() {
        let mut harness = Harness::new();
        let now = Instant::now();
        harness.initialize(now);

        let outputs = harness.connection.handle_frame(
            r#"{"method":"turn/completed","params":{"threadId":"th","turn":{"id":"tu"}}}"#,
            now,
        );
        assert!(matches!(
            &outputs[..],
            [ConnectionOutput::Notification(Notification::TurnCompleted(_))]
        ));
        assert!(harness.connection.handle_frame("not json", now).is_empty());
        assert!(harness
            .connection
            .handle_frame(r#"{"method":"codex/event/unknown","params":{}}"#, now)
            .is_empty());
        assert!(harness
            .connection
            .handle_frame(r#"{"method":"turn/progressTrace","params":{"category":"tool"}}"#, now)
            .is_empty());
        assert!(harness.connection.is_connected());
    }

    #[test]
    fn send_failure_tears_down_and_clears_pending() {
        let mut harness = Harness::new();
        let now = Instant::now();
        harness.initialize(now);
        harness.transport.sever("ep", 3);

        let outputs = harness
            .connection
            .refresh_snapshot_if_needed(now + Duration::from_secs(1));
        assert!(matches!(&outputs[..], [ConnectionOutput::Disconnected { .. }]));
        assert!(harness.connection.is_closed());
        assert!(!harness.connection.is_connected());
        assert_eq!(harness.connection.pending_requests(), 0);
        assert!(harness.connection.handle_closed("late").is_empty());
    }
}
