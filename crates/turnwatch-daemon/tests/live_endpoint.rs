use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use turnwatch_core::{EndpointRow, ProgressCategory, SegmentKind, TurnStatus};
use turnwatch_daemon::{
    ConnectionManager, ConnectionState, LeaseScanner, ManagerConfig, MonitorEvent, ScannerConfig,
    SystemProcessProbe, WebSocketTransport,
};

const ENDPOINT_ID: &str = "it-endpoint";

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("server send");
}

/// Plays the runtime side: one active turn that runs a tool and then completes.
async fn serve(listener: TcpListener) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut ws = accept_async(stream).await.expect("handshake");
    let mut snapshot_calls = 0;
    let mut turn_played = false;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).expect("client frame");
        let Some(method) = frame["method"].as_str() else {
            continue;
        };
        let id = frame["id"].clone();
        match method {
            "initialize" => send(&mut ws, json!({"id": id, "result": {"userAgent": "fake"}})).await,
            "turn/active" => {
                snapshot_calls += 1;
                let result = if snapshot_calls == 1 {
                    json!([{"threadId": "th-1", "turnId": "tu-1"}])
                } else {
                    json!([])
                };
                send(&mut ws, json!({"id": id, "result": result})).await;
            }
            "thread/read" => {
                send(
                    &mut ws,
                    json!({"id": id, "result": {"thread": {"id": "th-1", "name": "Integration run", "cwd": "/work"}}}),
                )
                .await;
                if turn_played {
                    continue;
                }
                turn_played = true;
                send(
                    &mut ws,
                    json!({"method": "turn/progressTrace", "params": {
                        "threadId": "th-1", "turnId": "tu-1",
                        "category": "tool", "state": "started", "label": "cargo test"
                    }}),
                )
                .await;
                tokio::time::sleep(Duration::from_millis(60)).await;
                send(
                    &mut ws,
                    json!({"method": "turn/progressTrace", "params": {
                        "threadId": "th-1", "turnId": "tu-1",
                        "category": "tool", "state": "completed"
                    }}),
                )
                .await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                send(
                    &mut ws,
                    json!({"method": "turn/completed", "params": {
                        "threadId": "th-1", "turn": {"id": "tu-1", "status": "completed"}
                    }}),
                )
                .await;
            }
            "thread/loaded/list" => send(&mut ws, json!({"id": id, "result": {"data": []}})).await,
            _ => {}
        }
    }
}

fn lease_json(addr: std::net::SocketAddr) -> String {
    json!({
        "endpointUrl": format!("ws://{addr}"),
        "pid": std::process::id(),
        "lastHeartbeatAt": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

fn finished(rows: &[EndpointRow]) -> bool {
    rows.iter().any(|row| {
        row.endpoint_id == ENDPOINT_ID
            && row.chat_title.as_deref() == Some("Integration run")
            && !row.recent_runs.is_empty()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_tracks_a_live_endpoint_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve(listener));

    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join(format!("{ENDPOINT_ID}.json")), lease_json(addr))
        .expect("write lease");

    let config = ManagerConfig {
        scan_interval: Duration::from_secs(1),
        refresh_interval: Duration::from_millis(300),
        eviction_interval: Duration::from_millis(100),
        ..ManagerConfig::default()
    };
    let scanner = LeaseScanner::new(
        dir.path().to_path_buf(),
        ScannerConfig::default(),
        Arc::new(SystemProcessProbe),
    );
    let (manager, mut handle) = ConnectionManager::new(
        config,
        scanner,
        vec![dir.path().to_path_buf()],
        Arc::new(WebSocketTransport),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(manager.run(shutdown_rx));

    let rows = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let rows = handle.rows.borrow_and_update();
                if finished(&rows) {
                    return rows.clone();
                }
            }
            handle.rows.changed().await.expect("rows channel");
        }
    })
    .await
    .expect("endpoint row with an archived run");

    let row = rows
        .iter()
        .find(|row| row.endpoint_id == ENDPOINT_ID)
        .expect("row");
    assert_eq!(row.cwd.as_deref(), Some("/work"));
    let run = &row.recent_runs[0];
    assert_eq!(run.turn_id, "tu-1");
    assert_eq!(run.status, TurnStatus::Completed);
    assert!(run
        .timeline
        .iter()
        .any(|segment| segment.kind == SegmentKind::Category(ProgressCategory::Tool)));

    let mut events = Vec::new();
    while let Ok(event) = handle.events.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&MonitorEvent::ConnectionStateChanged(ConnectionState::Connected)));
    assert!(events.contains(&MonitorEvent::EndpointIdsChanged(vec![ENDPOINT_ID.to_string()])));

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(5), manager_task)
        .await
        .expect("manager stops")
        .expect("manager task");
    let event = handle.events.recv().await;
    assert!(event.is_some());
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lease_written_after_start_is_picked_up_by_the_watcher() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(serve(listener));

    let dir = tempfile::tempdir().expect("tempdir");
    let config = ManagerConfig {
        scan_interval: Duration::from_secs(60),
        refresh_interval: Duration::from_secs(60),
        ..ManagerConfig::default()
    };
    let scanner = LeaseScanner::new(
        dir.path().to_path_buf(),
        ScannerConfig::default(),
        Arc::new(SystemProcessProbe),
    );
    let (manager, mut handle) = ConnectionManager::new(
        config,
        scanner,
        vec![dir.path().to_path_buf()],
        Arc::new(WebSocketTransport),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(manager.run(shutdown_rx));

    // Let the first scan run against the empty directory and the watch arm.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let staged = dir.path().join(format!("{ENDPOINT_ID}.json.tmp"));
    std::fs::write(&staged, lease_json(addr)).expect("write staged lease");
    std::fs::rename(&staged, dir.path().join(format!("{ENDPOINT_ID}.json")))
        .expect("publish lease");

    let discovered = MonitorEvent::EndpointIdsChanged(vec![ENDPOINT_ID.to_string()]);
    let connected = MonitorEvent::ConnectionStateChanged(ConnectionState::Connected);
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut seen = Vec::new();
        while let Some(event) = handle.events.recv().await {
            seen.push(event);
            if seen.contains(&discovered) && seen.contains(&connected) {
                return;
            }
        }
        panic!("event channel closed");
    })
    .await
    .expect("lease discovered well before the next periodic scan");

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(5), manager_task)
        .await
        .expect("manager stops")
        .expect("manager task");
    server.abort();
}
