use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use turnwatch_core::EndpointRow;
use turnwatch_daemon::logging::init_logging;
use turnwatch_daemon::{
    load_config, Args, ConnectionManager, LeaseScanner, MonitorEvent, MonitorHandle,
    SystemProcessProbe, WebSocketTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args).context("resolve configuration")?;
    let log_targets = init_logging(&config.log);

    let lease_dir = config.lease_dir();
    info!(
        event = "turnwatch_start",
        codex_home = %config.codex_home.display(),
        lease_dir = %lease_dir.display(),
        log_file = ?log_targets.path()
    );
    let scanner = LeaseScanner::new(
        lease_dir,
        config.scanner.clone(),
        Arc::new(SystemProcessProbe),
    );
    let (manager, handle) = ConnectionManager::new(
        config.manager.clone(),
        scanner,
        config.watch_chain(),
        Arc::new(WebSocketTransport),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(manager.run(shutdown_rx));
    let consumer_task = tokio::spawn(consume(handle, config.json));

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    info!(event = "turnwatch_shutdown");
    let _ = shutdown_tx.send(true);
    if let Err(err) = manager_task.await {
        warn!(event = "manager_join_error", error = %err);
    }
    consumer_task.abort();
    Ok(())
}

/// Stands in for a presentation layer: logs every change, or prints rows as JSON lines.
async fn consume(mut handle: MonitorHandle, json: bool) {
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                match event {
                    Some(MonitorEvent::ConnectionStateChanged(state)) => {
                        info!(event = "monitor_state", state = %state);
                    }
                    Some(MonitorEvent::EndpointIdsChanged(ids)) => {
                        info!(event = "monitor_endpoints", endpoints = ?ids);
                    }
                    None => break,
                }
            }
            changed = handle.rows.changed() => {
                if changed.is_err() {
                    break;
                }
                let rows = handle.rows.borrow_and_update().clone();
                if json {
                    print_rows(&rows);
                } else {
                    for row in &rows {
                        info!(event = "endpoint_row", summary = %row.summary());
                    }
                }
            }
        }
    }
}

fn print_rows(rows: &[EndpointRow]) {
    match serde_json::to_string(rows) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
            let _ = stdout.flush();
        }
        Err(err) => warn!(event = "rows_encode_error", error = %err),
    }
}
