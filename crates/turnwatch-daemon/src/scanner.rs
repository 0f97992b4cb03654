//! Lease directory scan: liveness, freshness and garbage collection.

use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};
use turnwatch_core::lease::{endpoint_id_from_path, parse_lease, pid_from_endpoint_id, LeaseError};
use turnwatch_core::RuntimeEndpointLease;
use url::Url;

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub freshness_window: chrono::Duration,
    pub stale_ttl: chrono::Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            freshness_window: chrono::Duration::seconds(15),
            stale_ttl: chrono::Duration::minutes(30),
        }
    }
}

pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(pid, 0) only probes process existence and sends no signal.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcReason {
    DeadPid,
    ExpiredHeartbeat,
    AbandonedFile,
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcReason::DeadPid => "dead_pid",
            GcReason::ExpiredHeartbeat => "expired_heartbeat",
            GcReason::AbandonedFile => "abandoned_file",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseVerdict {
    Active,
    Inactive,
    Delete(GcReason),
}

/// What one scan learned about a lease file.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeaseObservation {
    /// `None` when no pid could be determined.
    pub pid_alive: Option<bool>,
    pub heartbeat_age: Option<chrono::Duration>,
    pub file_age: Option<chrono::Duration>,
    pub parsed: bool,
}

pub fn assess(observation: &LeaseObservation, config: &ScannerConfig) -> LeaseVerdict {
    if observation.pid_alive == Some(false) {
        return LeaseVerdict::Delete(GcReason::DeadPid);
    }
    if let Some(age) = observation.heartbeat_age {
        if age > config.stale_ttl {
            return LeaseVerdict::Delete(GcReason::ExpiredHeartbeat);
        }
    }
    if observation.heartbeat_age.is_none() && observation.pid_alive.is_none() {
        if let Some(age) = observation.file_age {
            if age > config.stale_ttl {
                return LeaseVerdict::Delete(GcReason::AbandonedFile);
            }
        }
    }
    if !observation.parsed {
        return LeaseVerdict::Inactive;
    }
    let fresh = observation
        .heartbeat_age
        .map_or(true, |age| age <= config.freshness_window);
    if fresh && observation.pid_alive.unwrap_or(true) {
        LeaseVerdict::Active
    } else {
        LeaseVerdict::Inactive
    }
}

pub struct LeaseScanner {
    dir: PathBuf,
    config: ScannerConfig,
    probe: Arc<dyn ProcessProbe>,
}

impl LeaseScanner {
    pub fn new(dir: PathBuf, config: ScannerConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { dir, config, probe }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns every active lease keyed by endpoint id, deleting garbage on the way.
    pub fn scan(&self, now: DateTime<Utc>) -> BTreeMap<String, RuntimeEndpointLease> {
        let mut active = BTreeMap::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return active,
            Err(err) => {
                warn!(event = "lease_dir_read_error", dir = %self.dir.display(), error = %err);
                return active;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(endpoint_id) = endpoint_id_from_path(&path) else {
                continue;
            };
            if let Some(lease) = self.scan_file(&path, &endpoint_id, now) {
                active.insert(endpoint_id, lease);
            }
        }
        active
    }

    fn scan_file(
        &self,
        path: &Path,
        endpoint_id: &str,
        now: DateTime<Utc>,
    ) -> Option<RuntimeEndpointLease> {
        let file_age = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(|modified| now.signed_duration_since(DateTime::<Utc>::from(modified)));
        let parsed = fs::read(path)
            .map_err(LeaseError::from)
            .and_then(|bytes| parse_lease(endpoint_id, &bytes));
        let lease = match parsed {
            Ok(lease) => Some(lease),
            Err(err) => {
                debug!(event = "lease_parse_error", endpoint_id, error = %err);
                None
            }
        };

        let pid = lease
            .as_ref()
            .and_then(|lease| lease.pid)
            .or_else(|| pid_from_endpoint_id(endpoint_id));
        let observation = LeaseObservation {
            pid_alive: pid.map(|pid| self.probe.is_alive(pid)),
            heartbeat_age: lease
                .as_ref()
                .and_then(|lease| lease.last_heartbeat_at)
                .map(|heartbeat| now.signed_duration_since(heartbeat)),
            file_age,
            parsed: lease.is_some(),
        };

        match assess(&observation, &self.config) {
            LeaseVerdict::Active => {
                let lease = lease?;
                if !is_websocket_url(&lease.connect_url) {
                    warn!(
                        event = "lease_bad_url",
                        endpoint_id,
                        url = %lease.connect_url
                    );
                    return None;
                }
                Some(lease)
            }
            LeaseVerdict::Inactive => None,
            LeaseVerdict::Delete(reason) => {
                remove_lease_file(path, endpoint_id, reason);
                None
            }
        }
    }
}

fn is_websocket_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "ws" | "wss"))
        .unwrap_or(false)
}

fn remove_lease_file(path: &Path, endpoint_id: &str, reason: GcReason) {
    match fs::remove_file(path) {
        Ok(()) => info!(event = "lease_deleted", endpoint_id, reason = %reason),
        // The owner may have cleaned up first.
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(event = "lease_delete_error", endpoint_id, error = %err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeProbe {
        alive: HashSet<u32>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }
    }

    fn scanner(dir: &Path, alive: &[u32]) -> LeaseScanner {
        LeaseScanner::new(
            dir.to_path_buf(),
            ScannerConfig::default(),
            Arc::new(FakeProbe {
                alive: alive.iter().copied().collect(),
            }),
        )
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write lease");
        path
    }

    fn ts(at: DateTime<Utc>) -> String {
        at.to_rfc3339()
    }

    #[test]
    fn fresh_lease_with_live_pid_is_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        write(
            dir.path(),
            "desk.json",
            &format!(
                r#"{{"endpointUrl":"ws://127.0.0.1:4100","pid":"41","lastHeartbeatAt":"{}"}}"#,
                ts(now)
            ),
        );
        write(dir.path(), "notes.txt", "ignored");

        let leases = scanner(dir.path(), &[41]).scan(now);
        assert_eq!(leases.len(), 1);
        let lease = &leases["desk"];
        assert_eq!(lease.connect_url, "ws://127.0.0.1:4100");
        assert_eq!(lease.pid, Some(41));
    }

    #[test]
    fn stale_heartbeat_is_inactive_then_deleted_after_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let path = write(
            dir.path(),
            "a.json",
            &format!(
                r#"{{"endpointUrl":"ws://h:1","pid":7,"lastHeartbeatAt":"{}"}}"#,
                ts(now - chrono::Duration::seconds(60))
            ),
        );
        let scan = scanner(dir.path(), &[7]);
        assert!(scan.scan(now).is_empty());
        assert!(path.exists());

        assert!(scan.scan(now + chrono::Duration::minutes(31)).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn dead_pid_is_deleted_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "pid:9.json", r#"{"endpointUrl":"ws://h:1"}"#);
        assert!(scanner(dir.path(), &[]).scan(Utc::now()).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn old_live_lease_with_fresh_heartbeat_survives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let later = Utc::now() + chrono::Duration::hours(5);
        let path = write(
            dir.path(),
            "b.json",
            &format!(
                r#"{{"endpointUrl":"ws://h:1","pid":3,"lastHeartbeatAt":"{}"}}"#,
                ts(later)
            ),
        );
        let leases = scanner(dir.path(), &[3]).scan(later);
        assert_eq!(leases.len(), 1);
        assert!(path.exists());
    }

    #[test]
    fn unparsable_file_without_pid_is_collected_once_old() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "broken.json", "{\"endpointUrl\":");
        let scan = scanner(dir.path(), &[]);
        assert!(scan.scan(Utc::now()).is_empty());
        assert!(path.exists());
        assert!(scan.scan(Utc::now() + chrono::Duration::hours(1)).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn non_websocket_urls_are_skipped_and_missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "c.json", r#"{"endpointUrl":"http://h:1","pid":5}"#);
        assert!(scanner(dir.path(), &[5]).scan(Utc::now()).is_empty());
        assert!(scanner(&dir.path().join("missing"), &[5]).scan(Utc::now()).is_empty());
    }

    #[test]
    fn assessment_rules() {
        let config = ScannerConfig::default();
        let observation = LeaseObservation {
            pid_alive: None,
            heartbeat_age: None,
            file_age: Some(chrono::Duration::minutes(45)),
            parsed: true,
        };
        assert_eq!(
            assess(&observation, &config),
            LeaseVerdict::Delete(GcReason::AbandonedFile)
        );
        let young = LeaseObservation {
            file_age: Some(chrono::Duration::seconds(5)),
            ..observation
        };
        assert_eq!(assess(&young, &config), LeaseVerdict::Active);
        let alive_old = LeaseObservation {
            pid_alive: Some(true),
            ..observation
        };
        assert_eq!(assess(&alive_old, &config), LeaseVerdict::Active);
        assert!(!SystemProcessProbe.is_alive(0));
    }
}
