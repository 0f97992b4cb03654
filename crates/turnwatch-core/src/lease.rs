use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

use crate::{deserialize_lenient_u32, non_blank};

pub const LEASE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("lease json invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lease has no endpointUrl")]
    MissingEndpointUrl,
}

/// On-disk shape of a lease file. Only `endpointUrl` is required.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeaseFile {
    #[serde(default, alias = "endpoint_url")]
    pub endpoint_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_u32")]
    pub pid: Option<u32>,
    #[serde(default, alias = "last_heartbeat_at", deserialize_with = "deserialize_lenient_time")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "started_at", deserialize_with = "deserialize_lenient_time")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEndpointLease {
    pub endpoint_id: String,
    pub connect_url: String,
    pub pid: Option<u32>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl RuntimeEndpointLease {
    /// Fresh when the heartbeat is within `window`, or when no heartbeat was ever written.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.last_heartbeat_at {
            Some(heartbeat) => now.signed_duration_since(heartbeat) <= window,
            None => true,
        }
    }
}

fn deserialize_lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    })
}

/// Endpoint id is the file stem; files without the lease extension are not leases.
pub fn endpoint_id_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(LEASE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    non_blank(Some(stem)).map(str::to_string)
}

/// Accepts `1234`, `pid:1234` and `pid-1234`.
pub fn pid_from_endpoint_id(endpoint_id: &str) -> Option<u32> {
    let trimmed = endpoint_id.trim();
    let digits = trimmed
        .strip_prefix("pid:")
        .or_else(|| trimmed.strip_prefix("pid-"))
        .unwrap_or(trimmed);
    digits.parse::<u32>().ok().filter(|pid| *pid > 0)
}

pub fn parse_lease_file(bytes: &[u8]) -> Result<LeaseFile, LeaseError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Builds the lease for `endpoint_id`, falling back to the id for the pid.
pub fn parse_lease(endpoint_id: &str, bytes: &[u8]) -> Result<RuntimeEndpointLease, LeaseError> {
    let file = parse_lease_file(bytes)?;
    let connect_url = non_blank(file.endpoint_url.as_deref())
        .ok_or(LeaseError::MissingEndpointUrl)?
        .to_string();
    Ok(RuntimeEndpointLease {
        endpoint_id: endpoint_id.to_string(),
        connect_url,
        pid: file
            .pid
            .filter(|pid| *pid > 0)
            .or_else(|| pid_from_endpoint_id(endpoint_id)),
        last_heartbeat_at: file.last_heartbeat_at,
        started_at: file.started_at,
    })
}
