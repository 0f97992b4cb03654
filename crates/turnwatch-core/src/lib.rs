use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod aggregator;
pub mod lease;
pub mod metadata;
pub mod notification;
pub mod protocol;
pub mod row;
pub mod timeline;
pub mod turn;

pub use aggregator::{AggregatorConfig, TurnAggregator};
pub use lease::RuntimeEndpointLease;
pub use metadata::EndpointMetadata;
pub use notification::Notification;
pub use row::EndpointRow;
pub use timeline::{SegmentKind, TimelineSegment};
pub use turn::{CompletedRun, TraceEvent, Turn, TurnKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl Default for TurnStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::InProgress => "inProgress",
            TurnStatus::Completed => "completed",
            TurnStatus::Interrupted => "interrupted",
            TurnStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnStatus::InProgress)
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "inprogress" | "in_progress" | "in-progress" | "running" => Ok(TurnStatus::InProgress),
            "completed" | "complete" | "done" => Ok(TurnStatus::Completed),
            "interrupted" | "aborted" | "cancelled" | "canceled" => Ok(TurnStatus::Interrupted),
            "failed" | "error" => Ok(TurnStatus::Failed),
            other => Err(format!("Unknown turn status: {other}")),
        }
    }
}

/// Progress categories reported by `turn/progressTrace`.
///
/// Declaration order doubles as the fixed precedence used to break ties
/// between categories that opened at the same instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProgressCategory {
    Tool,
    Edit,
    Waiting,
    Network,
    Prefill,
    Reasoning,
    Gen,
}

impl ProgressCategory {
    pub const ALL: [ProgressCategory; 7] = [
        ProgressCategory::Tool,
        ProgressCategory::Edit,
        ProgressCategory::Waiting,
        ProgressCategory::Network,
        ProgressCategory::Prefill,
        ProgressCategory::Reasoning,
        ProgressCategory::Gen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressCategory::Tool => "tool",
            ProgressCategory::Edit => "edit",
            ProgressCategory::Waiting => "waiting",
            ProgressCategory::Network => "network",
            ProgressCategory::Prefill => "prefill",
            ProgressCategory::Reasoning => "reasoning",
            ProgressCategory::Gen => "gen",
        }
    }

    /// Lower values win ties.
    pub fn precedence(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ProgressCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressCategory {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "tool" => Ok(ProgressCategory::Tool),
            "edit" => Ok(ProgressCategory::Edit),
            "waiting" => Ok(ProgressCategory::Waiting),
            "network" => Ok(ProgressCategory::Network),
            "prefill" => Ok(ProgressCategory::Prefill),
            "reasoning" => Ok(ProgressCategory::Reasoning),
            "gen" | "generation" => Ok(ProgressCategory::Gen),
            other => Err(format!("Unknown progress category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Started,
    Completed,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Started => "started",
            ProgressState::Completed => "completed",
        }
    }
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "started" | "start" | "begin" => Ok(ProgressState::Started),
            "completed" | "complete" | "end" | "ended" | "finished" => {
                Ok(ProgressState::Completed)
            }
            other => Err(format!("Unknown progress state: {other}")),
        }
    }
}

/// Builds the `"threadId:turnId"` key used by snapshot summaries.
pub fn snapshot_turn_key(thread_id: &str, turn_id: &str) -> String {
    format!("{thread_id}:{turn_id}")
}

/// Returns `None` for absent, blank, or whitespace-only strings.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Deserialize an integer that can arrive either as a JSON number or a numeric string.
/// Anything else collapses to `None` instead of failing the enclosing document.
pub(crate) fn deserialize_lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Number(n) => n.as_u64().and_then(|u| u32::try_from(u).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

/// Same as [`deserialize_lenient_u32`] for signed exit codes.
pub(crate) fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_wire_spellings() {
        assert_eq!("inProgress".parse::<TurnStatus>(), Ok(TurnStatus::InProgress));
        assert_eq!("in_progress".parse::<TurnStatus>(), Ok(TurnStatus::InProgress));
        assert_eq!("interrupted".parse::<TurnStatus>(), Ok(TurnStatus::Interrupted));
        assert_eq!("Failed".parse::<TurnStatus>(), Ok(TurnStatus::Failed));
        assert!("weird".parse::<TurnStatus>().is_err());
        assert!(TurnStatus::Completed.is_terminal());
        assert!(!TurnStatus::InProgress.is_terminal());
    }

    #[test]
    fn category_precedence_follows_declaration_order() {
        let ordered: Vec<usize> = ProgressCategory::ALL.iter().map(|c| c.precedence()).collect();
        assert_eq!(ordered, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!("TOOL".parse::<ProgressCategory>(), Ok(ProgressCategory::Tool));
        assert!("cooking".parse::<ProgressCategory>().is_err());
    }

    #[test]
    fn non_blank_filters_whitespace() {
        assert_eq!(non_blank(Some("  ")), None);
        assert_eq!(non_blank(Some(" th-1 ")), Some("th-1"));
        assert_eq!(non_blank(None), None);
    }
}
