//! Typed decoding of the notifications a runtime endpoint pushes.
//!
//! The wire format mixes camelCase and snake_case field names depending on the
//! sender's age, so every multi-word field accepts both spellings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::metadata::{GitInfo, RateLimits, TokenUsage};
use crate::protocol::{decode_params, method, FrameError};
use crate::{deserialize_lenient_i64, non_blank, ProgressCategory, ProgressState, TurnStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    TurnStarted(TurnParams),
    TurnCompleted(TurnParams),
    ProgressTrace(ProgressTraceParams),
    PlanUpdated(PlanUpdatedParams),
    ThreadStarted(ThreadParams),
    ThreadSnapshot(ThreadParams),
    TokenUsageUpdated(TokenUsageParams),
    ItemStarted(ItemParams),
    ItemCompleted(ItemParams),
    Error(ErrorParams),
    RateLimitsUpdated(RateLimitsParams),
    SnapshotSummary(SnapshotSummaryParams),
}

impl Notification {
    /// Decodes a notification by method. Unknown methods yield `Ok(None)`.
    pub fn decode(method_name: &str, params: Option<Value>) -> Result<Option<Self>, FrameError> {
        let notification = match method_name {
            method::TURN_STARTED => Notification::TurnStarted(decode_params(method_name, params)?),
            method::TURN_COMPLETED => {
                Notification::TurnCompleted(decode_params(method_name, params)?)
            }
            method::TURN_PROGRESS_TRACE => {
                Notification::ProgressTrace(decode_params(method_name, params)?)
            }
            method::TURN_PLAN_UPDATED => {
                Notification::PlanUpdated(decode_params(method_name, params)?)
            }
            method::THREAD_STARTED => {
                Notification::ThreadStarted(decode_params(method_name, params)?)
            }
            method::THREAD_SNAPSHOT => {
                Notification::ThreadSnapshot(decode_params(method_name, params)?)
            }
            method::THREAD_TOKEN_USAGE_UPDATED => {
                Notification::TokenUsageUpdated(decode_params(method_name, params)?)
            }
            method::ITEM_STARTED => Notification::ItemStarted(decode_params(method_name, params)?),
            method::ITEM_COMPLETED => {
                Notification::ItemCompleted(decode_params(method_name, params)?)
            }
            method::ERROR => Notification::Error(decode_params(method_name, params)?),
            method::ACCOUNT_RATE_LIMITS_UPDATED => {
                Notification::RateLimitsUpdated(decode_params(method_name, params)?)
            }
            method::THREAD_SNAPSHOT_SUMMARY => {
                Notification::SnapshotSummary(decode_params(method_name, params)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(notification))
    }

    pub fn method(&self) -> &'static str {
        match self {
            Notification::TurnStarted(_) => method::TURN_STARTED,
            Notification::TurnCompleted(_) => method::TURN_COMPLETED,
            Notification::ProgressTrace(_) => method::TURN_PROGRESS_TRACE,
            Notification::PlanUpdated(_) => method::TURN_PLAN_UPDATED,
            Notification::ThreadStarted(_) => method::THREAD_STARTED,
            Notification::ThreadSnapshot(_) => method::THREAD_SNAPSHOT,
            Notification::TokenUsageUpdated(_) => method::THREAD_TOKEN_USAGE_UPDATED,
            Notification::ItemStarted(_) => method::ITEM_STARTED,
            Notification::ItemCompleted(_) => method::ITEM_COMPLETED,
            Notification::Error(_) => method::ERROR,
            Notification::RateLimitsUpdated(_) => method::ACCOUNT_RATE_LIMITS_UPDATED,
            Notification::SnapshotSummary(_) => method::THREAD_SNAPSHOT_SUMMARY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TurnErrorRef {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TurnRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<TurnErrorRef>,
}

/// Shared by `turn/started` and `turn/completed`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TurnParams {
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub turn: Option<TurnRef>,
    #[serde(default, alias = "turn_id")]
    pub turn_id: Option<String>,
    #[serde(default, alias = "from_snapshot")]
    pub from_snapshot: bool,
}

impl TurnParams {
    pub fn snapshot(thread_id: &str, turn_id: &str) -> Self {
        Self {
            thread_id: Some(thread_id.to_string()),
            turn: Some(TurnRef {
                id: Some(turn_id.to_string()),
                status: Some(TurnStatus::InProgress.as_str().to_string()),
                ..TurnRef::default()
            }),
            turn_id: None,
            from_snapshot: true,
        }
    }

    pub fn turn_id(&self) -> Option<&str> {
        non_blank(self.turn.as_ref().and_then(|turn| turn.id.as_deref()))
            .or_else(|| non_blank(self.turn_id.as_deref()))
    }

    pub fn thread_id(&self) -> Option<&str> {
        non_blank(self.thread_id.as_deref())
    }

    pub fn model(&self) -> Option<&str> {
        non_blank(self.turn.as_ref().and_then(|turn| turn.model.as_deref()))
    }

    /// Terminal status carried by a completion. Missing or non-terminal values mean `Completed`.
    pub fn completion_status(&self) -> TurnStatus {
        self.turn
            .as_ref()
            .and_then(|turn| turn.status.as_deref())
            .and_then(|status| status.parse::<TurnStatus>().ok())
            .filter(TurnStatus::is_terminal)
            .unwrap_or(TurnStatus::Completed)
    }

    pub fn error_message(&self) -> Option<&str> {
        non_blank(
            self.turn
                .as_ref()
                .and_then(|turn| turn.error.as_ref())
                .and_then(|error| error.message.as_deref()),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTraceParams {
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(alias = "turn_id")]
    pub turn_id: String,
    pub category: String,
    pub state: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl ProgressTraceParams {
    pub fn category(&self) -> Option<ProgressCategory> {
        self.category.parse().ok()
    }

    pub fn state(&self) -> Option<ProgressState> {
        self.state.parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStepParams {
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdatedParams {
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(alias = "turn_id")]
    pub turn_id: String,
    #[serde(default)]
    pub plan: Vec<PlanStepParams>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "git_info")]
    pub git_info: Option<GitInfo>,
}

/// `thread/started` and the locally synthesized `thread/snapshot`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadParams {
    pub thread: ThreadInfo,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageParams {
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(default, alias = "turn_id")]
    pub turn_id: Option<String>,
    #[serde(alias = "token_usage")]
    pub token_usage: TokenUsage,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeParams {
    pub path: String,
    #[serde(default, deserialize_with = "deserialize_change_kind")]
    pub kind: Option<String>,
}

/// Item payloads of interest. Other item types decode with only `kind` set.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_command")]
    pub command: Option<String>,
    #[serde(default, alias = "exit_code", deserialize_with = "deserialize_lenient_i64")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub changes: Vec<FileChangeParams>,
}

pub const ITEM_COMMAND_EXECUTION: &str = "commandExecution";
pub const ITEM_FILE_CHANGE: &str = "fileChange";

impl ItemInfo {
    pub fn is_command(&self) -> bool {
        self.kind == ITEM_COMMAND_EXECUTION || self.kind == "command_execution"
    }

    pub fn is_file_change(&self) -> bool {
        self.kind == ITEM_FILE_CHANGE || self.kind == "file_change"
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemParams {
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(alias = "turn_id")]
    pub turn_id: String,
    pub item: ItemInfo,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorParams {
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "will_retry")]
    pub will_retry: bool,
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
    #[serde(default, alias = "turn_id")]
    pub turn_id: Option<String>,
}

impl ErrorParams {
    pub fn message(&self) -> &str {
        non_blank(self.error.as_ref().and_then(|error| error.message.as_deref()))
            .or_else(|| non_blank(self.message.as_deref()))
            .unwrap_or("Unknown error")
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsParams {
    #[serde(alias = "rate_limits")]
    pub rate_limits: RateLimits,
}

/// Authoritative set of `"threadId:turnId"` keys active on an endpoint, as of
/// `requested_at`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummaryParams {
    #[serde(default, alias = "active_turn_keys")]
    pub active_turn_keys: Vec<String>,
    #[serde(default, alias = "requested_at")]
    pub requested_at: Option<DateTime<Utc>>,
}

fn deserialize_command<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(command) => non_blank(Some(&command)).map(str::to_string),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            non_blank(Some(&joined)).map(str::to_string)
        }
        _ => None,
    })
}

/// Change kinds arrive either as a bare string or as a `{"type": ...}` object.
fn deserialize_change_kind<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::String(kind) => Some(kind),
        Value::Object(map) => map
            .get("type")
            .or_else(|| map.get("kind"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}
