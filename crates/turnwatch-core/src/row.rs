use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metadata::{EndpointError, EndpointMetadata, GitInfo, RateLimits, TokenUsage};
use crate::timeline::TimelineSegment;
use crate::turn::{CommandRecord, CompletedRun, FileChangeRecord, PlanStep, Turn};
use crate::{ProgressCategory, TurnStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnView {
    pub turn_id: String,
    pub thread_id: Option<String>,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub label: Option<String>,
    pub error_message: Option<String>,
    pub active_categories: Vec<ProgressCategory>,
    pub plan: Vec<PlanStep>,
    pub commands: Vec<CommandRecord>,
    pub file_changes: Vec<FileChangeRecord>,
    pub timeline: Vec<TimelineSegment>,
}

impl TurnView {
    pub fn from_turn(turn: &Turn, now: DateTime<Utc>) -> Self {
        Self {
            turn_id: turn.key.turn_id.clone(),
            thread_id: turn.thread_id.clone(),
            status: turn.status,
            started_at: turn.started_at,
            ended_at: turn.ended_at,
            label: turn.display_label().map(str::to_string),
            error_message: turn.error_message.clone(),
            active_categories: turn.active_categories(),
            plan: turn.plan().to_vec(),
            commands: turn.commands().to_vec(),
            file_changes: turn.file_changes().to_vec(),
            timeline: turn.timeline(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub turn_id: String,
    pub thread_id: Option<String>,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub label: Option<String>,
    pub error_message: Option<String>,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub commands: Vec<CommandRecord>,
    pub file_changes: Vec<FileChangeRecord>,
    pub timeline: Vec<TimelineSegment>,
}

impl From<&CompletedRun> for RunView {
    fn from(run: &CompletedRun) -> Self {
        Self {
            turn_id: run.turn_id.clone(),
            thread_id: run.thread_id.clone(),
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            label: run.label.clone(),
            error_message: run.error_message.clone(),
            model: run.model.clone(),
            token_usage: run.token_usage,
            commands: run.commands.clone(),
            file_changes: run.file_changes.clone(),
            timeline: run.timeline(),
        }
    }
}

/// Read-only projection of one endpoint handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRow {
    pub endpoint_id: String,
    pub thread_id: Option<String>,
    pub chat_title: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub last_error: Option<EndpointError>,
    pub rate_limits: Option<RateLimits>,
    pub git_info: Option<GitInfo>,
    pub is_working: bool,
    /// Most recently started in-progress turn.
    pub active_turn: Option<TurnView>,
    /// Every turn still in the live table, newest first.
    pub live_turns: Vec<TurnView>,
    /// Archived runs, newest first.
    pub recent_runs: Vec<RunView>,
}

impl EndpointRow {
    pub fn build(
        endpoint_id: &str,
        metadata: Option<&EndpointMetadata>,
        turns: &[&Turn],
        runs: &[CompletedRun],
        now: DateTime<Utc>,
    ) -> Self {
        let mut live_turns: Vec<TurnView> = turns
            .iter()
            .map(|turn| TurnView::from_turn(turn, now))
            .collect();
        live_turns.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.turn_id.cmp(&b.turn_id))
        });
        let active_turn = live_turns
            .iter()
            .find(|turn| turn.status == TurnStatus::InProgress)
            .cloned();
        let thread_id = metadata
            .and_then(|meta| meta.thread_id.clone())
            .or_else(|| active_turn.as_ref().and_then(|turn| turn.thread_id.clone()));

        Self {
            endpoint_id: endpoint_id.to_string(),
            thread_id,
            chat_title: metadata.and_then(|meta| meta.chat_title.clone()),
            cwd: metadata.and_then(|meta| meta.cwd.clone()),
            model: metadata.and_then(|meta| meta.model.clone()),
            token_usage: metadata.and_then(|meta| meta.token_usage),
            last_error: metadata.and_then(|meta| meta.last_error.clone()),
            rate_limits: metadata.and_then(|meta| meta.rate_limits.clone()),
            git_info: metadata.and_then(|meta| meta.git_info.clone()),
            is_working: active_turn.is_some(),
            active_turn,
            live_turns,
            recent_runs: runs.iter().map(RunView::from).collect(),
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let title = self.chat_title.as_deref().unwrap_or("-");
        let context = self
            .token_usage
            .as_ref()
            .and_then(TokenUsage::context_used_percent)
            .map(|percent| format!(" ctx={percent:.0}%"))
            .unwrap_or_default();
        let line = match &self.active_turn {
            Some(turn) => {
                let category = turn
                    .active_categories
                    .first()
                    .map(|category| category.as_str())
                    .unwrap_or("idle");
                let label = turn.label.as_deref().unwrap_or("");
                format!(
                    "{} [{}] working turn={} {} {}",
                    self.endpoint_id, title, turn.turn_id, category, label
                )
                .trim_end()
                .to_string()
            }
            None => format!(
                "{} [{}] idle runs={}",
                self.endpoint_id,
                title,
                self.recent_runs.len()
            ),
        };
        line + &context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TokenBreakdown;
    use crate::turn::TurnKey;
    use crate::ProgressState;
    use chrono::TimeZone;

    #[test]
    fn summary_reports_activity_and_context_share() {
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap();
        let metadata = EndpointMetadata {
            chat_title: Some("Ship it".to_string()),
            token_usage: Some(TokenUsage {
                last: TokenBreakdown {
                    total_tokens: 250,
                    ..TokenBreakdown::default()
                },
                model_context_window: Some(1000),
                ..TokenUsage::default()
            }),
            ..EndpointMetadata::default()
        };
        let mut turn = Turn::new(TurnKey::new("ep", "tu"), Some("th"), now);
        turn.record_progress(ProgressCategory::Tool, ProgressState::Started, Some("cargo test"), now);

        let row = EndpointRow::build("ep", Some(&metadata), &[&turn], &[], now);
        assert_eq!(row.summary(), "ep [Ship it] working turn=tu tool cargo test ctx=25%");

        let idle = EndpointRow::build("ep", None, &[], &[], now);
        assert_eq!(idle.summary(), "ep [-] idle runs=0");
    }
}
