use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::metadata::{EndpointMetadata, TokenUsage};
use crate::notification::{ItemInfo, PlanStepParams};
use crate::timeline::{self, TimelineSegment};
use crate::{non_blank, ProgressCategory, ProgressState, TurnStatus};

pub const TRACE_HISTORY_CAP: usize = 128;
pub const TURN_DETAIL_CAP: usize = 64;
pub const RECENT_CATEGORY_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnKey {
    pub endpoint_id: String,
    pub turn_id: String,
}

impl TurnKey {
    pub fn new(endpoint_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            turn_id: turn_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub category: ProgressCategory,
    pub state: ProgressState,
    pub label: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub step: String,
    pub status: String,
}

impl PlanStep {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.status.as_str(),
            "inProgress" | "in_progress" | "in-progress" | "running"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub item_id: Option<String>,
    pub command: String,
    pub exit_code: Option<i64>,
    pub status: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeRecord {
    pub path: String,
    pub kind: String,
    pub at: DateTime<Utc>,
}

/// Live state of one turn. Only the aggregator mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub key: TurnKey,
    pub thread_id: Option<String>,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub latest_label: Option<String>,
    pub error_message: Option<String>,
    /// Time of the last live notification that touched this turn.
    pub last_activity_at: DateTime<Utc>,
    /// Set when the terminal status came from snapshot reconciliation rather
    /// than a `turn/completed` notification.
    pub closed_by_snapshot: bool,
    open_counts: BTreeMap<ProgressCategory, u32>,
    opened_at: BTreeMap<ProgressCategory, DateTime<Utc>>,
    trace_history: Vec<TraceEvent>,
    plan: Vec<PlanStep>,
    commands: Vec<CommandRecord>,
    file_changes: Vec<FileChangeRecord>,
}

fn push_capped<T>(items: &mut Vec<T>, item: T, cap: usize) {
    items.push(item);
    if items.len() > cap {
        let overflow = items.len() - cap;
        items.drain(..overflow);
    }
}

impl Turn {
    pub fn new(key: TurnKey, thread_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            thread_id: non_blank(thread_id).map(str::to_string),
            status: TurnStatus::InProgress,
            started_at: now,
            ended_at: None,
            latest_label: None,
            error_message: None,
            last_activity_at: now,
            closed_by_snapshot: false,
            open_counts: BTreeMap::new(),
            opened_at: BTreeMap::new(),
            trace_history: Vec::new(),
            plan: Vec::new(),
            commands: Vec::new(),
            file_changes: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_thread_id(&mut self, thread_id: Option<&str>) {
        if let Some(thread_id) = non_blank(thread_id) {
            self.thread_id = Some(thread_id.to_string());
        }
    }

    pub fn trace_history(&self) -> &[TraceEvent] {
        &self.trace_history
    }

    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    pub fn commands(&self) -> &[CommandRecord] {
        &self.commands
    }

    pub fn file_changes(&self) -> &[FileChangeRecord] {
        &self.file_changes
    }

    pub fn open_count(&self, category: ProgressCategory) -> u32 {
        self.open_counts.get(&category).copied().unwrap_or(0)
    }

    /// Counts drive liveness; the history records every call regardless.
    pub fn record_progress(
        &mut self,
        category: ProgressCategory,
        state: ProgressState,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let count = self.open_counts.entry(category).or_insert(0);
        match state {
            ProgressState::Started => {
                if *count == 0 {
                    self.opened_at.insert(category, now);
                }
                *count += 1;
                if let Some(label) = non_blank(label) {
                    self.latest_label = Some(label.to_string());
                }
            }
            ProgressState::Completed => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.open_counts.remove(&category);
                    self.opened_at.remove(&category);
                }
            }
        }
        push_capped(
            &mut self.trace_history,
            TraceEvent {
                category,
                state,
                label: non_blank(label).map(str::to_string),
                at: now,
            },
            TRACE_HISTORY_CAP,
        );
    }

    /// Open categories, most recently opened first. With nothing open, the last
    /// few distinct categories seen in the history.
    pub fn active_categories(&self) -> Vec<ProgressCategory> {
        let mut open: Vec<(ProgressCategory, DateTime<Utc>)> = self
            .open_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(category, _)| {
                let opened = self.opened_at.get(category).copied().unwrap_or(self.started_at);
                (*category, opened)
            })
            .collect();
        if !open.is_empty() {
            open.sort_by(|(a_cat, a_at), (b_cat, b_at)| {
                b_at.cmp(a_at).then(a_cat.precedence().cmp(&b_cat.precedence()))
            });
            return open.into_iter().map(|(category, _)| category).collect();
        }

        let mut recent = Vec::new();
        for event in self.trace_history.iter().rev() {
            if !recent.contains(&event.category) {
                recent.push(event.category);
                if recent.len() == RECENT_CATEGORY_LIMIT {
                    break;
                }
            }
        }
        recent
    }

    /// Progress label if present, otherwise the in-progress plan step.
    pub fn display_label(&self) -> Option<&str> {
        non_blank(self.latest_label.as_deref()).or_else(|| {
            self.plan
                .iter()
                .find(|step| step.is_in_progress())
                .and_then(|step| non_blank(Some(step.step.as_str())))
        })
    }

    pub fn apply_plan(&mut self, steps: &[PlanStepParams]) {
        self.plan = steps
            .iter()
            .filter_map(|step| {
                non_blank(Some(step.step.as_str())).map(|text| PlanStep {
                    step: text.to_string(),
                    status: step.status.trim().to_string(),
                })
            })
            .collect();
    }

    pub fn record_item_started(&mut self, item: &ItemInfo) {
        if item.is_command() {
            if let Some(command) = non_blank(item.command.as_deref()) {
                self.latest_label = Some(command.to_string());
            }
        } else if item.is_file_change() {
            if let Some(change) = item.changes.first() {
                self.latest_label = Some(format!("Editing {}", change.path));
            }
        }
    }

    pub fn record_item_completed(&mut self, item: &ItemInfo, now: DateTime<Utc>) {
        if item.is_command() {
            let Some(command) = non_blank(item.command.as_deref()) else {
                return;
            };
            push_capped(
                &mut self.commands,
                CommandRecord {
                    item_id: item.id.clone(),
                    command: command.to_string(),
                    exit_code: item.exit_code,
                    status: item.status.clone(),
                    at: now,
                },
                TURN_DETAIL_CAP,
            );
        } else if item.is_file_change() {
            for change in &item.changes {
                if non_blank(Some(change.path.as_str())).is_none() {
                    continue;
                }
                push_capped(
                    &mut self.file_changes,
                    FileChangeRecord {
                        path: change.path.clone(),
                        kind: change.kind.clone().unwrap_or_else(|| "update".to_string()),
                        at: now,
                    },
                    TURN_DETAIL_CAP,
                );
            }
        }
    }

    /// Moves the turn into `status`, closing every open category.
    pub fn mark_terminal(&mut self, status: TurnStatus, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.open_counts.clear();
        self.opened_at.clear();
    }

    /// Undoes a terminal status inferred from a snapshot. History is kept.
    pub fn reopen(&mut self) {
        self.status = TurnStatus::InProgress;
        self.ended_at = None;
        self.closed_by_snapshot = false;
    }

    pub fn timeline(&self, now: DateTime<Utc>) -> Vec<TimelineSegment> {
        timeline::build(
            self.started_at,
            self.ended_at.unwrap_or(now),
            &self.trace_history,
        )
    }
}

/// Immutable copy of a terminated turn plus the endpoint metadata at archival time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRun {
    pub endpoint_id: String,
    pub turn_id: String,
    pub thread_id: Option<String>,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub label: Option<String>,
    pub error_message: Option<String>,
    pub trace_history: Vec<TraceEvent>,
    pub commands: Vec<CommandRecord>,
    pub file_changes: Vec<FileChangeRecord>,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl CompletedRun {
    pub fn from_turn(turn: &Turn, metadata: Option<&EndpointMetadata>, now: DateTime<Utc>) -> Self {
        Self {
            endpoint_id: turn.key.endpoint_id.clone(),
            turn_id: turn.key.turn_id.clone(),
            thread_id: turn.thread_id.clone(),
            status: turn.status,
            started_at: turn.started_at,
            ended_at: turn.ended_at.unwrap_or(now),
            label: turn.display_label().map(str::to_string),
            error_message: turn.error_message.clone(),
            trace_history: turn.trace_history.clone(),
            commands: turn.commands.clone(),
            file_changes: turn.file_changes.clone(),
            model: metadata.and_then(|meta| meta.model.clone()),
            token_usage: metadata.and_then(|meta| meta.token_usage),
        }
    }

    /// Same turn id, and thread ids agree wherever both are known.
    pub fn is_same_run(&self, turn_id: &str, thread_id: Option<&str>) -> bool {
        if self.turn_id != turn_id {
            return false;
        }
        match (self.thread_id.as_deref(), thread_id) {
            (Some(archived), Some(incoming)) => archived == incoming,
            _ => true,
        }
    }

    pub fn timeline(&self) -> Vec<TimelineSegment> {
        timeline::build(self.started_at, self.ended_at, &self.trace_history)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }
}
