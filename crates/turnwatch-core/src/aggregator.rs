//! In-memory turn state machine keyed by `(endpoint, turn)`.
//!
//! Every mutation is idempotent with respect to duplicated or reordered
//! notifications. Readers only ever receive [`EndpointRow`] copies.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::metadata::EndpointMetadata;
use crate::notification::Notification;
use crate::row::EndpointRow;
use crate::turn::{CompletedRun, Turn, TurnKey};
use crate::{non_blank, snapshot_turn_key, ProgressCategory, ProgressState, TurnStatus};

pub const DEFAULT_ARCHIVE_CAP: usize = 50;
pub const DEFAULT_EVICTION_GRACE_SECS: i64 = 10;
pub const DEFAULT_RETIRED_ENDPOINT_CAP: usize = 16;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub archive_cap: usize,
    pub eviction_grace: chrono::Duration,
    /// How many endpoints whose lease went away keep their archive and metadata.
    pub retired_endpoint_cap: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            archive_cap: DEFAULT_ARCHIVE_CAP,
            eviction_grace: chrono::Duration::seconds(DEFAULT_EVICTION_GRACE_SECS),
            retired_endpoint_cap: DEFAULT_RETIRED_ENDPOINT_CAP,
        }
    }
}

#[derive(Debug, Default)]
pub struct TurnAggregator {
    config: AggregatorConfig,
    turns: BTreeMap<TurnKey, Turn>,
    archives: HashMap<String, Vec<CompletedRun>>,
    metadata: HashMap<String, EndpointMetadata>,
    endpoints: BTreeSet<String>,
    retired: VecDeque<String>,
    revision: u64,
}

impl TurnAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Bumped on every state change; consumers compare it to skip republishing.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn turn(&self, endpoint_id: &str, turn_id: &str) -> Option<&Turn> {
        self.turns.get(&TurnKey::new(endpoint_id, turn_id))
    }

    pub fn archive(&self, endpoint_id: &str) -> &[CompletedRun] {
        self.archives
            .get(endpoint_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn metadata(&self, endpoint_id: &str) -> Option<&EndpointMetadata> {
        self.metadata.get(endpoint_id)
    }

    pub fn has_live_turns(&self) -> bool {
        self.turns.values().any(|turn| !turn.is_terminal())
    }

    pub fn track_endpoint(&mut self, endpoint_id: &str) {
        self.retired.retain(|retired| retired != endpoint_id);
        if self.endpoints.insert(endpoint_id.to_string()) {
            self.touch();
        }
    }

    /// Handles an endpoint whose lease went away.
    ///
    /// Turns still in progress are archived as interrupted and every live turn is
    /// dropped. The archive and metadata stay visible until more than
    /// `retired_endpoint_cap` endpoints have been retired after this one; an
    /// endpoint with nothing archived is dropped right away. Returns how many
    /// turns were interrupted.
    pub fn retire_endpoint(&mut self, endpoint_id: &str, now: DateTime<Utc>) -> usize {
        let keys: Vec<TurnKey> = self
            .turns
            .keys()
            .filter(|key| key.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        let mut interrupted = 0;
        for key in &keys {
            if let Some(turn) = self.turns.get_mut(key) {
                if !turn.is_terminal() {
                    turn.mark_terminal(TurnStatus::Interrupted, now);
                    interrupted += 1;
                }
            }
            self.archive_completed_turn_if_needed(key, now);
            self.turns.remove(key);
        }

        let removed_endpoint = self.endpoints.remove(endpoint_id);
        if self.archive(endpoint_id).is_empty() {
            self.archives.remove(endpoint_id);
            self.metadata.remove(endpoint_id);
        } else {
            self.retired.retain(|retired| retired != endpoint_id);
            self.retired.push_back(endpoint_id.to_string());
            while self.retired.len() > self.config.retired_endpoint_cap {
                if let Some(oldest) = self.retired.pop_front() {
                    self.archives.remove(&oldest);
                    self.metadata.remove(&oldest);
                }
            }
        }
        if removed_endpoint || !keys.is_empty() {
            self.touch();
        }
        interrupted
    }

    pub fn upsert_turn_started(
        &mut self,
        endpoint_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        from_snapshot: bool,
        now: DateTime<Utc>,
    ) {
        let key = TurnKey::new(endpoint_id, turn_id);
        match self.turns.get_mut(&key) {
            None => {
                self.turns.insert(key.clone(), Turn::new(key, thread_id, now));
            }
            Some(turn) if from_snapshot => {
                // Snapshots only confirm a turn; they never rewind one that moved on,
                // except to undo a completion an earlier snapshot inferred.
                turn.set_thread_id(thread_id);
                if turn.is_terminal() && turn.closed_by_snapshot {
                    turn.reopen();
                    self.drop_archived_run(&key);
                }
            }
            Some(turn) if turn.is_terminal() => {
                let thread_id = non_blank(thread_id).or(turn.thread_id.as_deref());
                let fresh = Turn::new(key, thread_id, now);
                *turn = fresh;
            }
            Some(turn) => {
                turn.status = TurnStatus::InProgress;
                turn.ended_at = None;
                turn.last_activity_at = now;
                turn.set_thread_id(thread_id);
            }
        }
        self.touch();
    }

    fn drop_archived_run(&mut self, key: &TurnKey) {
        let thread_id = self.turns.get(key).and_then(|turn| turn.thread_id.clone());
        if let Some(runs) = self.archives.get_mut(&key.endpoint_id) {
            runs.retain(|run| !run.is_same_run(&key.turn_id, thread_id.as_deref()));
        }
    }

    /// Terminates a turn, synthesizing it first when the completion beat the start.
    pub fn mark_turn_completed(
        &mut self,
        endpoint_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        status: TurnStatus,
        now: DateTime<Utc>,
    ) {
        self.complete_turn(endpoint_id, turn_id, thread_id, status, false, now);
    }

    fn complete_turn(
        &mut self,
        endpoint_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        status: TurnStatus,
        from_snapshot: bool,
        now: DateTime<Utc>,
    ) {
        let key = TurnKey::new(endpoint_id, turn_id);
        let turn = self
            .turns
            .entry(key.clone())
            .or_insert_with(|| Turn::new(key.clone(), thread_id, now));
        turn.set_thread_id(thread_id);
        // A reported completion replaces one inferred from a snapshot.
        let supersedes = !from_snapshot && turn.is_terminal() && turn.closed_by_snapshot;
        if !turn.is_terminal() || supersedes {
            turn.mark_terminal(status, now);
            turn.closed_by_snapshot = from_snapshot;
        }
        if supersedes {
            self.drop_archived_run(&key);
        }
        self.archive_completed_turn_if_needed(&key, now);
        self.touch();
    }

    /// Like [`Self::mark_turn_completed`] but never creates a turn. Returns whether one existed.
    pub fn mark_turn_completed_if_present(
        &mut self,
        endpoint_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        status: TurnStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if self.turn(endpoint_id, turn_id).is_none() {
            return false;
        }
        self.mark_turn_completed(endpoint_id, turn_id, thread_id, status, now);
        true
    }

    pub fn record_progress(
        &mut self,
        endpoint_id: &str,
        turn_id: &str,
        thread_id: Option<&str>,
        category: ProgressCategory,
        state: ProgressState,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let key = TurnKey::new(endpoint_id, turn_id);
        let turn = self
            .turns
            .entry(key.clone())
            .or_insert_with(|| Turn::new(key, thread_id, now));
        if turn.is_terminal() {
            return;
        }
        turn.set_thread_id(thread_id);
        turn.record_progress(category, state, label, now);
        turn.last_activity_at = now;
        self.touch();
    }

    pub fn active_categories(&self, endpoint_id: &str, turn_id: &str) -> Vec<ProgressCategory> {
        self.turn(endpoint_id, turn_id)
            .map(Turn::active_categories)
            .unwrap_or_default()
    }

    /// Completes every in-progress turn on `endpoint_id` missing from `active_keys`.
    /// Returns how many turns were healed.
    ///
    /// `requested_at` is when the snapshot was asked for. Turns with live activity
    /// at or after it are newer than the snapshot and left alone.
    pub fn reconcile_snapshot_active_turns(
        &mut self,
        endpoint_id: &str,
        active_keys: &[String],
        requested_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> usize {
        let active: HashSet<&str> = active_keys.iter().map(String::as_str).collect();
        let stale: Vec<(String, Option<String>)> = self
            .turns
            .iter()
            .filter(|(key, turn)| key.endpoint_id == endpoint_id && !turn.is_terminal())
            .filter(|(_, turn)| requested_at.map_or(true, |at| turn.last_activity_at < at))
            .filter(|(key, turn)| match non_blank(turn.thread_id.as_deref()) {
                Some(thread_id) => {
                    !active.contains(snapshot_turn_key(thread_id, &key.turn_id).as_str())
                }
                None => {
                    let suffix = format!(":{}", key.turn_id);
                    !active.iter().any(|candidate| candidate.ends_with(&suffix))
                }
            })
            .map(|(key, turn)| (key.turn_id.clone(), turn.thread_id.clone()))
            .collect();

        for (turn_id, thread_id) in &stale {
            self.complete_turn(
                endpoint_id,
                turn_id,
                thread_id.as_deref(),
                TurnStatus::Completed,
                true,
                now,
            );
        }
        stale.len()
    }

    /// Archives a terminal turn once. Newest first, truncated to the cap.
    pub fn archive_completed_turn_if_needed(&mut self, key: &TurnKey, now: DateTime<Utc>) -> bool {
        let Some(turn) = self.turns.get(key) else {
            return false;
        };
        if !turn.is_terminal() {
            return false;
        }
        let archive = self.archives.entry(key.endpoint_id.clone()).or_default();
        if archive
            .iter()
            .any(|run| run.is_same_run(&key.turn_id, turn.thread_id.as_deref()))
        {
            return false;
        }
        let run = CompletedRun::from_turn(turn, self.metadata.get(&key.endpoint_id), now);
        archive.insert(0, run);
        archive.truncate(self.config.archive_cap);
        true
    }

    /// Removes terminal turns whose grace window has elapsed. They stay in the archive.
    pub fn evict_expired_turns(&mut self, now: DateTime<Utc>) -> usize {
        let grace = self.config.eviction_grace;
        let expired: Vec<TurnKey> = self
            .turns
            .iter()
            .filter(|(_, turn)| match (turn.is_terminal(), turn.ended_at) {
                (true, Some(ended_at)) => ended_at + grace <= now,
                _ => false,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.archive_completed_turn_if_needed(key, now);
            self.turns.remove(key);
        }
        if !expired.is_empty() {
            self.touch();
        }
        expired.len()
    }

    fn existing_live_turn(&mut self, endpoint_id: &str, turn_id: &str) -> Option<&mut Turn> {
        self.turns
            .get_mut(&TurnKey::new(endpoint_id, turn_id))
            .filter(|turn| !turn.is_terminal())
    }

    fn metadata_mut(&mut self, endpoint_id: &str) -> &mut EndpointMetadata {
        self.metadata.entry(endpoint_id.to_string()).or_default()
    }

    /// Applies one decoded notification. Returns false when it was dropped.
    pub fn apply_notification(
        &mut self,
        endpoint_id: &str,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> bool {
        match notification {
            Notification::TurnStarted(params) => {
                let Some(turn_id) = params.turn_id() else {
                    return false;
                };
                self.upsert_turn_started(
                    endpoint_id,
                    turn_id,
                    params.thread_id(),
                    params.from_snapshot,
                    now,
                );
                let metadata = self.metadata_mut(endpoint_id);
                metadata.set_model(params.model(), now);
                if !params.from_snapshot || metadata.thread_id.is_none() {
                    metadata.merge_thread(params.thread_id(), None, None, None, None, now);
                }
            }
            Notification::TurnCompleted(params) => {
                let Some(turn_id) = params.turn_id() else {
                    return false;
                };
                self.mark_turn_completed(
                    endpoint_id,
                    turn_id,
                    params.thread_id(),
                    params.completion_status(),
                    now,
                );
                if let Some(message) = params.error_message() {
                    self.set_turn_error(endpoint_id, turn_id, message);
                }
            }
            Notification::ProgressTrace(params) => {
                let (Some(category), Some(state)) = (params.category(), params.state()) else {
                    return false;
                };
                let Some(turn_id) = non_blank(Some(params.turn_id.as_str())) else {
                    return false;
                };
                self.record_progress(
                    endpoint_id,
                    turn_id,
                    params.thread_id.as_deref(),
                    category,
                    state,
                    params.label.as_deref(),
                    now,
                );
            }
            Notification::PlanUpdated(params) => {
                let Some(turn) = self.existing_live_turn(endpoint_id, &params.turn_id) else {
                    return false;
                };
                turn.set_thread_id(params.thread_id.as_deref());
                turn.apply_plan(&params.plan);
                turn.last_activity_at = now;
            }
            Notification::ThreadStarted(params) | Notification::ThreadSnapshot(params) => {
                let thread = &params.thread;
                self.metadata_mut(endpoint_id).merge_thread(
                    thread.id.as_deref(),
                    thread.name.as_deref(),
                    thread.preview.as_deref(),
                    thread.cwd.as_deref(),
                    thread.git_info.as_ref(),
                    now,
                );
            }
            Notification::TokenUsageUpdated(params) => {
                self.metadata_mut(endpoint_id)
                    .set_token_usage(params.token_usage, now);
            }
            Notification::ItemStarted(params) => {
                let Some(turn) = self.existing_live_turn(endpoint_id, &params.turn_id) else {
                    return false;
                };
                turn.set_thread_id(params.thread_id.as_deref());
                turn.record_item_started(&params.item);
                turn.last_activity_at = now;
            }
            Notification::ItemCompleted(params) => {
                let Some(turn) = self.existing_live_turn(endpoint_id, &params.turn_id) else {
                    return false;
                };
                turn.set_thread_id(params.thread_id.as_deref());
                turn.record_item_completed(&params.item, now);
                turn.last_activity_at = now;
            }
            Notification::Error(params) => {
                let message = params.message().to_string();
                self.metadata_mut(endpoint_id)
                    .set_error(&message, params.will_retry, now);
                if !params.will_retry {
                    if let Some(turn_id) = non_blank(params.turn_id.as_deref()) {
                        if self.mark_turn_completed_if_present(
                            endpoint_id,
                            turn_id,
                            params.thread_id.as_deref(),
                            TurnStatus::Failed,
                            now,
                        ) {
                            self.set_turn_error(endpoint_id, turn_id, &message);
                        }
                    }
                }
            }
            Notification::RateLimitsUpdated(params) => {
                self.metadata_mut(endpoint_id)
                    .set_rate_limits(params.rate_limits.clone(), now);
            }
            Notification::SnapshotSummary(params) => {
                self.reconcile_snapshot_active_turns(
                    endpoint_id,
                    &params.active_turn_keys,
                    params.requested_at,
                    now,
                );
            }
        }
        self.touch();
        true
    }

    fn set_turn_error(&mut self, endpoint_id: &str, turn_id: &str, message: &str) {
        let key = TurnKey::new(endpoint_id, turn_id);
        if let Some(turn) = self.turns.get_mut(&key) {
            if turn.error_message.is_none() {
                turn.error_message = Some(message.to_string());
            }
        }
        if let Some(run) = self
            .archives
            .get_mut(endpoint_id)
            .and_then(|runs| runs.iter_mut().find(|run| run.turn_id == turn_id))
        {
            if run.error_message.is_none() {
                run.error_message = Some(message.to_string());
            }
        }
    }

    /// One row per known endpoint, sorted by id.
    pub fn endpoint_rows(&self, now: DateTime<Utc>) -> Vec<EndpointRow> {
        let mut ids: BTreeSet<&str> = self.endpoints.iter().map(String::as_str).collect();
        ids.extend(self.turns.keys().map(|key| key.endpoint_id.as_str()));
        ids.extend(self.archives.keys().map(String::as_str));
        ids.extend(self.metadata.keys().map(String::as_str));

        ids.into_iter()
            .map(|endpoint_id| {
                let turns: Vec<&Turn> = self
                    .turns
                    .iter()
                    .filter(|(key, _)| key.endpoint_id == endpoint_id)
                    .map(|(_, turn)| turn)
                    .collect();
                EndpointRow::build(
                    endpoint_id,
                    self.metadata.get(endpoint_id),
                    &turns,
                    self.archive(endpoint_id),
                    now,
                )
            })
            .collect()
    }
}
