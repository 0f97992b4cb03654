//! Reconstructs a gap-free segment timeline from a turn's trace history.
//!
//! `build` is pure and replayed on every read: the same inputs always produce
//! the same segments.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::turn::TraceEvent;
use crate::{non_blank, ProgressCategory, ProgressState};

const CATEGORY_COUNT: usize = ProgressCategory::ALL.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "category")]
pub enum SegmentKind {
    Category(ProgressCategory),
    Idle,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Category(category) => f.write_str(category.as_str()),
            SegmentKind::Idle => f.write_str("idle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSegment {
    pub kind: SegmentKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub label: Option<String>,
}

impl TimelineSegment {
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }
}

#[derive(Default)]
struct SweepState {
    counts: [u32; CATEGORY_COUNT],
    opened_at: [Option<DateTime<Utc>>; CATEGORY_COUNT],
    labels: [Option<String>; CATEGORY_COUNT],
}

impl SweepState {
    fn apply(&mut self, event: &TraceEvent, at: DateTime<Utc>) {
        let slot = event.category.precedence();
        match event.state {
            ProgressState::Started => {
                if self.counts[slot] == 0 {
                    self.opened_at[slot] = Some(at);
                    self.labels[slot] = None;
                }
                self.counts[slot] += 1;
                if let Some(label) = non_blank(event.label.as_deref()) {
                    self.labels[slot] = Some(label.to_string());
                }
            }
            ProgressState::Completed => {
                self.counts[slot] = self.counts[slot].saturating_sub(1);
                if self.counts[slot] == 0 {
                    self.opened_at[slot] = None;
                    self.labels[slot] = None;
                }
            }
        }
    }

    /// Most recently opened category wins; precedence breaks simultaneous opens.
    fn active(&self) -> (SegmentKind, Option<String>) {
        let mut winner: Option<(usize, DateTime<Utc>)> = None;
        for category in ProgressCategory::ALL {
            let slot = category.precedence();
            if self.counts[slot] == 0 {
                continue;
            }
            let Some(opened) = self.opened_at[slot] else {
                continue;
            };
            match winner {
                Some((_, best)) if opened <= best => {}
                _ => winner = Some((slot, opened)),
            }
        }
        match winner {
            Some((slot, _)) => (
                SegmentKind::Category(ProgressCategory::ALL[slot]),
                self.labels[slot].clone(),
            ),
            None => (SegmentKind::Idle, None),
        }
    }
}

fn push_segment(
    segments: &mut Vec<TimelineSegment>,
    kind: SegmentKind,
    label: Option<String>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) {
    if to <= from {
        return;
    }
    if let Some(last) = segments.last_mut() {
        if last.kind == kind && last.label == label && last.ended_at == from {
            last.ended_at = to;
            return;
        }
    }
    segments.push(TimelineSegment {
        kind,
        started_at: from,
        ended_at: to,
        label,
    });
}

/// Converts `history` into non-overlapping segments covering `[started_at, ended_at]`.
///
/// Events outside the window are clamped onto its edges. An empty or inverted
/// window yields no segments.
pub fn build(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    history: &[TraceEvent],
) -> Vec<TimelineSegment> {
    if ended_at <= started_at {
        return Vec::new();
    }

    let mut ordered: Vec<&TraceEvent> = history.iter().collect();
    ordered.sort_by_key(|event| event.at);

    let mut state = SweepState::default();
    let mut segments = Vec::new();
    let mut cursor = started_at;

    for event in ordered {
        let at = event.at.clamp(started_at, ended_at);
        if at > cursor {
            let (kind, label) = state.active();
            push_segment(&mut segments, kind, label, cursor, at);
            cursor = at;
        }
        state.apply(event, at);
    }

    let (kind, label) = state.active();
    push_segment(&mut segments, kind, label, cursor, ended_at);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    fn ev(category: ProgressCategory, state: ProgressState, at: i64) -> TraceEvent {
        TraceEvent {
            category,
            state,
            label: None,
            at: t(at),
        }
    }

    fn shape(segments: &[TimelineSegment]) -> Vec<(String, i64, i64)> {
        segments
            .iter()
            .map(|segment| {
                (
                    segment.kind.to_string(),
                    (segment.started_at - t(0)).num_seconds(),
                    (segment.ended_at - t(0)).num_seconds(),
                )
            })
            .collect()
    }

    #[test]
    fn single_tool_call_is_bracketed_by_idle() {
        let history = vec![
            ev(ProgressCategory::Tool, ProgressState::Started, 1),
            ev(ProgressCategory::Tool, ProgressState::Completed, 3),
        ];
        let segments = build(t(0), t(5), &history);
        assert_eq!(
            shape(&segments),
            vec![
                ("idle".to_string(), 0, 1),
                ("tool".to_string(), 1, 3),
                ("idle".to_string(), 3, 5),
            ]
        );
    }

    #[test]
    fn most_recently_opened_category_wins_overlap() {
        let history = vec![
            ev(ProgressCategory::Edit, ProgressState::Started, 1),
            ev(ProgressCategory::Tool, ProgressState::Started, 2),
            ev(ProgressCategory::Edit, ProgressState::Completed, 4),
            ev(ProgressCategory::Tool, ProgressState::Completed, 5),
        ];
        let segments = build(t(0), t(5), &history);
        assert_eq!(
            shape(&segments),
            vec![
                ("idle".to_string(), 0, 1),
                ("edit".to_string(), 1, 2),
                ("tool".to_string(), 2, 5),
            ]
        );
    }

    #[test]
    fn simultaneous_opens_fall_back_to_precedence() {
        let history = vec![
            ev(ProgressCategory::Gen, ProgressState::Started, 1),
            ev(ProgressCategory::Network, ProgressState::Started, 1),
        ];
        let segments = build(t(0), t(3), &history);
        assert_eq!(
            shape(&segments),
            vec![("idle".to_string(), 0, 1), ("network".to_string(), 1, 3)]
        );
    }

    #[test]
    fn nested_starts_keep_category_open_until_last_completion() {
        let history = vec![
            ev(ProgressCategory::Tool, ProgressState::Started, 1),
            ev(ProgressCategory::Tool, ProgressState::Started, 2),
            ev(ProgressCategory::Tool, ProgressState::Completed, 3),
            ev(ProgressCategory::Tool, ProgressState::Completed, 4),
            ev(ProgressCategory::Tool, ProgressState::Completed, 4),
        ];
        let segments = build(t(0), t(6), &history);
        assert_eq!(
            shape(&segments),
            vec![
                ("idle".to_string(), 0, 1),
                ("tool".to_string(), 1, 4),
                ("idle".to_string(), 4, 6),
            ]
        );
    }

    #[test]
    fn labels_split_segments_of_the_same_category() {
        let mut first = ev(ProgressCategory::Tool, ProgressState::Started, 0);
        first.label = Some("rg TODO".to_string());
        let mut second = ev(ProgressCategory::Tool, ProgressState::Started, 2);
        second.label = Some("cargo test".to_string());
        let segments = build(t(0), t(4), &[first, second]);
        let labels: Vec<_> = segments.iter().map(|s| s.label.clone()).collect();
        assert_eq!(
            labels,
            vec![Some("rg TODO".to_string()), Some("cargo test".to_string())]
        );
        assert_eq!(segments[1].duration(), chrono::Duration::seconds(2));
    }

    #[test]
    fn unordered_and_out_of_window_events_are_sorted_and_clamped() {
        let history = vec![
            ev(ProgressCategory::Reasoning, ProgressState::Completed, 9),
            ev(ProgressCategory::Reasoning, ProgressState::Started, -3),
        ];
        let segments = build(t(0), t(5), &history);
        assert_eq!(shape(&segments), vec![("reasoning".to_string(), 0, 5)]);
    }

    #[test]
    fn empty_window_yields_nothing_and_empty_history_is_idle() {
        assert!(build(t(5), t(5), &[]).is_empty());
        assert!(build(t(5), t(1), &[ev(ProgressCategory::Tool, ProgressState::Started, 2)]).is_empty());
        assert_eq!(shape(&build(t(0), t(2), &[])), vec![("idle".to_string(), 0, 2)]);
    }

    #[test]
    fn output_is_deterministic() {
        let history = vec![
            ev(ProgressCategory::Prefill, ProgressState::Started, 1),
            ev(ProgressCategory::Gen, ProgressState::Started, 2),
            ev(ProgressCategory::Prefill, ProgressState::Completed, 2),
            ev(ProgressCategory::Gen, ProgressState::Completed, 3),
        ];
        let first = serde_json::to_string(&build(t(0), t(4), &history)).expect("json");
        let second = serde_json::to_string(&build(t(0), t(4), &history)).expect("json");
        assert_eq!(first, second);
    }
}
