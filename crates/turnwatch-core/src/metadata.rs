use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::non_blank;

pub const CHAT_TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdown {
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u64,
    #[serde(default, alias = "input_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "cached_input_tokens")]
    pub cached_input_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub output_tokens: u64,
    #[serde(default, alias = "reasoning_output_tokens")]
    pub reasoning_output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub total: TokenBreakdown,
    #[serde(default)]
    pub last: TokenBreakdown,
    #[serde(default, alias = "model_context_window")]
    pub model_context_window: Option<u64>,
}

impl TokenUsage {
    /// Share of the context window consumed by the last request, when the window is known.
    pub fn context_used_percent(&self) -> Option<f64> {
        let window = self.model_context_window.filter(|window| *window > 0)?;
        Some(self.last.total_tokens as f64 * 100.0 / window as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    #[serde(default, alias = "used_percent")]
    pub used_percent: f64,
    #[serde(default, alias = "window_duration_mins", alias = "window_minutes")]
    pub window_duration_mins: Option<i64>,
    #[serde(default, alias = "resets_at")]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    #[serde(default)]
    pub primary: Option<RateLimitWindow>,
    #[serde(default)]
    pub secondary: Option<RateLimitWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default, alias = "origin_url")]
    pub origin_url: Option<String>,
}

impl GitInfo {
    pub fn is_empty(&self) -> bool {
        self.branch.is_none() && self.sha.is_none() && self.origin_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointError {
    pub message: String,
    pub will_retry: bool,
    pub at: DateTime<Utc>,
}

/// Per-endpoint side table. Every field is updated independently.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMetadata {
    pub chat_title: Option<String>,
    pub thread_id: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub last_error: Option<EndpointError>,
    pub rate_limits: Option<RateLimits>,
    pub git_info: Option<GitInfo>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EndpointMetadata {
    /// Applies a thread description. Blank values leave existing fields untouched.
    pub fn merge_thread(
        &mut self,
        thread_id: Option<&str>,
        name: Option<&str>,
        preview: Option<&str>,
        cwd: Option<&str>,
        git_info: Option<&GitInfo>,
        now: DateTime<Utc>,
    ) {
        if let Some(thread_id) = non_blank(thread_id) {
            self.thread_id = Some(thread_id.to_string());
        }
        if let Some(title) = chat_title(name, preview) {
            self.chat_title = Some(title);
        }
        if let Some(cwd) = non_blank(cwd) {
            self.cwd = Some(cwd.to_string());
        }
        if let Some(git_info) = git_info.filter(|info| !info.is_empty()) {
            self.git_info = Some(git_info.clone());
        }
        self.updated_at = Some(now);
    }

    pub fn set_model(&mut self, model: Option<&str>, now: DateTime<Utc>) {
        if let Some(model) = non_blank(model) {
            self.model = Some(model.to_string());
            self.updated_at = Some(now);
        }
    }

    pub fn set_token_usage(&mut self, usage: TokenUsage, now: DateTime<Utc>) {
        self.token_usage = Some(usage);
        self.updated_at = Some(now);
    }

    pub fn set_error(&mut self, message: &str, will_retry: bool, now: DateTime<Utc>) {
        self.last_error = Some(EndpointError {
            message: message.to_string(),
            will_retry,
            at: now,
        });
        self.updated_at = Some(now);
    }

    pub fn set_rate_limits(&mut self, limits: RateLimits, now: DateTime<Utc>) {
        self.rate_limits = Some(limits);
        self.updated_at = Some(now);
    }
}

/// Thread name wins; otherwise the first line of the preview, capped.
pub fn chat_title(name: Option<&str>, preview: Option<&str>) -> Option<String> {
    if let Some(name) = non_blank(name) {
        return Some(name.to_string());
    }
    let first_line = non_blank(preview)?.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }
    if first_line.chars().count() <= CHAT_TITLE_MAX_CHARS {
        return Some(first_line.to_string());
    }
    let mut truncated: String = first_line.chars().take(CHAT_TITLE_MAX_CHARS - 1).collect();
    truncated.push('…');
    Some(truncated)
}
