use clap::Parser;
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use turnwatch_core::AggregatorConfig;

use crate::manager::ManagerConfig;
use crate::scanner::ScannerConfig;

const DEFAULT_FRESHNESS_SECS: i64 = 15;
const DEFAULT_STALE_TTL_SECS: i64 = 30 * 60;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 15;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;
const DEFAULT_EVICTION_GRACE_SECS: i64 = 10;

#[derive(Parser, Debug)]
#[command(name = "turnwatch", about = "Watches local agent runtimes and their turns")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub codex_home: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = DEFAULT_FRESHNESS_SECS)]
    pub freshness_secs: i64,
    #[arg(long, default_value_t = DEFAULT_STALE_TTL_SECS)]
    pub stale_ttl_secs: i64,
    #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL_SECS)]
    pub scan_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
    pub refresh_interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_EVICTION_GRACE_SECS)]
    pub eviction_grace_secs: i64,
    /// Print every row snapshot as a JSON line instead of logging summaries.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot resolve a home directory; pass --codex-home or set CODEX_HOME")]
    NoHomeDir,
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_stdout: bool,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub codex_home: PathBuf,
    pub scanner: ScannerConfig,
    pub manager: ManagerConfig,
    pub log: LogConfig,
    pub json: bool,
}

impl DaemonConfig {
    pub fn lease_dir(&self) -> PathBuf {
        lease_dir(&self.codex_home)
    }

    pub fn watch_chain(&self) -> Vec<PathBuf> {
        watch_chain(&self.codex_home, dirs::home_dir().as_deref())
    }
}

pub fn load_config(args: Args) -> Result<DaemonConfig, ConfigError> {
    let codex_home = resolve_codex_home(&args.codex_home).ok_or(ConfigError::NoHomeDir)?;
    let scanner = ScannerConfig {
        freshness_window: chrono::Duration::seconds(args.freshness_secs.max(1)),
        stale_ttl: chrono::Duration::seconds(args.stale_ttl_secs.max(1)),
    };
    let manager = ManagerConfig {
        scan_interval: Duration::from_secs(args.scan_interval_secs.max(1)),
        refresh_interval: Duration::from_secs(args.refresh_interval_secs.max(1)),
        aggregator: AggregatorConfig {
            eviction_grace: chrono::Duration::seconds(args.eviction_grace_secs.max(0)),
            ..AggregatorConfig::default()
        },
        ..ManagerConfig::default()
    };
    let log_dir = resolve_log_dir(&args.log_dir);
    // Without a log file, diagnostics go to stdout unless stdout carries JSON rows.
    let log_stdout = resolve_log_stdout().unwrap_or(log_dir.is_empty() && !args.json);
    Ok(DaemonConfig {
        codex_home,
        scanner,
        manager,
        log: LogConfig {
            log_dir,
            log_stdout,
        },
        json: args.json,
    })
}

fn resolve_codex_home(flag: &str) -> Option<PathBuf> {
    if !flag.trim().is_empty() {
        return Some(PathBuf::from(flag));
    }
    if let Ok(value) = env::var("CODEX_HOME") {
        if !value.trim().is_empty() {
            return Some(PathBuf::from(value));
        }
    }
    dirs::home_dir().map(|home| home.join(".codex"))
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var("TURNWATCH_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

fn resolve_log_stdout() -> Option<bool> {
    env::var("TURNWATCH_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_env(&value))
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

/// `<codex_home>/runtime/menubar/endpoints`
pub fn lease_dir(codex_home: &Path) -> PathBuf {
    codex_home.join("runtime").join("menubar").join("endpoints")
}

/// Candidate watch targets, deepest first. The first one that exists is watched.
pub fn watch_chain(codex_home: &Path, home: Option<&Path>) -> Vec<PathBuf> {
    let endpoints = lease_dir(codex_home);
    let mut chain = Vec::with_capacity(5);
    chain.push(endpoints.clone());
    let mut current = endpoints.as_path();
    while let Some(parent) = current.parent() {
        chain.push(parent.to_path_buf());
        if parent == codex_home {
            break;
        }
        current = parent;
    }
    if let Some(home) = home {
        if !chain.iter().any(|path| path == home) {
            chain.push(home.to_path_buf());
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_chain_walks_up_to_home() {
        let chain = watch_chain(Path::new("/u/me/.codex"), Some(Path::new("/u/me")));
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/u/me/.codex/runtime/menubar/endpoints"),
                PathBuf::from("/u/me/.codex/runtime/menubar"),
                PathBuf::from("/u/me/.codex/runtime"),
                PathBuf::from("/u/me/.codex"),
                PathBuf::from("/u/me"),
            ]
        );
    }

    #[test]
    fn flag_wins_over_environment_for_codex_home() {
        let args = Args::parse_from(["turnwatch", "--codex-home", "/srv/codex", "--scan-interval-secs", "0"]);
        let config = load_config(args).expect("config");
        assert_eq!(config.codex_home, PathBuf::from("/srv/codex"));
        assert_eq!(config.lease_dir(), PathBuf::from("/srv/codex/runtime/menubar/endpoints"));
        assert_eq!(config.manager.scan_interval, Duration::from_secs(1));
        assert_eq!(config.scanner.freshness_window, chrono::Duration::seconds(15));
        assert_eq!(config.scanner.stale_ttl, chrono::Duration::seconds(1800));
    }

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool_env(" yes "), Some(true));
        assert_eq!(parse_bool_env("0"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }
}
