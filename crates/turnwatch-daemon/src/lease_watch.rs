use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Watches the deepest existing directory of the lease chain and re-targets
/// itself as directories appear or vanish.
pub struct LeaseDirWatcher {
    watcher: RecommendedWatcher,
    chain: Vec<PathBuf>,
    target: Option<PathBuf>,
}

pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any
            | EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Metadata(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

pub fn first_existing(chain: &[PathBuf]) -> Option<&PathBuf> {
    chain.iter().find(|path| path.is_dir())
}

impl LeaseDirWatcher {
    pub fn new(chain: Vec<PathBuf>, events: mpsc::UnboundedSender<()>) -> notify::Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if is_relevant(&event.kind) {
                    let _ = events.send(());
                }
            }
        })?;
        Ok(Self {
            watcher,
            chain,
            target: None,
        })
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Moves the watch to the first existing directory. Returns whether the target changed.
    pub fn rearm(&mut self) -> bool {
        let next = first_existing(&self.chain).cloned();
        if next == self.target {
            return false;
        }
        if let Some(previous) = self.target.take() {
            // The directory may already be gone, which also drops the watch.
            let _ = self.watcher.unwatch(&previous);
        }
        if let Some(path) = next {
            match self.watcher.watch(&path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(event = "lease_watch_target", path = %path.display());
                    self.target = Some(path);
                }
                Err(err) => {
                    warn!(event = "lease_watch_failed", path = %path.display(), error = %err);
                }
            }
        }
        true
    }
}
