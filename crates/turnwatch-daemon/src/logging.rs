//! Where daemon diagnostics go: a per-process log file, stdout, or both.

use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::MakeWriter, EnvFilter};

use crate::config::LogConfig;

/// Cheap to clone; every clone appends to the same file.
#[derive(Clone, Debug, Default)]
pub struct LogTargets {
    stdout: bool,
    stderr: bool,
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl LogTargets {
    /// Opens `turnwatch-<pid>.log` under the configured directory. If that fails
    /// and stdout is off, output goes to stderr and the error is handed back.
    pub fn open(config: &LogConfig) -> (Self, Option<io::Error>) {
        let mut targets = Self {
            stdout: config.log_stdout,
            ..Self::default()
        };
        let dir = config.log_dir.trim();
        if dir.is_empty() {
            return (targets, None);
        }
        match open_log_file(Path::new(dir)) {
            Ok((path, file)) => {
                targets.file = Some(Arc::new(Mutex::new(file)));
                targets.path = Some(path);
                (targets, None)
            }
            Err(err) => {
                targets.stderr = !targets.stdout;
                (targets, Some(err))
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn open_log_file(dir: &Path) -> io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("turnwatch-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

impl Write for LogTargets {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout {
            let _ = io::stdout().write_all(buf);
        }
        if self.stderr {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogTargets {
    type Writer = LogTargets;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `TURNWATCH_LOG_LEVEL`.
pub fn init_logging(config: &LogConfig) -> LogTargets {
    let level = env::var("TURNWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (targets, open_error) = LogTargets::open(config);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(targets.path().is_none())
        .with_writer(targets.clone())
        .try_init()
        .is_ok();
    if let (true, Some(err)) = (installed, open_error) {
        tracing::warn!(event = "log_file_error", log_dir = %config.log_dir, error = %err);
    }
    targets
}
