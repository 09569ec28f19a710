use std::{io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Handle to the background log writer. Hold it for the life of the
/// process; buffered lines are flushed when it drops.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Where log lines go. Anything that is not a known stream name is taken
/// as a file path.
enum Output {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl Output {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "stderr" => Output::Stderr,
            "stdout" => Output::Stdout,
            path => Output::File(PathBuf::from(path)),
        }
    }

    fn writer(self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        match self {
            Output::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
            Output::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
            Output::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("create log directory {}", dir.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("open log file {}", path.display()))?;
                Ok(tracing_appender::non_blocking(file))
            }
        }
    }
}

/// Installs the global tracing subscriber from the `logging` config
/// section. `logging.level` accepts any filter directive string, not just
/// a bare level, so per-target overrides work from the config file too.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LogGuard> {
    // RUST_LOG wins over the config file when both are set.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = cfg.level.trim();
            let level = if level.is_empty() { "info" } else { level };
            EnvFilter::try_new(level)
                .with_context(|| format!("bad logging.level {level:?}"))?
        }
    };

    let (writer, worker) = Output::parse(&cfg.output).writer()?;

    let json = cfg.format.trim().eq_ignore_ascii_case("json");
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let layer = if json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry().with(filter).with(layer).init();

    Ok(LogGuard { _worker: worker })
}
