use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging bootstrap for a process hosting one or more orchestrators.
/// With `dir` set the output goes to a rolling file, otherwise to
/// stdout.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub dir: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// "minutely", "hourly" or "daily" (the default).
    pub rotation: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_prefix() -> String {
    "cyclert".to_string()
}

fn default_max_files() -> usize {
    3
}

impl LoggerConfig {
    /// Reads `CYCLERT_LOG_LEVEL`, `CYCLERT_LOG_DIR`,
    /// `CYCLERT_LOG_PREFIX` and `CYCLERT_LOG_ROTATION`, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("CYCLERT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dir: std::env::var("CYCLERT_LOG_DIR").ok(),
            prefix: std::env::var("CYCLERT_LOG_PREFIX").unwrap_or_else(|_| default_prefix()),
            rotation: std::env::var("CYCLERT_LOG_ROTATION").ok(),
            max_files: default_max_files(),
        }
    }

    /// Install the global subscriber. Returns the appender guard when
    /// logging to a file; the guard must stay alive for the logs to be
    /// flushed. A no-op if a subscriber is already installed.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rotation.as_deref() {
            Some("minutely") => Rotation::MINUTELY,
            Some("hourly") => Rotation::HOURLY,
            _ => Rotation::DAILY,
        };
        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation.clone())
            .max_log_files(self.max_files)
            .filename_prefix(self.prefix.as_str())
            .build(dir)
            .with_context(|| format!("failed to open log dir {dir}"))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();
        tracing::info!("logging to {dir}/{}*, rotation {rotation:?}", self.prefix);
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            prefix: default_prefix(),
            rotation: None,
            max_files: default_max_files(),
        }
    }
}
