//! Per-run operator log.
//!
//! Every line is mirrored to `tracing` and kept in memory so the whole run
//! can be uploaded to the target's log sink when it ends.

use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::remote::RemoteApi;

#[derive(Debug, Default)]
pub struct RunLog {
    lines: Mutex<Vec<String>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "strata::run", "{message}");
        self.push("INFO", message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!(target: "strata::run", "{message}");
        self.push("WARN", message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(target: "strata::run", "{message}");
        self.push("ERROR", message);
    }

    fn push(&self, level: &str, message: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        for line in message.lines() {
            lines.push(format!("[{stamp}] {level:<5} {line}"));
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn render(&self) -> String {
        let mut out = self.lines().join("\n");
        out.push('\n');
        out
    }

    /// Upload the log to `path`. Failures are logged and swallowed.
    pub async fn persist(&self, remote: &dyn RemoteApi, path: &str) -> bool {
        match remote.upload_file(path, self.render().into_bytes()).await {
            Ok(()) => {
                debug!(path, "run log uploaded");
                true
            }
            Err(err) => {
                warn!(path, error = %err, "failed to upload run log");
                false
            }
        }
    }
}
