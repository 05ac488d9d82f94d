use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use graphex_core::event::Event;
use graphex_core::RunId;

/// JSONL run logger.
///
/// Drains a run's recorder channel (see `RunState::with_recorder`) and
/// appends one JSON object per event to `{log_dir}/{run_id}.jsonl`. The
/// channel never drops events, so the file is a complete record. Lines are
/// flushed as they are written, so a crash leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
}

impl RunLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events until the run finishes and its recorder is dropped.
    pub async fn run(self, run_id: RunId, mut events: mpsc::UnboundedReceiver<Event>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.path_for(&run_id.0);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        while let Some(event) = events.recv().await {
            let Some(line) = to_line(&event) else {
                continue;
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write log entry");
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush log");
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

fn to_line(event: &Event) -> Option<String> {
    serde_json::to_string(event).ok().map(|json| format!("{}\n", json))
}

/// Read back a run log, skipping lines that do not parse.
pub async fn read_log(path: &Path) -> std::io::Result<Vec<Event>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
