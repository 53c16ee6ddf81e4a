use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentflow_core::event::{EventBus, RunEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{flow_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier entry intact.
pub struct RunLogger {
    log_dir: PathBuf,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a RunEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_path(&self, flow_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", sanitize(flow_id)))
    }

    /// Run the logger as a background task.
    ///
    /// Subscribes when called, so events published after this returns are
    /// captured even if the task has not been polled yet. Writes every event
    /// until cancellation or until `stop_after_runs` runs have finished.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        flow_id: String,
        stop_after_runs: Option<usize>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send + 'static {
        let rx = event_bus.subscribe();
        self.write_events(rx, flow_id, stop_after_runs, cancel)
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        flow_id: String,
        stop_after_runs: Option<usize>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&flow_id);
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
        let mut finished_runs = 0usize;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Err(e) = write_entry(&mut writer, &event).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if matches!(event, RunEvent::RunFinished { .. }) {
                                finished_runs += 1;
                                if stop_after_runs.is_some_and(|n| finished_runs >= n) {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, path = %log_path.display(), "RunLogger lagged, log is missing events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

async fn write_entry<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    event: &RunEvent,
) -> std::io::Result<()> {
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        event,
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Keep flow ids usable as file names.
fn sanitize(flow_id: &str) -> String {
    let cleaned: String = flow_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "flow".to_string()
    } else {
        cleaned
    }
}

/// Read back the entries of a JSONL log.
pub fn read_log(path: &Path) -> std::io::Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(std::io::Error::from))
        .collect()
}
