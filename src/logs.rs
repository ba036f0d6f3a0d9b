//! Per-deployment build logs
//!
//! A deployment writes to an append-only file through [`LogSink`]. Any
//! number of readers follow the same file with [`tail`], which behaves like
//! `tail -f`: lines written before and after the subscription are delivered
//! in file order, and the stream ends once the owning deployment is finished
//! and the file has been drained.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a tailer sleeps at end of file before reading again
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Append-only writer for one deployment's log file
#[derive(Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogSink {
    /// Open (create or append) the log file, creating parent directories
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; a newline is added
    ///
    /// Write failures are logged and swallowed: losing a log line must not
    /// fail the deployment that produced it.
    pub async fn line(&self, text: impl AsRef<str>) {
        let mut buf = text.as_ref().trim_end_matches(['\r', '\n']).to_string();
        buf.push('\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(buf.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write log line");
            return;
        }
        if let Err(e) = file.flush().await {
            warn!(path = %self.path.display(), error = %e, "Failed to flush log file");
        }
    }

    /// Flush and sync the file to disk
    pub async fn close(&self) {
        let mut file = self.file.lock().await;
        if let Err(e) = file.sync_all().await {
            debug!(path = %self.path.display(), error = %e, "Failed to sync log file");
        }
    }
}

/// Read a completed log in one go
pub async fn read_all(path: impl AsRef<Path>) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\n').trim_end_matches('\r');
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Follow a log file, yielding each non-empty line
///
/// A missing file is waited for rather than reported. At end of file the
/// reader sleeps [`TAIL_POLL_INTERVAL`] and retries. `finished` is consulted
/// at end of file; once it returns true the file is drained one last time and
/// the channel closes. Cancelling `cancel` closes the channel immediately.
pub fn tail<F>(path: PathBuf, cancel: CancellationToken, finished: F) -> mpsc::Receiver<String>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    tail_with_interval(path, cancel, finished, TAIL_POLL_INTERVAL)
}

pub fn tail_with_interval<F>(
    path: PathBuf,
    cancel: CancellationToken,
    finished: F,
    interval: Duration,
) -> mpsc::Receiver<String>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(256);
    let finished = Arc::new(finished);

    tokio::spawn(async move {
        let file = loop {
            match File::open(&path).await {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if is_finished(&finished).await {
                        debug!(path = %path.display(), "Log never created for finished deployment");
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open log for tailing");
                    return;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        };

        let mut reader = BufReader::new(file);
        let mut pending: Vec<u8> = Vec::new();
        let mut draining = false;

        loop {
            match reader.read_until(b'\n', &mut pending).await {
                Ok(0) => {
                    if draining {
                        // The writer is done; a trailing unterminated line is still a line
                        if let Some(line) = clean_line(&pending) {
                            let _ = tx.send(line).await;
                        }
                        return;
                    }
                    if is_finished(&finished).await {
                        draining = true;
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Ok(_) => {
                    if pending.last() != Some(&b'\n') {
                        // Partial line; wait for the rest
                        continue;
                    }
                    let line = clean_line(&pending);
                    pending.clear();
                    if let Some(line) = line {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(line) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Error while tailing log");
                    return;
                }
            }
        }
    });

    rx
}

/// `finished` usually reads the store, so it runs on the blocking pool
async fn is_finished<F>(finished: &Arc<F>) -> bool
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let finished = Arc::clone(finished);
    tokio::task::spawn_blocking(move || (*finished)())
        .await
        .unwrap_or(true)
}
