// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console log aggregation
//!
//! One tailer task per owned node follows the multiplexer's per-node log
//! file and forwards every complete line, prefixed with the node name,
//! into the per-worker aggregation file.  Tailers poll rather than rely
//! on filesystem notification, which cannot be assumed to work in every
//! container filesystem, and reopen the file when log rotation replaces
//! it.  Delivery is at-least-once around rotations, never exactly-once.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// How often tailers look for new content.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// The per-worker aggregation file.  Writes serialize on the inner lock;
/// rotation tears the handle down and reopens it under the same lock.
pub struct AggregationLog {
    path: Utf8PathBuf,
    inner: Mutex<Option<std::fs::File>>,
    log: Logger,
}

impl AggregationLog {
    pub fn new(path: &Utf8Path, log: Logger) -> AggregationLog {
        AggregationLog {
            path: path.to_owned(),
            inner: Mutex::new(None),
            log,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// (Re)open the aggregation file.  Called at startup and whenever log
    /// rotation moves the file out from under us.
    pub fn respin(&self) -> std::io::Result<()> {
        let Some(dir) = self.path.parent() else {
            return Err(std::io::Error::other(format!(
                "aggregation file {} has no parent directory",
                self.path
            )));
        };
        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        info!(self.log, "restarted aggregation log"; "path" => %self.path);
        *self.inner.lock().unwrap() = Some(file);
        self.write_line("Starting aggregation log");
        Ok(())
    }

    /// Append one line.  Dropped (with a warning) if the file is not
    /// currently open.
    pub fn write_line(&self, line: &str) {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(file) => {
                if let Err(error) = writeln!(file, "{}", line) {
                    warn!(self.log, "aggregation write failed";
                        "error" => %error);
                }
            }
            None => {
                warn!(self.log, "aggregation log not open, dropping line");
            }
        }
    }
}

struct TailerHandle {
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the tailer task for every node currently being aggregated.
pub struct TailerRegistry {
    console_dir: Utf8PathBuf,
    agg: Arc<AggregationLog>,
    tailers: tokio::sync::Mutex<BTreeMap<String, TailerHandle>>,
    log: Logger,
}

impl TailerRegistry {
    pub fn new(
        console_dir: &Utf8Path,
        agg: Arc<AggregationLog>,
        log: Logger,
    ) -> TailerRegistry {
        TailerRegistry {
            console_dir: console_dir.to_owned(),
            agg,
            tailers: tokio::sync::Mutex::new(BTreeMap::new()),
            log,
        }
    }

    /// Start following a node's console log if not already doing so.
    /// Returns true when a new tailer was started.
    pub async fn ensure_tailing(&self, node: &str) -> bool {
        let mut tailers = self.tailers.lock().await;
        if tailers.contains_key(node) {
            return false;
        }
        let path = self.console_dir.join(format!("console.{}", node));
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(tail_console_log(
            path,
            node.to_string(),
            Arc::clone(&self.agg),
            cancel_rx,
            self.log.new(o!("tail" => node.to_string())),
        ));
        tailers.insert(node.to_string(), TailerHandle { cancel, task });
        true
    }

    /// Stop following a node's console log.  The tailer exits at its next
    /// poll boundary; any line already read still reaches the
    /// aggregation file.
    pub async fn stop_tailing(&self, node: &str) {
        let mut tailers = self.tailers.lock().await;
        match tailers.remove(node) {
            Some(handle) => {
                info!(self.log, "halting tail"; "node" => node);
                let _ = handle.cancel.send(true);
            }
            None => {
                debug!(self.log, "no tailer registered"; "node" => node);
            }
        }
    }

    pub async fn stop_all(&self) {
        let mut tailers = self.tailers.lock().await;
        for (node, handle) in std::mem::take(&mut *tailers) {
            info!(self.log, "halting tail"; "node" => &node);
            let _ = handle.cancel.send(true);
            handle.task.abort();
        }
    }
}

/// Follow one console log file until cancelled.
///
/// Starts at the current end of file, forwards complete lines only, and
/// reopens from the beginning when the file shrinks or is replaced
/// (rotation).  A missing file is simply polled until it appears.
async fn tail_console_log(
    path: Utf8PathBuf,
    node: String,
    agg: Arc<AggregationLog>,
    mut cancel: watch::Receiver<bool>,
    log: Logger,
) {
    debug!(log, "starting to tail"; "path" => %path);

    // start at the current end of the file if it exists
    let (mut position, mut inode) = match std::fs::metadata(&path) {
        Ok(metadata) => (metadata.len(), Some(metadata.ino())),
        Err(_) => (0, None),
    };

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    debug!(log, "tail exiting gracefully");
                    return;
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            // deleted or not yet created: keep waiting for it
            Err(_) => {
                position = 0;
                inode = None;
                continue;
            }
        };
        let length = metadata.len();
        if inode != Some(metadata.ino()) {
            // a different file at the same path: rotation happened
            debug!(log, "log file replaced, reopening"; "path" => %path);
            position = 0;
            inode = Some(metadata.ino());
        } else if length < position {
            // same file truncated back below our offset
            debug!(log, "log file shrank, reopening"; "path" => %path);
            position = 0;
        }
        if length == position {
            continue;
        }

        position = match forward_new_lines(&path, position, &node, &agg) {
            Ok(position) => position,
            Err(error) => {
                warn!(log, "error reading console log";
                    "path" => %path, "error" => %error);
                continue;
            }
        };
    }
}

// Read from `from` to EOF, forwarding complete lines; returns the offset
// of the first unconsumed byte (a trailing partial line stays for the
// next poll).
fn forward_new_lines(
    path: &Utf8Path,
    from: u64,
    node: &str,
    agg: &AggregationLog,
) -> std::io::Result<u64> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let mut consumed = 0usize;
    for line in buffer.split_inclusive(|b| *b == b'\n') {
        if line.last() != Some(&b'\n') {
            break;
        }
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        agg.write_line(&format!("console.hostname: {} {}", node, text));
        consumed += line.len();
    }
    Ok(from + consumed as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf, Arc<AggregationLog>) {
        let dir = tempfile::tempdir().unwrap();
        let root =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let agg = Arc::new(AggregationLog::new(
            &root.join("consoleAgg-test.log"),
            Logger::root(slog::Discard, o!()),
        ));
        agg.respin().unwrap();
        (dir, root, agg)
    }

    #[test]
    fn forwards_only_complete_lines() {
        let (_dir, root, agg) = setup();
        let console = root.join("console.x0n0");
        std::fs::write(&console, "one\ntwo\npartial").unwrap();

        let position = forward_new_lines(&console, 0, "x0n0", &agg).unwrap();
        assert_eq!(position as usize, "one\ntwo\n".len());

        let contents =
            std::fs::read_to_string(agg.path()).unwrap();
        assert!(contents.contains("console.hostname: x0n0 one\n"));
        assert!(contents.contains("console.hostname: x0n0 two\n"));
        assert!(!contents.contains("partial"));

        // completing the partial line picks it up from the saved offset
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&console)
            .unwrap();
        writeln!(file, " line done").unwrap();
        let position =
            forward_new_lines(&console, position, "x0n0", &agg).unwrap();
        let contents = std::fs::read_to_string(agg.path()).unwrap();
        assert!(
            contents.contains("console.hostname: x0n0 partial line done\n")
        );
        assert_eq!(position, std::fs::metadata(&console).unwrap().len());
    }

    #[tokio::test]
    async fn tailer_survives_rotation() {
        let (_dir, root, agg) = setup();
        let console = root.join("console.x0n0");
        std::fs::write(&console, "before tail\n").unwrap();

        let registry = TailerRegistry::new(
            &root,
            Arc::clone(&agg),
            Logger::root(slog::Discard, o!()),
        );
        assert!(registry.ensure_tailing("x0n0").await);
        assert!(!registry.ensure_tailing("x0n0").await);

        // give the tailer a poll to record its starting offset, then
        // rotate: move the file away and write a fresh one
        tokio::time::sleep(Duration::from_millis(1500)).await;
        std::fs::rename(&console, root.join("console.x0n0.1")).unwrap();
        std::fs::write(&console, "after rotation\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let contents = std::fs::read_to_string(agg.path()).unwrap();
            if contents.contains("console.hostname: x0n0 after rotation") {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "rotated content never reached the aggregation log: {:?}",
                contents
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // the pre-tail content was before the starting offset
        let contents = std::fs::read_to_string(agg.path()).unwrap();
        assert!(!contents.contains("before tail"));

        registry.stop_all().await;
    }
}
