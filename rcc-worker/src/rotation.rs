// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Log rotation
//!
//! Every period the worker regenerates a logrotate configuration listing
//! the aggregation log and every currently-owned per-node console log,
//! runs the external `logrotate` tool against a persistent state file,
//! and parses the state file afterwards.  A changed timestamp means a
//! rotation happened: the multiplexer gets SIGHUP to reopen per-node
//! logs, and the aggregation logger is torn down and reopened.

use camino::Utf8Path;
use futures::FutureExt;
use futures::future::BoxFuture;
use rcc_common::background::BackgroundTask;
use rcc_common::env::int_from_env;
use rcc_common::env::is_truthy;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::context::WorkerContext;

/// Pause after a detected rotation before signalling, letting the
/// filesystem settle.
const POST_ROTATE_PAUSE: Duration = Duration::from_secs(5);

/// Log rotation knobs, from the environment.
#[derive(Clone, Debug)]
pub struct RotationSettings {
    pub enabled: bool,
    pub period_secs: u64,
    /// per-node console log size threshold, logrotate syntax
    pub console_size: String,
    pub console_keep: u64,
    /// aggregation log size threshold
    pub agg_size: String,
    pub agg_keep: u64,
}

impl RotationSettings {
    pub fn from_env(log: &Logger) -> RotationSettings {
        let enabled = std::env::var("LOG_ROTATE_ENABLE")
            .map(|v| is_truthy(&v))
            .unwrap_or(true);
        let console_size = std::env::var("LOG_ROTATE_FILE_SIZE")
            .unwrap_or_else(|_| "5M".to_string());
        RotationSettings {
            enabled,
            period_secs: int_from_env(
                log,
                "LOG_ROTATE_SEC_FREQ",
                600,
                60,
                86400,
            ),
            console_size,
            console_keep: int_from_env(log, "LOG_ROTATE_NUM_KEEP", 2, 1, 100),
            agg_size: "20M".to_string(),
            agg_keep: 1,
        }
    }
}

/// Render the logrotate configuration for the current set of logs.
///
/// The multiplexer needs SIGHUP after rotation, but we send it ourselves
/// after parsing the state file, so the entries carry no postrotate
/// script.
pub fn render_logrotate_conf(
    settings: &RotationSettings,
    agg_file: &Utf8Path,
    console_dir: &Utf8Path,
    backup_dir: &Utf8Path,
    node_names: &[String],
) -> String {
    let mut out =
        String::from("# Auto-generated console log rotation configuration.\n");

    if let Some(agg_dir) = agg_file.parent() {
        write_entry(
            &mut out,
            agg_file.as_str(),
            agg_dir.as_str(),
            settings.agg_keep,
            &settings.agg_size,
        );
    }

    for node in node_names {
        let path = console_dir.join(format!("console.{}", node));
        write_entry(
            &mut out,
            path.as_str(),
            backup_dir.as_str(),
            settings.console_keep,
            &settings.console_size,
        );
    }

    out
}

fn write_entry(
    out: &mut String,
    file: &str,
    old_dir: &str,
    keep: u64,
    size: &str,
) {
    writeln!(out, "{} {{", file).unwrap();
    writeln!(out, "  nocompress").unwrap();
    writeln!(out, "  missingok").unwrap();
    writeln!(out, "  nocopytruncate").unwrap();
    writeln!(out, "  nocreate").unwrap();
    writeln!(out, "  nodelaycompress").unwrap();
    writeln!(out, "  nomail").unwrap();
    writeln!(out, "  notifempty").unwrap();
    writeln!(out, "  olddir {}", old_dir).unwrap();
    writeln!(out, "  rotate {}", keep).unwrap();
    writeln!(out, "  size={}", size).unwrap();
    writeln!(out, "}}").unwrap();
}

/// Rotation timestamps per log file, parsed from the logrotate state
/// file.  The stamp is kept as the raw string; only change matters.
pub fn parse_state_file(contents: &str) -> BTreeMap<String, String> {
    let mut stamps = BTreeMap::new();
    for line in contents.lines() {
        // lines look like: "/var/log/conman/console.x1" 2024-3-4-5:6:7
        let Some(rest) = line.strip_prefix('"') else {
            continue;
        };
        let Some((path, stamp)) = rest.split_once('"') else {
            continue;
        };
        let stamp = stamp.trim();
        if path.is_empty() || stamp.is_empty() {
            continue;
        }
        stamps.insert(path.to_string(), stamp.to_string());
    }
    stamps
}

/// Which logs rotated, given previous and current state-file stamps.
/// New entries count as changed, matching how a freshly rotated log
/// first appears in the state file.
pub fn diff_stamps(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
    agg_file: &Utf8Path,
) -> (bool, bool) {
    let mut console_changed = false;
    let mut agg_changed = false;
    for (path, stamp) in current {
        if previous.get(path) == Some(stamp) {
            continue;
        }
        if path == agg_file.as_str() {
            agg_changed = true;
        } else {
            console_changed = true;
        }
    }
    (console_changed, agg_changed)
}

pub struct RotationTask {
    ctx: Arc<WorkerContext>,
    settings: RotationSettings,
    stamps: BTreeMap<String, String>,
}

impl RotationTask {
    pub fn new(
        ctx: Arc<WorkerContext>,
        settings: RotationSettings,
    ) -> RotationTask {
        // seed from any pre-existing state so stale entries don't read
        // as fresh rotations on the first pass
        let stamps = std::fs::read_to_string(&ctx.config.logrotate_state_file)
            .map(|contents| parse_state_file(&contents))
            .unwrap_or_default();
        RotationTask { ctx, settings, stamps }
    }

    async fn run_once(&mut self, log: &Logger) {
        if !self.settings.enabled {
            return;
        }
        let ctx = Arc::clone(&self.ctx);

        // snapshot owned nodes under the lock; logrotate runs outside it
        let node_names: Vec<String> = {
            let sets = ctx.nodes.lock().await;
            sets.all_nodes().into_iter().map(|n| n.node_name).collect()
        };

        let conf = render_logrotate_conf(
            &self.settings,
            ctx.aggregator.path(),
            &ctx.config.console_log_dir,
            &ctx.config.log_backup_dir,
            &node_names,
        );
        if let Err(error) =
            std::fs::write(&ctx.config.logrotate_conf_file, conf)
        {
            warn!(log, "could not write logrotate configuration";
                "error" => %error);
            return;
        }
        if let Err(error) =
            std::fs::create_dir_all(&ctx.config.log_backup_dir)
        {
            warn!(log, "could not create log backup directory";
                "error" => %error);
            return;
        }

        let status = tokio::process::Command::new("logrotate")
            .arg("-s")
            .arg(ctx.config.logrotate_state_file.as_str())
            .arg(ctx.config.logrotate_conf_file.as_str())
            .status()
            .await;
        match status {
            Ok(status) => {
                info!(log, "logrotate completed";
                    "status" => status.code().unwrap_or(-1));
            }
            Err(error) => {
                warn!(log, "could not run logrotate"; "error" => %error);
                return;
            }
        }

        let current = match std::fs::read_to_string(
            &ctx.config.logrotate_state_file,
        ) {
            Ok(contents) => parse_state_file(&contents),
            Err(error) => {
                warn!(log, "could not read logrotate state file";
                    "error" => %error);
                return;
            }
        };
        let (console_changed, agg_changed) =
            diff_stamps(&self.stamps, &current, ctx.aggregator.path());
        self.stamps = current;

        if !console_changed && !agg_changed {
            return;
        }
        tokio::time::sleep(POST_ROTATE_PAUSE).await;

        if console_changed {
            // the multiplexer must reopen its per-node log files
            info!(log, "console logs rotated, signalling multiplexer");
            ctx.mux.signal_hup();
        }
        if agg_changed {
            info!(log, "aggregation log rotated, reopening");
            if let Err(error) = ctx.aggregator.respin() {
                warn!(log, "could not reopen aggregation log";
                    "error" => %error);
            }
        }
    }
}

impl BackgroundTask for RotationTask {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        self.run_once(log).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;

    fn settings() -> RotationSettings {
        RotationSettings {
            enabled: true,
            period_secs: 600,
            console_size: "5M".to_string(),
            console_keep: 2,
            agg_size: "20M".to_string(),
            agg_keep: 1,
        }
    }

    #[test]
    fn conf_lists_agg_and_nodes() {
        let conf = render_logrotate_conf(
            &settings(),
            Utf8Path::new("/tmp/consoleAgg/consoleAgg-w1.log"),
            Utf8Path::new("/var/log/conman"),
            Utf8Path::new("/var/log/conman.old"),
            &["x0n0".to_string(), "x0n1".to_string()],
        );
        assert!(conf.contains("/tmp/consoleAgg/consoleAgg-w1.log {"));
        assert!(conf.contains("/var/log/conman/console.x0n0 {"));
        assert!(conf.contains("/var/log/conman/console.x0n1 {"));
        assert!(conf.contains("  size=5M"));
        assert!(conf.contains("  size=20M"));
        assert!(conf.contains("  olddir /var/log/conman.old"));
        assert!(conf.contains("  rotate 2"));
    }

    #[test]
    fn state_file_parsing() {
        let contents = "\
logrotate state -- version 2
\"/var/log/conman/console.x0n0\" 2024-3-4-5:6:7
\"/tmp/consoleAgg/consoleAgg-w1.log\" 2024-3-4-5:6:8
not a state line
\"\" 2024-1-1-0:0:0
";
        let stamps = parse_state_file(contents);
        assert_eq!(stamps.len(), 2);
        assert_eq!(
            stamps["/var/log/conman/console.x0n0"],
            "2024-3-4-5:6:7"
        );
    }

    #[test]
    fn stamp_diff_classifies_changes() {
        let agg = Utf8PathBuf::from("/tmp/consoleAgg/consoleAgg-w1.log");
        let mut previous = BTreeMap::new();
        previous.insert(
            "/var/log/conman/console.x0n0".to_string(),
            "2024-3-4-5:6:7".to_string(),
        );
        previous.insert(agg.to_string(), "2024-3-4-5:6:8".to_string());

        // nothing changed
        let (console, agg_changed) =
            diff_stamps(&previous, &previous.clone(), &agg);
        assert!(!console);
        assert!(!agg_changed);

        // console log rotated
        let mut current = previous.clone();
        current.insert(
            "/var/log/conman/console.x0n0".to_string(),
            "2024-3-4-6:0:0".to_string(),
        );
        let (console, agg_changed) = diff_stamps(&previous, &current, &agg);
        assert!(console);
        assert!(!agg_changed);

        // aggregation log rotated, and a new console log shows up
        let mut current = previous.clone();
        current.insert(agg.to_string(), "2024-3-4-6:1:1".to_string());
        current.insert(
            "/var/log/conman/console.x9n0".to_string(),
            "2024-3-4-6:1:1".to_string(),
        );
        let (console, agg_changed) = diff_stamps(&previous, &current, &agg);
        assert!(console);
        assert!(agg_changed);
    }
}
