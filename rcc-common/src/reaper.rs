// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zombie process reaper
//!
//! The console multiplexer spawns ssh/ipmi helper processes that it does
//! not always collect, and the services themselves shell out to tools like
//! `ssh-keygen` and `logrotate`.  This task periodically scans the process
//! table and waits on anything in state `Z`.

use futures::FutureExt;
use futures::future::BoxFuture;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::warn;

use crate::background::BackgroundTask;

/// How often the process table is scanned.
pub const REAP_PERIOD_SECS: u64 = 30;

pub struct ZombieReaper;

impl BackgroundTask for ZombieReaper {
    fn activate<'a>(&'a mut self, log: &'a Logger) -> BoxFuture<'a, ()> {
        async move {
            let output = match tokio::process::Command::new("ps")
                .args(["-eo", "pid,stat"])
                .output()
                .await
            {
                Ok(output) => output,
                Err(error) => {
                    warn!(log, "failed to list processes"; "error" => %error);
                    return;
                }
            };
            let text = String::from_utf8_lossy(&output.stdout);
            for pid in parse_zombies(&text) {
                reap(log, pid);
            }
        }
        .boxed()
    }
}

/// Pull the pids of zombie processes out of `ps -eo pid,stat` output.
pub fn parse_zombies(ps_output: &str) -> Vec<i32> {
    let mut zombies = Vec::new();
    for line in ps_output.lines() {
        let mut columns = line.split_whitespace();
        let (Some(pid), Some(stat)) = (columns.next(), columns.next()) else {
            continue;
        };
        // stat may carry modifier characters after the state letter
        if !stat.starts_with('Z') {
            continue;
        }
        match pid.parse::<i32>() {
            Ok(pid) => zombies.push(pid),
            Err(_) => continue,
        }
    }
    zombies
}

fn reap(log: &Logger, pid: i32) {
    info!(log, "waiting on zombie process"; "pid" => pid);
    let mut status: libc::c_int = 0;
    let rv = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if rv == pid {
        info!(log, "cleaned up zombie process"; "pid" => pid);
    } else {
        // most commonly ECHILD: the zombie belongs to another process
        debug!(
            log,
            "could not reap process";
            "pid" => pid,
            "rv" => rv,
            "errno" => std::io::Error::last_os_error().raw_os_error(),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_zombie_lines() {
        let output = "\
    PID STAT
      1 Ss
     42 Z
     57 Zs
    108 R+
    bad Z
";
        assert_eq!(parse_zombies(output), vec![42, 57]);
    }

    #[test]
    fn empty_output() {
        assert!(parse_zombies("").is_empty());
        assert!(parse_zombies("  PID STAT\n").is_empty());
    }
}
