// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multiplexer configuration generation
//!
//! The generated file is the base configuration copied verbatim, followed
//! by one console line per owned node in the form the node's connection
//! method requires.  An operator can freeze the file by putting
//! `UPDATE_CONFIG=F` near the top of the base file; the first generation
//! after process start ignores the freeze so a stale flag cannot brick a
//! new worker.

use camino::Utf8Path;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::credentials::BmcCredentials;
use crate::nodes::NodeSets;

/// Only this many leading bytes of the base file are searched for the
/// freeze flag.
const FREEZE_SCAN_BYTES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum MuxConfigError {
    #[error("failed to read base configuration {path}")]
    ReadBase {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to write configuration {path}")]
    Write {
        path: String,
        #[source]
        err: std::io::Error,
    },
}

/// Whether the head of the base file permits regeneration.  The flag
/// value is frozen only when it starts with `f`/`F`.
pub fn update_enabled(head: &str) -> bool {
    const FLAG: &str = "UPDATE_CONFIG=";
    let Some(pos) = head.find(FLAG) else {
        return true;
    };
    !matches!(
        head.as_bytes().get(pos + FLAG.len()),
        Some(b'f') | Some(b'F')
    )
}

/// Render the console lines for every owned node.
///
/// Nodes whose BMC has no credentials are logged and skipped; the
/// multiplexer cannot connect without them anyway.
pub fn render_console_lines(
    log: &Logger,
    sets: &NodeSets,
    passwords: &BTreeMap<String, BmcCredentials>,
) -> String {
    let mut out = String::new();

    for node in sets.river.values() {
        let Some(creds) = passwords.get(&node.bmc_name) else {
            warn!(log, "no credentials returned for BMC";
                "bmc" => &node.bmc_name, "node" => &node.node_name);
            continue;
        };
        writeln!(
            out,
            "console name=\"{}\" dev=\"ipmi:{}\" \
             ipmiopts=\"U:{},P:{},W:solpayloadsize\"",
            node.node_name, node.bmc_fqdn, creds.username, creds.password
        )
        .unwrap();
    }

    for node in sets.password_ssh.values() {
        let Some(creds) = passwords.get(&node.bmc_name) else {
            warn!(log, "no credentials returned for BMC";
                "bmc" => &node.bmc_name, "node" => &node.node_name);
            continue;
        };
        writeln!(
            out,
            "console name=\"{}\" dev=\"/usr/bin/ssh-pwd-console {} {} {}\"",
            node.node_name, node.bmc_fqdn, creds.username, creds.password
        )
        .unwrap();
    }

    for node in sets.key_ssh.values() {
        writeln!(
            out,
            "console name=\"{}\" dev=\"/usr/bin/ssh-key-console {}\"",
            node.node_name, node.node_name
        )
        .unwrap();
    }

    out
}

/// Regenerate the multiplexer configuration file.  Returns false when the
/// freeze flag suppressed the update.
pub fn write_config(
    log: &Logger,
    base_path: &Utf8Path,
    target_path: &Utf8Path,
    sets: &NodeSets,
    passwords: &BTreeMap<String, BmcCredentials>,
    force_update: bool,
) -> Result<bool, MuxConfigError> {
    let base = std::fs::read_to_string(base_path).map_err(|err| {
        MuxConfigError::ReadBase { path: base_path.to_string(), err }
    })?;

    // guard against slicing mid-codepoint in a hand-edited base file
    let mut head_len = base.len().min(FREEZE_SCAN_BYTES);
    while !base.is_char_boundary(head_len) {
        head_len -= 1;
    }
    let head = &base[..head_len];
    if !force_update && !update_enabled(head) {
        info!(log, "skipping config update: base file freeze flag is set");
        return Ok(false);
    }

    let mut contents = base;
    contents.push_str(&render_console_lines(log, sets, passwords));
    std::fs::write(target_path, contents).map_err(|err| {
        MuxConfigError::Write { path: target_path.to_string(), err }
    })?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use rcc_common::api::NodeClass;
    use rcc_common::api::NodeInfo;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn node(name: &str, bmc: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: bmc.to_string(),
            bmc_fqdn: format!("{}.local", bmc),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    fn creds(user: &str, password: &str) -> BmcCredentials {
        BmcCredentials {
            username: user.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn freeze_flag_parsing() {
        assert!(update_enabled("# conman base configuration\n"));
        assert!(!update_enabled("# UPDATE_CONFIG=FALSE\nserver ...\n"));
        assert!(!update_enabled("# UPDATE_CONFIG=false\n"));
        assert!(update_enabled("# UPDATE_CONFIG=TRUE\n"));
        assert!(update_enabled("# UPDATE_CONFIG=true\n"));
        // missing value reads as enabled
        assert!(update_enabled("# UPDATE_CONFIG="));
    }

    #[test]
    fn lines_per_connection_method() {
        let mut sets = NodeSets::new();
        sets.insert(node("x3000c0s1b0n0", "x3000c0s1b0", NodeClass::River));
        sets.insert(node("x9000c1s0b0n0", "x9000c1s0b0", NodeClass::Mountain));
        sets.insert(node("x9000c1s1b0n0", "x9000c1s1b0", NodeClass::Hill));
        sets.insert(node("x1000c0s2b0n0", "x1000c0s2b0", NodeClass::Paradise));

        let mut passwords = BTreeMap::new();
        passwords.insert("x3000c0s1b0".to_string(), creds("admin", "pw1"));
        passwords.insert("x1000c0s2b0".to_string(), creds("root", "pw2"));

        let lines =
            render_console_lines(&test_logger(), &sets, &passwords);
        assert!(lines.contains(
            "console name=\"x3000c0s1b0n0\" dev=\"ipmi:x3000c0s1b0.local\" \
             ipmiopts=\"U:admin,P:pw1,W:solpayloadsize\"\n"
        ));
        assert!(lines.contains(
            "console name=\"x9000c1s0b0n0\" \
             dev=\"/usr/bin/ssh-key-console x9000c1s0b0n0\"\n"
        ));
        assert!(lines.contains(
            "console name=\"x9000c1s1b0n0\" \
             dev=\"/usr/bin/ssh-key-console x9000c1s1b0n0\"\n"
        ));
        assert!(lines.contains(
            "console name=\"x1000c0s2b0n0\" \
             dev=\"/usr/bin/ssh-pwd-console x1000c0s2b0.local root pw2\"\n"
        ));
    }

    #[test]
    fn missing_credentials_drop_the_line() {
        let mut sets = NodeSets::new();
        sets.insert(node("x3000c0s1b0n0", "x3000c0s1b0", NodeClass::River));
        let lines =
            render_console_lines(&test_logger(), &sets, &BTreeMap::new());
        assert!(lines.is_empty());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(
            dir.path().join("conman_base.conf"),
        )
        .unwrap();
        let target = camino::Utf8PathBuf::from_path_buf(
            dir.path().join("conman.conf"),
        )
        .unwrap();
        std::fs::write(&base, "server loopback=ON\n").unwrap();

        let mut sets = NodeSets::new();
        sets.insert(node("x9000c1s0b0n0", "x9000c1s0b0", NodeClass::Hill));

        let wrote = write_config(
            &test_logger(),
            &base,
            &target,
            &sets,
            &BTreeMap::new(),
            true,
        )
        .unwrap();
        assert!(wrote);
        let contents = std::fs::read_to_string(&target).unwrap();
        assert!(contents.starts_with("server loopback=ON\n"));
        assert!(contents.contains("ssh-key-console x9000c1s0b0n0"));
    }

    #[test]
    fn freeze_flag_suppresses_unforced_updates() {
        let dir = tempfile::tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(
            dir.path().join("conman_base.conf"),
        )
        .unwrap();
        let target = camino::Utf8PathBuf::from_path_buf(
            dir.path().join("conman.conf"),
        )
        .unwrap();
        std::fs::write(&base, "# UPDATE_CONFIG=FALSE\nserver x\n").unwrap();

        let sets = NodeSets::new();
        let wrote = write_config(
            &test_logger(),
            &base,
            &target,
            &sets,
            &BTreeMap::new(),
            false,
        )
        .unwrap();
        assert!(!wrote);
        assert!(!target.exists());

        // first pass after startup forces through the freeze
        let wrote = write_config(
            &test_logger(),
            &base,
            &target,
            &sets,
            &BTreeMap::new(),
            true,
        )
        .unwrap();
        assert!(wrote);
    }
}
