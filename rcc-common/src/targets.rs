// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec for the shared per-worker targets file
//!
//! The operator writes a two-line file on a volume every worker can read:
//!
//! ```text
//! River:<n>
//! Mountain:<n>
//! ```
//!
//! Workers poll it every assignment cycle.  A missing or garbled line
//! leaves the corresponding target untouched, so a torn read degrades to
//! "keep the previous target" rather than releasing the fleet's consoles.

use camino::Utf8Path;
use std::io;

const RIVER_PREFIX: &str = "River:";
const MOUNTAIN_PREFIX: &str = "Mountain:";

/// Per-worker capacity targets as written by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetCounts {
    pub river: u64,
    pub mountain: u64,
}

/// Targets as read back by a worker; either line may be absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartialTargets {
    pub river: Option<u64>,
    pub mountain: Option<u64>,
}

/// Render the two-line file contents.
pub fn render(counts: &TargetCounts) -> String {
    format!(
        "{}{}\n{}{}\n",
        RIVER_PREFIX, counts.river, MOUNTAIN_PREFIX, counts.mountain
    )
}

/// Parse targets out of file contents, tolerating junk lines.
pub fn parse(contents: &str) -> PartialTargets {
    let mut targets = PartialTargets::default();
    for line in contents.lines() {
        if let Some(rest) = find_value(line, RIVER_PREFIX) {
            if let Ok(n) = rest.trim().parse() {
                targets.river = Some(n);
            }
        } else if let Some(rest) = find_value(line, MOUNTAIN_PREFIX) {
            if let Ok(n) = rest.trim().parse() {
                targets.mountain = Some(n);
            }
        }
    }
    targets
}

// The prefix may appear anywhere in the line; the value runs to the end.
fn find_value<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.find(prefix).map(|pos| &line[pos + prefix.len()..])
}

/// Write the targets file in place.
pub fn write_file(path: &Utf8Path, counts: &TargetCounts) -> io::Result<()> {
    std::fs::write(path, render(counts))
}

/// Read and parse the targets file.
pub fn read_file(path: &Utf8Path) -> io::Result<PartialTargets> {
    Ok(parse(&std::fs::read_to_string(path)?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let counts = TargetCounts { river: 2000, mountain: 750 };
        let parsed = parse(&render(&counts));
        assert_eq!(parsed.river, Some(2000));
        assert_eq!(parsed.mountain, Some(750));
    }

    #[test]
    fn junk_lines_are_ignored() {
        let parsed = parse("# comment\nRiver:12\nnothing\nMountain:nope\n");
        assert_eq!(parsed.river, Some(12));
        assert_eq!(parsed.mountain, None);
    }

    #[test]
    fn empty_file_yields_no_targets() {
        assert_eq!(parse(""), PartialTargets::default());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(
            dir.path().join("TargetNodes.txt"),
        )
        .unwrap();
        write_file(&path, &TargetCounts { river: 5, mountain: 3 }).unwrap();
        let parsed = read_file(&path).unwrap();
        assert_eq!(parsed.river, Some(5));
        assert_eq!(parsed.mountain, Some(3));
    }
}
