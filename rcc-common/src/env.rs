// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment-variable handling with range pinning
//!
//! All three services take their tuning knobs from the environment.  Values
//! outside the sane range for a knob are pinned to the nearest bound rather
//! than rejected, so a bad deployment manifest degrades instead of
//! crash-looping.

use slog::Logger;
use slog::info;
use slog::warn;

/// Read an integer knob from the environment, pinning it into
/// `[min, max]`.  Returns `default` when the variable is unset or
/// unparseable.
pub fn int_from_env(
    log: &Logger,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> u64 {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    info!(log, "found env var"; "name" => name, "value" => &raw);
    let value = match raw.parse::<u64>() {
        Ok(value) => value,
        Err(error) => {
            warn!(
                log,
                "expected an integer value, keeping default";
                "name" => name,
                "value" => &raw,
                "default" => default,
                "error" => %error,
            );
            return default;
        }
    };
    if value < min {
        warn!(log, "pinning to minimum"; "name" => name, "min" => min);
        min
    } else if value > max {
        warn!(log, "pinning to maximum"; "name" => name, "max" => max);
        max
    } else {
        value
    }
}

/// Read a string knob, falling back to `default` when unset.
pub fn string_from_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Whether a knob value should be treated as true: "t", "1", or "true" in
/// any capitalization.  Everything else is false.
pub fn is_truthy(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower == "t" || lower == "1" || lower == "true"
}

/// Whether the DEBUG env var asks for self-test fakes.
pub fn debug_mode() -> bool {
    std::env::var("DEBUG").map(|v| v == "TRUE").unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    // Env-var manipulation is process-global, so the cases share one test.
    #[test]
    fn int_knobs_pin_and_default() {
        let log = test_logger();
        std::env::remove_var("RCC_TEST_KNOB");
        assert_eq!(int_from_env(&log, "RCC_TEST_KNOB", 30, 10, 600), 30);

        std::env::set_var("RCC_TEST_KNOB", "45");
        assert_eq!(int_from_env(&log, "RCC_TEST_KNOB", 30, 10, 600), 45);

        std::env::set_var("RCC_TEST_KNOB", "5");
        assert_eq!(int_from_env(&log, "RCC_TEST_KNOB", 30, 10, 600), 10);

        std::env::set_var("RCC_TEST_KNOB", "100000");
        assert_eq!(int_from_env(&log, "RCC_TEST_KNOB", 30, 10, 600), 600);

        std::env::set_var("RCC_TEST_KNOB", "not-a-number");
        assert_eq!(int_from_env(&log, "RCC_TEST_KNOB", 30, 10, 600), 30);
        std::env::remove_var("RCC_TEST_KNOB");
    }

    #[test]
    fn truthiness() {
        for yes in ["t", "T", "1", "true", "True", "TRUE"] {
            assert!(is_truthy(yes), "{:?} should be true", yes);
        }
        for no in ["", "0", "f", "false", "yes", "on", "2"] {
            assert!(!is_truthy(no), "{:?} should be false", no);
        }
    }
}
