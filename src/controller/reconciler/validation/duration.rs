//! # Duration Validation
//!
//! Handles parsing and validating Kubernetes duration strings.

use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Parse Kubernetes duration string into std::time::Duration
/// Supports formats: "500ms", "30s", "1m", "5m", "1h", "1d" and compounds such as "1h30m"
/// Returns Duration or error if format is invalid
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    // Whole string: one or more <number><unit> components
    let format_regex = Regex::new(r"^(\d+(ms|s|m|h|d))+$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;
    let component_regex = Regex::new(r"(?P<number>\d+)(?P<unit>ms|s|m|h|d)")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    // Match against trimmed, lowercase version
    let interval_lower = duration_trimmed.to_lowercase();

    if !format_regex.is_match(&interval_lower) {
        return Err(anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '1m', '5m', '1h30m')",
            duration_trimmed
        ));
    }

    let mut total_millis: u64 = 0;
    for captures in component_regex.captures_iter(&interval_lower) {
        let number_str = &captures["number"];
        let unit = &captures["unit"];

        let number: u64 = number_str.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid duration number '{}' in '{}': {}",
                number_str,
                duration_trimmed,
                e
            )
        })?;

        let unit_millis: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid unit '{}' in duration '{}'. Expected: ms, s, m, h, or d",
                    unit,
                    duration_trimmed
                ));
            }
        };

        total_millis = number
            .checked_mul(unit_millis)
            .and_then(|millis| total_millis.checked_add(millis))
            .ok_or_else(|| anyhow::anyhow!("Duration '{}' is too large", duration_trimmed))?;
    }

    if total_millis == 0 {
        return Err(anyhow::anyhow!(
            "Duration must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    Ok(Duration::from_millis(total_millis))
}
