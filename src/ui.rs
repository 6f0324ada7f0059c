use colored::{ColoredString, Colorize};
use plangraph::{DiffState, StatusState};
use std::time::Duration;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// State Formatting
// ============================================================================

/// Node status colored by outcome
pub fn status_label(state: StatusState) -> ColoredString {
    match state {
        StatusState::Awaiting => state.as_str().dimmed(),
        StatusState::InProgress => state.as_str().blue(),
        StatusState::Complete => state.as_str().green(),
        StatusState::Failed => state.as_str().red().bold(),
        StatusState::Tainted => state.as_str().yellow(),
    }
}

/// Diff state colored by outcome
pub fn diff_label(state: DiffState) -> ColoredString {
    let text = state.to_string();
    if state.is_failure() {
        text.red().bold()
    } else if state.is_success() {
        text.green()
    } else if state.is_in_flight() {
        text.blue()
    } else {
        text.normal()
    }
}

/// Format an elapsed time as `1.2s` or `3m04s`
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

/// Last non-empty line of command output, shortened for one-line display
pub fn last_line(output: &str, max_len: usize) -> String {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= max_len {
        line.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = line.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(0)), "0.0s");
        assert_eq!(format_duration(Duration::from_millis(1250)), "1.2s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59.0s");
        assert_eq!(format_duration(Duration::from_secs(184)), "3m04s");
    }

    #[test]
    fn test_last_line_skips_trailing_blank_lines() {
        assert_eq!(last_line("first\nsecond\n\n  \n", 20), "second");
        assert_eq!(last_line("", 20), "");
    }

    #[test]
    fn test_last_line_truncates() {
        assert_eq!(last_line("abcdefghij", 10), "abcdefghij");
        assert_eq!(last_line("abcdefghijk", 10), "abcdefg...");
        assert_eq!(last_line("abcdef", 2), "...");
    }
}
