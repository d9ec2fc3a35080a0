//! Colored CLI display utilities for supervised process output.
//!
//! Used by the `proc-supervisor` binary to print captured lines and the
//! final outcome of the child.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::process::Outcome;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Maximum length of a command line shown in the start banner.
const MAX_COMMAND_LEN: usize = 120;

/// Truncate a string to a maximum number of characters, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

/// Render a program and its arguments as one line, quoting arguments with spaces.
#[must_use]
pub fn format_command(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    for arg in args {
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            parts.push(format!("{arg:?}"));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

/// Print process start information.
pub fn print_start(program: &str, args: &[String], pid: Option<u32>) {
    println!(
        "{} {} {} {}",
        timestamp().dimmed(),
        "[START]".blue().bold(),
        truncate(&format_command(program, args), MAX_COMMAND_LEN).cyan(),
        pid.map_or(String::new(), |pid| format!("pid={pid}")).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print one captured output line.
pub fn print_line(line: &str, raw_mode: bool) {
    if raw_mode {
        println!("{line}");
    } else {
        println!("{} {} {}", timestamp().dimmed(), "[OUT]".green(), line);
    }
    let _ = io::stdout().flush();
}

/// Print the final outcome.
pub fn print_outcome(outcome: &Outcome) {
    let ts = timestamp();
    if outcome.is_success() {
        println!("{} {} {}", ts.dimmed(), "[EXIT]".blue().bold(), outcome);
    } else if outcome.exited_on_its_own() {
        println!("{} {} {}", ts.dimmed(), "[EXIT]".red().bold(), outcome.red());
    } else {
        println!(
            "{} {} {}",
            ts.dimmed(),
            "[KILLED]".yellow().bold(),
            outcome.yellow()
        );
    }
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stderr().flush();
}
