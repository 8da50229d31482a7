//! Colored terminal lines printed by the `jobrunner` binary.
//!
//! Job output itself is echoed by the scanner; these helpers only frame it
//! with start, status and summary lines.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::events::Stats;
use crate::supervisor::{JobOutcome, JobStatus};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to at most `max_len` characters, adding an ellipsis.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

/// Render an argv list the way a shell would accept it.
#[must_use]
pub fn format_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Print the line announcing a job.
pub fn print_job_start(ident: &str, argv: &[String]) {
    println!(
        "{} {} ident={} {}",
        timestamp().dimmed(),
        "[JOB]".blue().bold(),
        ident.cyan(),
        truncate(&format_command(argv), 120).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print a status transition.
pub fn print_status(ident: &str, status: JobStatus) {
    println!(
        "{} {} {} {}",
        timestamp().dimmed(),
        "[STATUS]".magenta().bold(),
        ident.dimmed(),
        status
    );
    let _ = io::stdout().flush();
}

/// Print the final status and return code.
pub fn print_outcome(ident: &str, outcome: &JobOutcome) {
    let label = format!("[{}]", outcome.status.as_str().to_uppercase());
    let label = match outcome.status {
        JobStatus::Successful => label.green().bold().to_string(),
        JobStatus::Timeout | JobStatus::Canceled => label.yellow().bold().to_string(),
        _ => label.red().bold().to_string(),
    };
    println!(
        "{} {} ident={} rc={}",
        timestamp().dimmed(),
        label,
        ident.cyan(),
        outcome.rc
    );
    let _ = io::stdout().flush();
}

/// Print one line of tallies per host.
pub fn print_stats(stats: &Stats) {
    for (host, line) in stats_lines(stats) {
        println!("{} {} {}", "[STATS]".blue().bold(), host.bold(), line);
    }
    let _ = io::stdout().flush();
}

fn stats_lines(stats: &Stats) -> Vec<(String, String)> {
    let mut hosts: Vec<&String> = stats
        .ok
        .keys()
        .chain(stats.changed.keys())
        .chain(stats.failures.keys())
        .chain(stats.dark.keys())
        .chain(stats.skipped.keys())
        .collect();
    hosts.sort();
    hosts.dedup();

    hosts
        .into_iter()
        .map(|host| {
            let count = |tally: &std::collections::BTreeMap<String, u64>| {
                tally.get(host).copied().unwrap_or(0)
            };
            let line = format!(
                "ok={} changed={} unreachable={} failed={} skipped={} rescued={} ignored={}",
                count(&stats.ok),
                count(&stats.changed),
                count(&stats.dark),
                count(&stats.failures),
                count(&stats.skipped),
                count(&stats.rescued),
                count(&stats.ignored),
            );
            (host.clone(), line)
        })
        .collect()
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}
