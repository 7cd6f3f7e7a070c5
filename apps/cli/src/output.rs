//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use ferry_types::{TaskRunner, UpdatedInfo};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Print a value as JSON, or with its human rendering
pub fn print_output<T: Serialize>(value: &T, format: OutputFormat, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human | OutputFormat::Table => human(value),
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn format_rate(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        "unlimited".to_string()
    } else {
        format!("{}/s", format_bytes(bytes_per_sec))
    }
}

pub fn status_icon(info: UpdatedInfo) -> StyledObject<&'static str> {
    match info {
        UpdatedInfo::Done => style("✓").green(),
        UpdatedInfo::Running => style("→").cyan(),
        UpdatedInfo::Interrupted => style("⏸").yellow(),
        UpdatedInfo::InError => style("✗").red(),
        UpdatedInfo::ToSubmit => style("·").dim(),
    }
}

/// Bytes moved so far, when the block size is known
fn transferred(runner: &TaskRunner) -> u64 {
    let moved = runner.rank * u64::from(runner.blocksize);
    runner.file_size.map_or(moved, |size| moved.min(size))
}

fn progress(runner: &TaskRunner) -> String {
    match runner.file_size {
        Some(size) if size > 0 => format!("{:.1}%", transferred(runner) as f64 * 100.0 / size as f64),
        _ if runner.updated_info == UpdatedInfo::Done => "100.0%".to_string(),
        _ => "?".to_string(),
    }
}

pub fn print_runner(runner: &TaskRunner, detailed: bool) {
    println!(
        "{} {} {} {} [{}]",
        status_icon(runner.updated_info),
        style(runner.special_id).bold(),
        style(&runner.filename).bold(),
        style(progress(runner)).dim(),
        style(runner.updated_info).dim()
    );

    if detailed {
        println!("    Key: {}", runner.key());
        println!("    Rule: {} ({})", runner.rule_id, runner.mode.as_str());
        println!("    Role: {}", if runner.is_sender { "sender" } else { "receiver" });
        println!(
            "    Step: {} / last {} ({})",
            runner.global_step.as_str(),
            runner.global_last_step.as_str(),
            runner.step_status
        );
        match runner.file_size {
            Some(size) => println!(
                "    Size: {} / {}",
                format_bytes(transferred(runner)),
                format_bytes(size)
            ),
            None => println!("    Size: unknown"),
        }
        println!("    Rank: {} (blocks of {})", runner.rank, format_bytes(u64::from(runner.blocksize)));
        println!("    Start: {}", runner.start.to_rfc3339());
        println!("    Last update: {}", runner.stop.to_rfc3339());
        if !runner.file_info.is_empty() {
            println!("    Info: {}", runner.file_info);
        }
        if let Some(ref info) = runner.info {
            if runner.updated_info == UpdatedInfo::InError {
                println!("    Error: {}", style(info).red());
            } else {
                println!("    Note: {}", info);
            }
        }
        println!();
    }
}

#[derive(Tabled)]
struct RunnerRow {
    id: i64,
    peer: String,
    rule: String,
    file: String,
    size: String,
    progress: String,
    status: String,
}

pub fn runner_table(runners: &[TaskRunner]) -> String {
    let rows: Vec<RunnerRow> = runners
        .iter()
        .map(|r| RunnerRow {
            id: r.special_id,
            peer: r.remote_host().to_string(),
            rule: r.rule_id.clone(),
            file: shorten(&r.filename, 30),
            size: r.file_size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            progress: progress(r),
            status: r.updated_info.to_string(),
        })
        .collect();
    Table::new(rows).to_string()
}

fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let tail: String = text.chars().rev().take(max - 3).collect::<Vec<_>>().into_iter().rev().collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_keep_their_end() {
        assert_eq!(shorten("short.txt", 30), "short.txt");
        let long = "/very/long/path/to/some/deeply/nested/report.csv";
        let short = shorten(long, 20);
        assert_eq!(short.chars().count(), 20);
        assert!(short.ends_with("report.csv"));
    }

    #[test]
    fn zero_rate_is_unlimited() {
        assert_eq!(format_rate(0), "unlimited");
        assert!(format_rate(2048).ends_with("/s"));
    }
}
