//! Colored terminal output for borg events.
//!
//! Used by the binary to render log and progress events as they stream in.
//! Structured logging still goes through `tracing`; this is the
//! human-facing half.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::borg::{ArchiveRecord, BorgMessage, LogMessage, ProgressPercent};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Print a borg log record, colored by level.
pub fn print_log(log: &LogMessage) {
    let level = log.levelname.as_deref().unwrap_or("INFO");
    let message = log.message.as_deref().unwrap_or("");
    let tag = match level {
        "ERROR" | "CRITICAL" => format!("[{level}]").red().bold().to_string(),
        "WARNING" => format!("[{level}]").yellow().bold().to_string(),
        _ => format!("[{level}]").blue().to_string(),
    };
    println!("{} {tag} {message}", timestamp().dimmed());
    let _ = io::stdout().flush();
}

/// Print a progress event on a single updating line.
pub fn print_progress(msg: &BorgMessage) {
    match msg {
        BorgMessage::ProgressPercent(progress) => print_percent(progress),
        BorgMessage::ProgressMessage(progress) => {
            if let Some(text) = &progress.message {
                print!("\r{} {}", "[PROGRESS]".cyan(), text);
                let _ = io::stdout().flush();
            }
            if progress.finished {
                println!();
            }
        }
        _ => {}
    }
}

fn print_percent(progress: &ProgressPercent) {
    if progress.finished {
        println!();
        return;
    }
    match (progress.current, progress.total) {
        (Some(current), Some(total)) if total > 0 => {
            let percent = current.saturating_mul(100) / total;
            print!(
                "\r{} {percent:>3}% {}",
                "[PROGRESS]".cyan(),
                progress.message.as_deref().unwrap_or("")
            );
        }
        _ => {
            print!(
                "\r{} {}",
                "[PROGRESS]".cyan(),
                progress.message.as_deref().unwrap_or("")
            );
        }
    }
    let _ = io::stdout().flush();
}

/// Print an archive listing, one record per line.
pub fn print_archives(records: &[ArchiveRecord]) {
    for record in records {
        match &record.time {
            Some(time) => println!("{:<40} {}", record.name.bold(), time.dimmed()),
            None => println!("{}", record.name.bold()),
        }
    }
}

/// Print a fatal error.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message.red());
}
