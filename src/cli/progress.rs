//! Progress bar utilities for CLI output
//!
//! Key features:
//! - A grab progress bar fed by the transfer executor's progress callback
//! - Consistent visual styling
//! - A writer that mirrors log output to a file

use crate::core::transfer::{ProgressUpdate, TransferPhase};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Styles - Consistent visual appearance
// ============================================================================

/// Get the spinner style for scanning
fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
}

/// Get the progress bar style for copying
fn progress_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:40.cyan/dim}] {pos}/{len} ({percent}%) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

/// Get the style for completed progress bars
fn completed_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  ✓ [{bar:40.green/dim}] {pos}/{len} ({percent}%) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━━")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 68;
    let title_padded = format!("{:^width$}", title, width = width - 4);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

// ============================================================================
// Grab progress tracker
// ============================================================================

/// Progress display for a one-shot grab
#[derive(Clone)]
pub struct GrabProgress {
    progress_bar: ProgressBar,
    start_time: Instant,
}

impl GrabProgress {
    /// Start with a spinner until the file count is known
    pub fn new() -> Self {
        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(spinner_style());
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        progress_bar.set_message("Scanning...");

        Self {
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Apply an update from the transfer executor
    pub fn update(&self, update: &ProgressUpdate) {
        let total = update.total_files as u64;
        match update.phase {
            TransferPhase::Scanning => self.progress_bar.set_message("Scanning..."),
            TransferPhase::Copying => {
                if self.progress_bar.length() != Some(total) {
                    self.progress_bar.set_style(progress_bar_style());
                    self.progress_bar.set_length(total);
                }
                self.progress_bar
                    .set_position(update.current_index.saturating_sub(1) as u64);
                self.progress_bar.set_message(format!(
                    "{} ({})",
                    update.current_file,
                    self.rate(update.bytes_processed)
                ));
            }
            TransferPhase::Complete => self.progress_bar.set_position(total),
        }
    }

    /// Callback to hand to `TransferOptions`
    pub fn callback(&self) -> Arc<dyn Fn(ProgressUpdate) + Send + Sync> {
        let this = self.clone();
        Arc::new(move |update| this.update(&update))
    }

    fn rate(&self, bytes: u64) -> String {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            format!("{:.1} MB/s", bytes as f64 / elapsed / 1024.0 / 1024.0)
        } else {
            "0.0 MB/s".to_string()
        }
    }

    /// Finish the progress display
    pub fn finish(&self, bytes: u64) {
        self.progress_bar.set_style(completed_style());
        self.progress_bar.finish_with_message(format!(
            "Complete ({} in {})",
            format_bytes(bytes),
            format_duration(self.start_time.elapsed())
        ));
    }

    /// Finish with an error
    pub fn finish_with_error(&self, msg: &str) {
        self.progress_bar.abandon_with_message(format!("✗ {}", msg));
    }
}

impl Default for GrabProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

// ============================================================================
// Dual writer for file + console logging
// ============================================================================

/// A writer that writes to both console and file
///
/// Used for logging to both stderr and a log file simultaneously.
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write_all(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}
