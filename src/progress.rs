//! Progress display for the blocksync binary
//!
//! The library only exposes counters and callbacks; everything drawn on a
//! terminal lives here.

use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use crate::patcher::PatchStats;
use crate::task::TaskState;

/// Byte-level progress bar, hidden when progress display is off.
pub fn byte_bar(enabled: bool, total: i64, message: &'static str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total.max(0) as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>8} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .expect("static progress template")
            .progress_chars("=>-"),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Drive a bar off a task's shared counters until the task finishes.
pub fn track_task(bar: &ProgressBar, state: &TaskState) {
    while !state.is_done() {
        bar.set_position(state.bytes_done().max(0) as u64);
        std::thread::sleep(Duration::from_millis(50));
    }
    bar.set_position(state.bytes_done().max(0) as u64);
    bar.finish_and_clear();
}

/// Print the post-sync summary.
pub fn print_sync_summary(stats: &PatchStats, file_size: i64) {
    let saved = file_size - stats.bytes_downloaded;
    let percent = if file_size > 0 {
        100.0 * saved as f64 / file_size as f64
    } else {
        0.0
    };
    println!("Downloaded:  {} ({} blocks)", HumanBytes(stats.bytes_downloaded as u64), stats.blocks_downloaded);
    println!(
        "Reused:      {} ({} copied, {} in place)",
        HumanBytes(stats.bytes_reused as u64),
        stats.blocks_copied,
        stats.blocks_in_place
    );
    println!("Saved:       {} ({:.1}%)", HumanBytes(saved.max(0) as u64), percent);
}
