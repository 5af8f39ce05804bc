//! Progress percentage and remaining-time estimates

use std::time::{Duration, Instant};

/// Estimates are hidden for this many rounds while they settle
const SETTLE_ROUNDS: u32 = 3;
const SETTLE_ROUNDS_LARGE: u32 = 5;
const LARGE_MAILBOX: usize = 50_000;

pub fn percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (processed as f64 / total as f64 * 100.0).ceil();
    percent.clamp(0.0, 100.0) as u8
}

pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        return "less than a minute remaining".to_string();
    }

    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    let parts: Vec<String> = [(days, "day"), (hours, "hour"), (minutes, "minute")]
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| {
            if *value == 1 {
                format!("1 {}", unit)
            } else {
                format!("{} {}s", value, unit)
            }
        })
        .collect();

    format!("{} remaining", parts.join(", "))
}

/// Tracks throughput of one build run
#[derive(Debug)]
pub struct ProgressEstimator {
    started: Instant,
    processed_at_start: usize,
    rounds: u32,
    original_estimate: Option<u64>,
}

impl ProgressEstimator {
    pub fn new(processed_at_start: usize) -> Self {
        Self {
            started: Instant::now(),
            processed_at_start,
            rounds: 0,
            original_estimate: None,
        }
    }

    /// Seconds remaining, once enough rounds were observed
    pub fn estimate(&mut self, processed: usize, total: usize) -> Option<u64> {
        self.estimate_after(self.started.elapsed(), processed, total)
    }

    pub fn estimate_after(&mut self, elapsed: Duration, processed: usize, total: usize) -> Option<u64> {
        self.rounds += 1;

        let done = processed.saturating_sub(self.processed_at_start);
        if done == 0 {
            return None;
        }

        let remaining = total.saturating_sub(processed);
        let seconds = (elapsed.as_secs_f64() / done as f64 * remaining as f64).ceil() as u64;

        let settle = if total > LARGE_MAILBOX {
            SETTLE_ROUNDS_LARGE
        } else {
            SETTLE_ROUNDS
        };
        if self.rounds < settle {
            return None;
        }

        if self.original_estimate.is_none() {
            self.original_estimate = Some(seconds);
        }
        Some(seconds)
    }

    /// First estimate shown to the user
    pub fn original_estimate(&self) -> Option<u64> {
        self.original_estimate
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
