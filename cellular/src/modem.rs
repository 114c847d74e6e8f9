pub mod baud;
pub mod config;
pub mod connection;
pub mod hw;
pub mod metrics;
pub mod quality;

use embassy_time::{Duration, Instant};

/// What is left of `phase`, capped by the overall `deadline`.
pub fn budget(deadline: Instant, phase: Duration) -> Duration {
    phase.min(deadline.saturating_duration_since(Instant::now()))
}
