//! Background task that appends a timestamp record on a fixed period.

use crate::runtime::Context;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Periodic timestamp producer
pub struct TimestampTicker {
    ctx: Context,
    interval: Duration,
}

impl TimestampTicker {
    pub fn new(ctx: Context, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("timestamp".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!(interval_secs = self.interval.as_secs_f64(), "Timestamp ticker started");
        let mut next = Instant::now() + self.interval;

        loop {
            let wait = next.saturating_duration_since(Instant::now());
            if self.ctx.shutdown.wait_timeout(wait) {
                break;
            }

            let record = format_record(&Local::now());
            match self.ctx.store.append(record.as_bytes()) {
                Ok(()) => debug!(record = record.trim_end(), "Appended timestamp"),
                Err(e) => warn!(error = %e, "Failed to append timestamp"),
            }

            // Fixed cadence; skip missed ticks instead of bursting after a stall.
            next += self.interval;
            let now = Instant::now();
            if next < now {
                next = now + self.interval;
            }
        }

        info!("Timestamp ticker stopped");
    }
}

/// Format one timestamp record, e.g.
/// `timestamp:Tue, 02 Jan 2024 03:04:05 +0000\n`.
pub fn format_record<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("timestamp:{}\n", now.format("%a, %d %b %Y %H:%M:%S %z"))
}
