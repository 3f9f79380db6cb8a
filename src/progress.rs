//! Throughput accounting for inbound transfers.
//!
//! The receiver feeds byte counts and timestamps into a `ProgressMeter` and
//! forwards whatever samples it yields to a `ProgressSink`. Rendering is up
//! to the sink; the server uses `TracingSink`.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

const KIB: f64 = 1024.0;

/// One throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub received: u64,
    pub declared: u64,
    /// KB/s over the window since the previous sample.
    pub instant_kbps: f64,
    /// KB/s over the whole transfer so far.
    pub average_kbps: f64,
    pub percent: f64,
}

impl fmt::Display for ProgressSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instant speed: {:.2} KB/s, Average speed: {:.2} KB/s, Progress: {}/{} bytes ({:.1}%)",
            self.instant_kbps, self.average_kbps, self.received, self.declared, self.percent
        )
    }
}

/// Lifecycle events of one inbound transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started { name: String, declared: u64 },
    Sample(ProgressSample),
    Finished { received: u64, declared: u64 },
}

/// Destination for progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Sink that writes events through `tracing`.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { name, declared } => {
                debug!(file = %name, declared, "Receiving file content");
            }
            ProgressEvent::Sample(sample) => {
                info!(
                    instant_kbps = sample.instant_kbps,
                    average_kbps = sample.average_kbps,
                    "{}",
                    sample
                );
            }
            ProgressEvent::Finished { received, declared } => {
                debug!(received, declared, "Finished reading file content");
            }
        }
    }
}

/// Sink that drops every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Sampling state for a single transfer.
///
/// Callers pass the current time into every method, which keeps the meter
/// free of any clock of its own.
#[derive(Debug)]
pub struct ProgressMeter {
    declared: u64,
    received: u64,
    interval: Duration,
    start: Instant,
    last_sample: Instant,
    since_last: u64,
}

impl ProgressMeter {
    pub fn new(declared: u64, interval: Duration, now: Instant) -> Self {
        Self {
            declared,
            received: 0,
            interval,
            start: now,
            last_sample: now,
            since_last: 0,
        }
    }

    /// Account for `n` more bytes. Yields a sample once `interval` has
    /// passed since the previous one.
    pub fn record(&mut self, n: u64, now: Instant) -> Option<ProgressSample> {
        self.received += n;
        self.since_last += n;

        if now.saturating_duration_since(self.last_sample) >= self.interval {
            Some(self.take_sample(now))
        } else {
            None
        }
    }

    /// Final sample, produced only if any time elapsed since the start.
    pub fn finish(&mut self, now: Instant) -> Option<ProgressSample> {
        if now.saturating_duration_since(self.start).is_zero() {
            return None;
        }
        Some(self.take_sample(now))
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    fn take_sample(&mut self, now: Instant) -> ProgressSample {
        let window = now.saturating_duration_since(self.last_sample).as_secs_f64();
        let total = now.saturating_duration_since(self.start).as_secs_f64();

        let sample = ProgressSample {
            received: self.received,
            declared: self.declared,
            instant_kbps: rate_kbps(self.since_last, window),
            average_kbps: rate_kbps(self.received, total),
            percent: if self.declared > 0 {
                self.received as f64 * 100.0 / self.declared as f64
            } else {
                0.0
            },
        };

        self.since_last = 0;
        self.last_sample = now;
        sample
    }
}

fn rate_kbps(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 / KIB / secs
    } else {
        0.0
    }
}
