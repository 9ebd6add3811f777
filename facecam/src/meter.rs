//! Throughput counters of the capture task and the detection loop.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant},
};

/// Period between two meter log lines.
pub const REPORT_PERIOD: Duration = Duration::from_secs(2);

pub static METER: Meter = Meter::new();

/// Counters of captured frames and detection ticks since the last report.
#[derive(Default)]
pub struct Meter {
    video_frames: AtomicU64,
    ticks: AtomicU64,
    failed_ticks: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            video_frames: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            failed_ticks: AtomicU64::new(0),
        }
    }

    pub fn tick_video_frame(&self) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_detection(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed(&self) {
        self.failed_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the counts of the period that lasted `elapsed` and start a new one.
    pub fn take_report(&self, elapsed: Duration) -> MeterReport {
        MeterReport {
            video_frames: self.video_frames.swap(0, Ordering::Relaxed),
            ticks: self.ticks.swap(0, Ordering::Relaxed),
            failed_ticks: self.failed_ticks.swap(0, Ordering::Relaxed),
            elapsed,
        }
    }
}

/// Counts of one reporting period.
#[derive(Clone, Debug, PartialEq)]
pub struct MeterReport {
    pub video_frames: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub elapsed: Duration,
}

impl MeterReport {
    pub fn video_fps(&self) -> f32 {
        match self.elapsed.as_secs_f32() {
            secs if secs > 0.0 => self.video_frames as f32 / secs,
            _ => 0.0,
        }
    }

    /// One log line for the period, `None` when nothing happened.
    pub fn summary(&self) -> Option<String> {
        if self.video_frames == 0 && self.ticks == 0 && self.failed_ticks == 0 {
            return None;
        }
        Some(format!(
            "Video: {:.2} fps, detection ticks: {} completed, {} failed",
            self.video_fps(),
            self.ticks,
            self.failed_ticks
        ))
    }
}

/// Log a [`MeterReport`] of the global [`METER`] every [`REPORT_PERIOD`].
pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut report_interval = interval_at(Instant::now() + REPORT_PERIOD, REPORT_PERIOD);
        let mut period_start = Instant::now();

        loop {
            report_interval.tick().await;
            let report = METER.take_report(period_start.elapsed());
            period_start = Instant::now();

            if let Some(summary) = report.summary() {
                log::info!("{summary}");
            }
        }
    })
}
