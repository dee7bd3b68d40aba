//! Transfer-phase progress for clone and fetch
//!
//! libgit2 reports object counts through the transfer callback and the
//! server-side phases ("Counting objects", "Compressing objects") only as
//! free text on the sideband channel. Both are folded into a single
//! 20..=100 percentage scale, with each phase owning its own slice in phase
//! order, and published through the run's reporter.

use crate::progress::ProgressReporter;
use regex::Regex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Percentage published when a transfer starts
pub const TRANSFER_FLOOR: u8 = 20;
/// Object count at which the pseudo-progress is halfway through a phase
const PSEUDO_SCALE: u64 = 100;

static SIDEBAND_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<stage>Counting|Compressing) objects:\s+(?P<pct>\d+)%(?:\s+\((?P<cur>\d+)/(?P<total>\d+)\))?")
        .expect("sideband pattern is valid")
});

/// Phases of an object transfer, in the order they occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStage {
    Counting,
    Compressing,
    Receiving,
    Resolving,
    Writing,
}

impl TransferStage {
    pub fn label(&self) -> &'static str {
        match self {
            TransferStage::Counting => "Counting objects",
            TransferStage::Compressing => "Compressing objects",
            TransferStage::Receiving => "Receiving objects",
            TransferStage::Resolving => "Resolving deltas",
            TransferStage::Writing => "Writing files",
        }
    }

    /// Slice of the transfer scale owned by this phase
    ///
    /// Slices are contiguous and ordered, so a later phase never reads lower
    /// than a finished earlier one. Receiving dominates because it is where
    /// the bytes move.
    pub fn span(&self) -> (u8, u8) {
        match self {
            TransferStage::Counting => (TRANSFER_FLOOR, 25),
            TransferStage::Compressing => (25, 30),
            TransferStage::Receiving => (30, 85),
            TransferStage::Resolving => (85, 95),
            TransferStage::Writing => (95, 100),
        }
    }
}

/// Map a phase's object count onto its slice of the transfer scale
///
/// With a known total the result is `start + width * current / total`.
/// Without one a saturating curve is used that approaches the end of the
/// slice without reaching it.
pub fn transfer_percent(stage: TransferStage, current: u64, total: Option<u64>) -> u8 {
    let (start, end) = stage.span();
    let width = u64::from(end - start);
    let offset = match total {
        Some(total) if total > 0 => current.min(total) * width / total,
        _ => current * width / (current + PSEUDO_SCALE),
    };
    (u64::from(start) + offset).min(u64::from(end)) as u8
}

/// A phase report parsed from sideband text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandProgress {
    pub stage: TransferStage,
    pub percent: u8,
    pub current: Option<u64>,
    pub total: Option<u64>,
}

/// Extract phase reports from a chunk of remote sideband output
///
/// Remotes rewrite the same line with `\r`, so one chunk can hold several
/// reports; they are returned in order.
pub fn parse_sideband(data: &[u8]) -> Vec<SidebandProgress> {
    let text = String::from_utf8_lossy(data);
    text.split(['\r', '\n'])
        .filter_map(|line| {
            let caps = SIDEBAND_PROGRESS.captures(line)?;
            let stage = match &caps["stage"] {
                "Counting" => TransferStage::Counting,
                _ => TransferStage::Compressing,
            };
            Some(SidebandProgress {
                stage,
                percent: caps["pct"].parse::<u8>().ok()?.min(100),
                current: caps.name("cur").and_then(|m| m.as_str().parse().ok()),
                total: caps.name("total").and_then(|m| m.as_str().parse().ok()),
            })
        })
        .collect()
}

/// Last time any transfer callback fired, shared with the idle watchdog
#[derive(Debug)]
pub struct ActivityClock {
    base: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.base.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates libgit2 callbacks into progress events for one transfer
///
/// Lives on the blocking thread that drives the transfer; only the activity
/// clock is shared.
pub struct TransferTracker {
    reporter: ProgressReporter,
    activity: Arc<ActivityClock>,
    cancel: CancellationToken,
    last: Cell<Option<(TransferStage, u8)>>,
}

impl TransferTracker {
    pub fn new(
        reporter: ProgressReporter,
        activity: Arc<ActivityClock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reporter,
            activity,
            cancel,
            last: Cell::new(None),
        }
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish the 20% floor before any object arrives
    pub fn begin(&self, message: impl Into<String>) {
        self.activity.touch();
        self.reporter
            .progress("Connecting", TRANSFER_FLOOR, 0, None, message);
    }

    /// Handle the transfer callback; returns false to abort the transfer
    pub fn on_transfer(&self, stats: &git2::Progress<'_>) -> bool {
        self.activity.touch();
        if self.is_cancelled() {
            return false;
        }

        let total = stats.total_objects() as u64;
        let received = stats.received_objects() as u64;
        let (stage, current, total) = if total > 0 && received < total {
            (TransferStage::Receiving, received, Some(total))
        } else if stats.total_deltas() > 0 && stats.indexed_deltas() < stats.total_deltas() {
            (
                TransferStage::Resolving,
                stats.indexed_deltas() as u64,
                Some(stats.total_deltas() as u64),
            )
        } else {
            (TransferStage::Receiving, received, (total > 0).then_some(total))
        };

        self.emit(stage, current, total);
        true
    }

    /// Handle remote sideband text; returns false to abort the transfer
    pub fn on_sideband(&self, data: &[u8]) -> bool {
        self.activity.touch();
        if self.is_cancelled() {
            return false;
        }
        for report in parse_sideband(data) {
            let (current, total) = match (report.current, report.total) {
                (Some(current), Some(total)) => (current, Some(total)),
                _ => (u64::from(report.percent), Some(100)),
            };
            self.emit(report.stage, current, total);
        }
        true
    }

    /// Handle checkout progress after the objects have arrived
    pub fn on_checkout(&self, current: usize, total: usize) {
        self.activity.touch();
        let total = (total > 0).then_some(total as u64);
        self.emit(TransferStage::Writing, current as u64, total);
    }

    // Publishes only when the stage or the percentage changes
    fn emit(&self, stage: TransferStage, current: u64, total: Option<u64>) {
        let percent = transfer_percent(stage, current, total);
        if self.last.get() == Some((stage, percent)) {
            return;
        }
        self.last.set(Some((stage, percent)));

        let message = match total {
            Some(total) => format!("{}: {}/{}", stage.label(), current, total),
            None => format!("{}: {}", stage.label(), current),
        };
        self.reporter
            .progress(stage.label(), percent, current, total, message);
    }
}

/// Background task that emits one advisory when a transfer goes quiet
pub struct IdleWatchdog {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdleWatchdog {
    /// Start watching `activity`; must be called inside a tokio runtime
    pub fn spawn(
        reporter: ProgressReporter,
        activity: Arc<ActivityClock>,
        window: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                let idle = activity.idle_for();
                if idle >= window {
                    tracing::warn!(
                        "Run {}: no transfer progress for {:?}",
                        reporter.run_id(),
                        window
                    );
                    reporter.advisory(format!(
                        "No transfer progress for {} seconds, the network may be stalled",
                        window.as_secs()
                    ));
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(window - idle) => {}
                }
            }
        });

        Self { stop, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop watching; dropping the watchdog has the same effect
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for IdleWatchdog {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
