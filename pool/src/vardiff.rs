use std::time::Instant;

/// Deviation from the ideal window (ms) that does not trigger a retarget.
const HYSTERESIS_MS: f64 = 5_000.0;
/// A single step never acts on a window more than 4x off target either way.
const CLAMP_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct RetargetConfig {
    /// Desired accepted shares per minute.
    pub shares_per_minute: u64,
    /// Pool/network difficulty ceiling.
    pub cap_difficulty: u64,
}

/// Per-connection vardiff window.
///
/// Only every `shares_per_minute`-th accepted submission is a retarget
/// decision point. The counter and clock reset exclusively when a job is
/// sent (`reset`), so consecutive in-band decision points keep measuring the
/// same window since the last job delivery.
#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: RetargetConfig,
    submissions: u64,
    last_retarget: Instant,
}

impl VarDiffState {
    pub fn new(cfg: RetargetConfig) -> Self {
        Self {
            cfg,
            submissions: 0,
            last_retarget: Instant::now(),
        }
    }

    /// Called when a job is delivered: the miner starts it under its final
    /// effective difficulty, so the measurement window starts here too.
    pub fn reset(&mut self, now: Instant) {
        self.submissions = 0;
        self.last_retarget = now;
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Record one accepted submission.
    ///
    /// Returns `Some(new_difficulty)` when a retarget decision lands outside
    /// the hysteresis band and the clamped result differs from the current
    /// difficulty. The caller stages the value; it is applied on the next
    /// job send.
    pub fn on_submission(&mut self, now: Instant, current_difficulty: u64) -> Option<u64> {
        self.submissions += 1;
        let pm = self.cfg.shares_per_minute.max(1);
        if self.submissions % pm != 0 {
            return None;
        }

        let target_ms = (self.submissions as f64 / pm as f64) * 60_000.0;
        let elapsed_ms = now.saturating_duration_since(self.last_retarget).as_millis() as f64;
        let actual_ms = elapsed_ms.clamp(target_ms / CLAMP_FACTOR, target_ms * CLAMP_FACTOR);

        if (target_ms - actual_ms).abs() <= HYSTERESIS_MS {
            return None;
        }

        let cur = current_difficulty.max(1) as f64;
        let next = (cur * target_ms / actual_ms).round();
        let next = if next.is_finite() && next >= 1.0 {
            next as u64
        } else {
            1
        };
        let next = next.clamp(1, self.cfg.cap_difficulty.max(1));

        if next == current_difficulty {
            None
        } else {
            Some(next)
        }
    }
}
