use std::time::Instant;

/// Exponentially decaying misbehavior score.
///
/// The score decays continuously toward zero with a configured half-life and
/// accumulates caller-assigned penalties; crossing the threshold bans the
/// connection. Decay is computed lazily from the elapsed time since the last
/// penalty, so idle connections cost nothing.
#[derive(Debug, Clone)]
pub struct BanScore {
    score: f64,
    last_penalty: Instant,
    threshold: f64,
    half_life_ms: f64,
}

impl BanScore {
    pub fn new(threshold: f64, half_life_ms: u64, now: Instant) -> Self {
        Self {
            score: 0.0,
            last_penalty: now,
            threshold,
            half_life_ms: (half_life_ms.max(1)) as f64,
        }
    }

    /// Score as of `now`, with decay applied.
    pub fn current(&self, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(self.last_penalty).as_millis() as f64;
        self.score * (0.5f64).powf(elapsed_ms / self.half_life_ms)
    }

    /// Decay, add `amount`, and report whether the threshold was crossed.
    pub fn penalize(&mut self, now: Instant, amount: f64) -> bool {
        self.score = self.current(now) + amount.max(0.0);
        self.last_penalty = now;
        self.score >= self.threshold
    }
}
