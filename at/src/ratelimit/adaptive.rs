//! Adaptive rate feedback
//!
//! Tracks an exponential moving average of fetch outcomes per domain and
//! scales the effective rate: sustained failure halves it (floor 10% of
//! configured), a sustained healthy streak raises it by 25% (ceiling at
//! the configured rate).

const FAILURE_RATIO: f64 = 0.5;
const RECOVERY_RATIO: f64 = 0.9;
const FACTOR_FLOOR: f64 = 0.1;

/// Per-domain adaptive state
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    /// EMA of success ratio
    ema: f64,
    /// Consecutive healthy outcomes
    streak: u32,
    /// Multiplier applied to the configured rate, in [FACTOR_FLOOR, 1.0]
    factor: f64,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            ema: 1.0,
            streak: 0,
            factor: 1.0,
        }
    }
}

impl AdaptiveState {
    /// Fold one outcome into the EMA and adjust the rate factor
    pub fn record(&mut self, success: bool, alpha: f64, recovery_streak: u32) {
        let sample = if success { 1.0 } else { 0.0 };
        self.ema = alpha * sample + (1.0 - alpha) * self.ema;

        if success {
            self.streak += 1;
        } else {
            self.streak = 0;
        }

        if self.ema < FAILURE_RATIO {
            self.factor = (self.factor * 0.5).max(FACTOR_FLOOR);
            self.streak = 0;
        } else if self.ema > RECOVERY_RATIO && self.streak >= recovery_streak && self.factor < 1.0 {
            self.factor = (self.factor * 1.25).min(1.0);
            self.streak = 0;
        }
    }

    /// Current multiplier on the configured rate
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Current EMA of the success ratio
    pub fn success_ratio(&self) -> f64 {
        self.ema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA: f64 = 0.3;
    const STREAK: u32 = 3;

    #[test]
    fn test_starts_at_full_rate() {
        let state = AdaptiveState::default();
        assert_eq!(state.factor(), 1.0);
        assert_eq!(state.success_ratio(), 1.0);
    }

    #[test]
    fn test_failures_halve_factor() {
        let mut state = AdaptiveState::default();
        for _ in 0..10 {
            state.record(false, ALPHA, STREAK);
        }
        assert!(state.success_ratio() < 0.5);
        assert!(state.factor() < 1.0);
    }

    #[test]
    fn test_factor_floors_at_ten_percent() {
        let mut state = AdaptiveState::default();
        for _ in 0..100 {
            state.record(false, ALPHA, STREAK);
        }
        assert!((state.factor() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recovery_needs_streak() {
        let mut state = AdaptiveState::default();
        for _ in 0..20 {
            state.record(false, ALPHA, STREAK);
        }
        let degraded = state.factor();

        // Two successes: EMA still low or streak short, no raise yet
        state.record(true, ALPHA, STREAK);
        state.record(true, ALPHA, STREAK);
        assert_eq!(state.factor(), degraded);

        // Enough successes to push the EMA above 0.9 and complete streaks
        for _ in 0..30 {
            state.record(true, ALPHA, STREAK);
        }
        assert!(state.factor() > degraded);
    }

    #[test]
    fn test_factor_ceils_at_configured() {
        let mut state = AdaptiveState::default();
        for _ in 0..200 {
            state.record(true, ALPHA, STREAK);
        }
        assert_eq!(state.factor(), 1.0);
    }
}
