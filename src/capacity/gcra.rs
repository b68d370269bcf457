//! Generic cell rate algorithm over a single stored theoretical arrival time (TAT).
//!
//! Times are microseconds so that limits above 1000/s keep a non-zero emission interval.
//! A cell admits `n` units at `now` when `max(tat, now) + (n - 1) * emission - now <=
//! tolerance`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Gcra {
    emission_us: i64,
    tolerance_us: i64,
}

impl Gcra {
    /// Strict spacing: at most `limit + 1` admissions in any closed window of `period`.
    /// Returns `None` for an unlimited configuration.
    pub(crate) fn rate_limit(limit: i64, period_ms: i64) -> Option<Self> {
        Self::new(limit, 0, period_ms)
    }

    /// Spacing with `burst` extra cells of tolerance.
    pub(crate) fn throttle(limit: i64, burst: i64, period_ms: i64) -> Option<Self> {
        Self::new(limit, burst, period_ms)
    }

    fn new(limit: i64, burst: i64, period_ms: i64) -> Option<Self> {
        if limit <= 0 || period_ms <= 0 {
            return None;
        }
        let emission_us = (period_ms.saturating_mul(1_000) / limit).max(1);
        Some(Self {
            emission_us,
            tolerance_us: emission_us.saturating_mul(burst.max(0)),
        })
    }

    /// Units that can be admitted right now.
    pub(crate) fn capacity(&self, now_us: i64, tat_us: Option<i64>) -> i64 {
        let tat = tat_us.unwrap_or(now_us).max(now_us);
        let slack = self.tolerance_us - (tat - now_us);
        if slack < 0 {
            0
        } else {
            slack / self.emission_us + 1
        }
    }

    /// Units currently counted against the cell.
    pub(crate) fn used(&self, now_us: i64, tat_us: Option<i64>) -> i64 {
        let backlog = tat_us.unwrap_or(now_us).max(now_us) - now_us;
        (backlog + self.emission_us - 1) / self.emission_us
    }

    /// TAT after admitting `units`.
    pub(crate) fn consume(&self, now_us: i64, tat_us: Option<i64>, units: i64) -> i64 {
        tat_us.unwrap_or(now_us).max(now_us) + units.saturating_mul(self.emission_us)
    }

    /// Earliest time at which one more unit is admitted.
    pub(crate) fn retry_at_us(&self, now_us: i64, tat_us: Option<i64>) -> i64 {
        let tat = tat_us.unwrap_or(now_us).max(now_us);
        (tat - self.tolerance_us).max(now_us)
    }

    /// How long the stored TAT stays meaningful.
    pub(crate) fn ttl_ms(&self, now_us: i64, tat_us: i64) -> i64 {
        ((tat_us - now_us).max(0) / 1_000) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000;

    #[test]
    fn unlimited_configurations() {
        assert!(Gcra::rate_limit(0, 1_000).is_none());
        assert!(Gcra::throttle(5, 1, 0).is_none());
    }

    #[test]
    fn rate_limit_spaces_admissions() {
        let g = Gcra::rate_limit(5, 1_000).unwrap();
        let mut tat = None;
        let mut admitted = 0;
        // One attempt every 10ms across a closed one-second window.
        for step in 0..=100 {
            let now = step * 10_000;
            if g.capacity(now, tat) > 0 {
                tat = Some(g.consume(now, tat, 1));
                admitted += 1;
            }
        }
        assert_eq!(admitted, 6);
        assert!(admitted <= 5 + 1);
    }

    #[test]
    fn throttle_allows_burst() {
        let g = Gcra::throttle(10, 4, 1_000).unwrap();
        assert_eq!(g.capacity(0, None), 5);
        let tat = g.consume(0, None, 5);
        assert_eq!(g.capacity(0, Some(tat)), 0);
        assert_eq!(g.used(0, Some(tat)), 5);
        assert_eq!(g.retry_at_us(0, Some(tat)), SEC / 10);
        assert_eq!(g.capacity(SEC / 10, Some(tat)), 1);
    }

    #[test]
    fn stale_tat_resets() {
        let g = Gcra::rate_limit(1, 1_000).unwrap();
        assert_eq!(g.capacity(10 * SEC, Some(SEC)), 1);
        assert_eq!(g.used(10 * SEC, Some(SEC)), 0);
    }
}
