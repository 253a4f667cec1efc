//! Sliding-window restart budget: admits up to a fixed number of restart
//! attempts within a trailing time window before giving up. Same
//! prune-then-check-capacity shape as a sliding-window rate limiter or
//! circuit breaker's failure accounting, adapted to "admit N crashes per
//! window before going terminal."

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RestartBudget {
    max_attempts: u32,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: VecDeque::new(),
        }
    }

    /// Record an attempt if the budget allows it. Returns `true` if the
    /// attempt was admitted (and should proceed), `false` if the window is
    /// exhausted.
    pub fn try_consume(&mut self) -> bool {
        self.prune();
        if self.attempts.len() >= self.max_attempts as usize {
            return false;
        }
        self.attempts.push_back(Instant::now());
        true
    }

    fn prune(&mut self) {
        let cutoff = Instant::now()
            .checked_sub(self.window)
            .unwrap_or_else(Instant::now);
        while matches!(self.attempts.front(), Some(t) if *t < cutoff) {
            self.attempts.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_attempts() {
        let mut budget = RestartBudget::new(3, Duration::from_secs(60));
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
    }

    #[test]
    fn prunes_attempts_outside_the_window() {
        let mut budget = RestartBudget::new(1, Duration::from_millis(20));
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        std::thread::sleep(Duration::from_millis(30));
        assert!(budget.try_consume());
    }
}
