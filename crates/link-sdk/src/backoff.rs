//! Reconnect policy: exponential backoff with a ceiling, plus an
//! independent give-up budget.
//!
//! The two counters deliberately do not share reset semantics: the delay
//! resets to its floor on any successful open, while the budget resets
//! only on a forced reconnect (or an explicit `connect()` issued after
//! exhaustion).

use std::time::{Duration, Instant};

/// Controls how the link reconnects after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect attempt; the doubling floor.
    pub floor: Duration,
    /// Maximum delay between attempts.
    pub ceiling: Duration,
    /// Consecutive attempts before giving up. `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectGate {
    /// Issued within the minimum reconnect wait of the previous attempt.
    /// Carries the wait left before an attempt will be admitted.
    TooSoon { retry_in: Duration },
    /// The give-up budget is spent.
    Exhausted,
}

/// Live reconnect state owned by the manager.
#[derive(Debug)]
pub(crate) struct ReconnectState {
    policy: ReconnectBackoff,
    current_delay: Duration,
    attempts_used: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectState {
    pub(crate) fn new(policy: ReconnectBackoff) -> Self {
        let current_delay = policy.floor;
        Self {
            policy,
            current_delay,
            attempts_used: 0,
            last_attempt: None,
        }
    }

    /// The delay a clean close schedules with: current value, no doubling.
    pub(crate) fn peek_delay(&self) -> Duration {
        self.current_delay
    }

    /// Delay to schedule after a failure. Returns the current value and
    /// doubles it for the next consecutive failure, capped at the ceiling.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.policy.ceiling);
        delay
    }

    /// A transport opened: the delay falls back to the floor.
    pub(crate) fn on_success(&mut self) {
        self.current_delay = self.policy.floor;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.attempts_used >= self.policy.max_attempts
    }

    pub(crate) fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// Forced reconnects (and explicit `connect()` after give-up) start a
    /// fresh budget.
    pub(crate) fn reset_budget(&mut self) {
        self.attempts_used = 0;
    }

    /// Gate and record one connection attempt. `min_wait` is the thrash
    /// guard; `bypass_guards` is set for forced reconnects.
    pub(crate) fn begin_attempt(
        &mut self,
        now: Instant,
        min_wait: Duration,
        bypass_guards: bool,
    ) -> Result<u32, ConnectGate> {
        if !bypass_guards {
            if self.exhausted() {
                return Err(ConnectGate::Exhausted);
            }
            if let Some(last) = self.last_attempt {
                let elapsed = now.duration_since(last);
                if elapsed < min_wait {
                    return Err(ConnectGate::TooSoon {
                        retry_in: min_wait - elapsed,
                    });
                }
            }
        }
        self.attempts_used += 1;
        self.last_attempt = Some(now);
        Ok(self.attempts_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ReconnectState {
        ReconnectState::new(ReconnectBackoff::default())
    }

    #[test]
    fn delay_doubles_per_consecutive_failure() {
        let mut s = state();
        assert_eq!(s.next_delay(), Duration::from_secs(1));
        assert_eq!(s.next_delay(), Duration::from_secs(2));
        assert_eq!(s.next_delay(), Duration::from_secs(4));
        assert_eq!(s.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped_at_ceiling() {
        let mut s = state();
        let mut last = Duration::ZERO;
        for _ in 0..12 {
            last = s.next_delay();
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn nth_failure_matches_closed_form() {
        // After the Nth consecutive failure: min(floor * 2^(N-1), ceiling).
        let mut s = state();
        for n in 1u32..=10 {
            let expect = Duration::from_secs(1 << (n - 1)).min(Duration::from_secs(30));
            assert_eq!(s.next_delay(), expect, "failure {n}");
        }
    }

    #[test]
    fn success_resets_delay_to_floor() {
        let mut s = state();
        s.next_delay();
        s.next_delay();
        s.on_success();
        assert_eq!(s.peek_delay(), Duration::from_secs(1));
    }

    #[test]
    fn clean_close_peeks_without_doubling() {
        let mut s = state();
        s.next_delay(); // current is now 2s
        assert_eq!(s.peek_delay(), Duration::from_secs(2));
        assert_eq!(s.peek_delay(), Duration::from_secs(2));
    }

    #[test]
    fn budget_exhausts_independently_of_delay() {
        let mut s = ReconnectState::new(ReconnectBackoff {
            max_attempts: 3,
            ..Default::default()
        });
        let now = Instant::now();
        for i in 1..=3 {
            let used = s
                .begin_attempt(now + Duration::from_secs(i * 10), Duration::from_secs(1), false)
                .unwrap();
            assert_eq!(used, i as u32);
        }
        assert!(s.exhausted());
        assert_eq!(
            s.begin_attempt(now + Duration::from_secs(100), Duration::from_secs(1), false),
            Err(ConnectGate::Exhausted)
        );
        // A successful open resets the delay but never the budget.
        s.on_success();
        assert!(s.exhausted());
    }

    #[test]
    fn budget_reset_reopens_the_gate() {
        let mut s = ReconnectState::new(ReconnectBackoff {
            max_attempts: 1,
            ..Default::default()
        });
        let now = Instant::now();
        s.begin_attempt(now, Duration::ZERO, false).unwrap();
        assert!(s.exhausted());
        s.reset_budget();
        assert_eq!(s.attempts_used(), 0);
        assert!(s
            .begin_attempt(now + Duration::from_secs(1), Duration::ZERO, false)
            .is_ok());
    }

    #[test]
    fn min_wait_guard_rejects_thrashing() {
        let mut s = state();
        let now = Instant::now();
        s.begin_attempt(now, Duration::from_secs(1), false).unwrap();
        assert_eq!(
            s.begin_attempt(now + Duration::from_millis(200), Duration::from_secs(1), false),
            Err(ConnectGate::TooSoon {
                retry_in: Duration::from_millis(800)
            })
        );
        assert!(s
            .begin_attempt(now + Duration::from_secs(2), Duration::from_secs(1), false)
            .is_ok());
    }

    #[test]
    fn gated_attempt_is_admitted_after_the_reported_wait() {
        // A backoff floor shorter than the thrash guard must reschedule,
        // not strand the reconnect.
        let mut s = ReconnectState::new(ReconnectBackoff {
            floor: Duration::from_millis(100),
            ..Default::default()
        });
        let now = Instant::now();
        s.begin_attempt(now, Duration::from_secs(1), false).unwrap();
        let gated = s.begin_attempt(now + Duration::from_millis(100), Duration::from_secs(1), false);
        let Err(ConnectGate::TooSoon { retry_in }) = gated else {
            panic!("expected the thrash guard to gate, got {gated:?}");
        };
        assert_eq!(retry_in, Duration::from_millis(900));
        assert!(s
            .begin_attempt(now + Duration::from_millis(100) + retry_in, Duration::from_secs(1), false)
            .is_ok());
    }

    #[test]
    fn forced_attempt_bypasses_guards() {
        let mut s = ReconnectState::new(ReconnectBackoff {
            max_attempts: 1,
            ..Default::default()
        });
        let now = Instant::now();
        s.begin_attempt(now, Duration::from_secs(1), false).unwrap();
        // Exhausted and within min-wait, but forced goes through.
        assert!(s.begin_attempt(now, Duration::from_secs(1), true).is_ok());
    }

    #[test]
    fn zero_max_attempts_never_exhausts() {
        let mut s = ReconnectState::new(ReconnectBackoff {
            max_attempts: 0,
            ..Default::default()
        });
        let now = Instant::now();
        for i in 0..1000u64 {
            s.begin_attempt(now + Duration::from_secs(i), Duration::ZERO, false)
                .unwrap();
        }
        assert!(!s.exhausted());
    }
}
