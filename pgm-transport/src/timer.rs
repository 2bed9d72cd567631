//! Timer core: one scalar next-expiry per endpoint.
//!
//! The endpoint derives its wakeup as the minimum over the ambient or
//! heartbeat SPM schedule, the earliest peer NAK-state deadline, the
//! earliest peer expiry, and any deferred repair dispatch. The socket
//! holds one [`TimerCore`]: `prepare` recomputes the scalar after every
//! service pass (and in `next_wakeup`), `check` gates timer dispatch in
//! the pump, and dispatch itself happens in the source/receiver
//! components, which is idempotent: a deadline already served simply
//! finds nothing due.

use std::time::{Duration, Instant};

/// Minimum of any number of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

/// The cached next-expiry scalar.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerCore {
    next_expiry: Option<Instant>,
}

impl TimerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes and returns the next expiry from component deadlines.
    pub fn prepare<I>(&mut self, deadlines: I) -> Option<Instant>
    where
        I: IntoIterator<Item = Option<Instant>>,
    {
        self.next_expiry = earliest(deadlines);
        self.next_expiry
    }

    /// Whether the cached expiry has passed.
    pub fn check(&self, now: Instant) -> bool {
        self.next_expiry.is_some_and(|t| t <= now)
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.next_expiry
    }
}

/// The SPM schedule: geometric heartbeats after data, decaying back to the
/// ambient interval in idle.
#[derive(Debug, Clone)]
pub struct SpmSchedule {
    ambient: Duration,
    heartbeat: Vec<Duration>,
    /// Position in the heartbeat table; `None` when ambient-only.
    pos: Option<usize>,
    next: Instant,
}

impl SpmSchedule {
    pub fn new(ambient: Duration, heartbeat: Vec<Duration>, now: Instant) -> Self {
        SpmSchedule {
            ambient,
            heartbeat,
            pos: None,
            next: now, // first SPM goes out immediately
        }
    }

    /// Data was sent: restart the heartbeat sequence.
    pub fn reset_heartbeat(&mut self, now: Instant) {
        if self.heartbeat.is_empty() {
            return;
        }
        self.pos = Some(0);
        self.next = self.next.min(now + self.heartbeat[0]);
    }

    pub fn next_expiry(&self) -> Instant {
        self.next
    }

    /// Whether an SPM is due; when it is, advances the schedule.
    pub fn fire(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        match self.pos {
            Some(i) if i + 1 < self.heartbeat.len() && self.heartbeat[i + 1] < self.ambient => {
                self.pos = Some(i + 1);
                self.next = now + self.heartbeat[i + 1];
            }
            _ => {
                self.pos = None;
                self.next = now + self.ambient;
            }
        }
        true
    }

    /// Pulls the next scheduled SPM forward to `now`; the SPMR answer
    /// fires through the schedule so the ambient cadence restarts from
    /// the answer.
    pub fn expedite(&mut self, now: Instant) {
        self.next = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_skips_none() {
        let now = Instant::now();
        let a = now + Duration::from_millis(5);
        let b = now + Duration::from_millis(2);
        assert_eq!(earliest([None, Some(a), Some(b), None]), Some(b));
        assert_eq!(earliest([None, None]), None);
    }

    #[test]
    fn heartbeat_decays_to_ambient() {
        let now = Instant::now();
        let mut spm = SpmSchedule::new(
            Duration::from_secs(30),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ],
            now,
        );
        assert!(spm.fire(now)); // initial SPM
        spm.reset_heartbeat(now);

        let mut at = spm.next_expiry();
        let mut gaps = Vec::new();
        for _ in 0..3 {
            assert!(spm.fire(at));
            gaps.push(spm.next_expiry() - at);
            at = spm.next_expiry();
        }
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn timer_core_check() {
        let now = Instant::now();
        let mut core = TimerCore::new();
        assert!(!core.check(now));
        core.prepare([Some(now + Duration::from_millis(10))]);
        assert!(!core.check(now));
        assert!(core.check(now + Duration::from_millis(10)));
    }
}
