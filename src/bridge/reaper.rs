//! Reclaims sessions that are created but never attached.
//!
//! An open SSH shell holds an authenticated connection and a process on the
//! remote host. If the browser that asked for it never opens the WebSocket
//! (closed tab, network drop), the session is closed after a grace window.
//! Attached sessions are never reaped, however idle they are.

use std::collections::HashMap;
use std::time::Duration;

use super::reactor::{Reactor, Timer, TimerKey};
use super::SessionId;

pub struct OrphanReaper {
    grace: Duration,
    pending: HashMap<SessionId, TimerKey>,
}

impl OrphanReaper {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: HashMap::new(),
        }
    }

    /// Schedule the attach deadline for `id`, replacing any earlier one.
    pub fn arm(&mut self, id: &str, reactor: &mut dyn Reactor) {
        let key = reactor.schedule_after(self.grace, Timer::Reap(id.to_string()));
        if let Some(previous) = self.pending.insert(id.to_string(), key) {
            reactor.cancel(previous);
        }
    }

    /// Drop the deadline for `id`. Returns `false` if none was pending (it
    /// already fired, or was never armed).
    pub fn cancel(&mut self, id: &str, reactor: &mut dyn Reactor) -> bool {
        match self.pending.remove(id) {
            Some(key) => {
                reactor.cancel(key);
                true
            }
            None => false,
        }
    }

    /// Claim a fired deadline. `false` for a key that was cancelled or
    /// superseded.
    pub fn fired(&mut self, id: &str, key: TimerKey) -> bool {
        if self.pending.get(id) == Some(&key) {
            self.pending.remove(id);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::FakeReactor;

    #[test]
    fn test_arm_schedules_grace_window() {
        let mut reactor = FakeReactor::default();
        let mut reaper = OrphanReaper::new(Duration::from_secs(2));
        reaper.arm("s1", &mut reactor);
        let (key, delay, timer) = reactor.timers[0].clone();
        assert_eq!(delay, Duration::from_secs(2));
        assert_eq!(timer, Timer::Reap("s1".to_string()));
        assert!(reaper.fired("s1", key));
        assert!(!reaper.fired("s1", key));
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut reactor = FakeReactor::default();
        let mut reaper = OrphanReaper::new(Duration::from_secs(2));
        reaper.arm("s1", &mut reactor);
        let key = reactor.timers[0].0;
        assert!(reaper.fired("s1", key));
        assert!(!reaper.cancel("s1", &mut reactor));
        assert!(reactor.cancelled.is_empty());
    }

    #[test]
    fn test_cancelled_key_does_not_fire() {
        let mut reactor = FakeReactor::default();
        let mut reaper = OrphanReaper::new(Duration::from_secs(2));
        reaper.arm("s1", &mut reactor);
        let key = reactor.timers[0].0;
        assert!(reaper.cancel("s1", &mut reactor));
        assert_eq!(reactor.cancelled, vec![key]);
        assert!(!reaper.fired("s1", key));
        assert!(!reaper.is_armed("s1"));
    }

    #[test]
    fn test_rearm_supersedes() {
        let mut reactor = FakeReactor::default();
        let mut reaper = OrphanReaper::new(Duration::from_secs(2));
        reaper.arm("s1", &mut reactor);
        reaper.arm("s1", &mut reactor);
        let first = reactor.timers[0].0;
        let second = reactor.timers[1].0;
        assert_eq!(reactor.cancelled, vec![first]);
        assert!(!reaper.fired("s1", first));
        assert!(reaper.fired("s1", second));
    }
}
