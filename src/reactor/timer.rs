//! Deadline queue driving the reactor's poll timeout.
//!
//! Timers are armed against `Instant` deadlines and drained after each
//! poll wakeup. Cancellation is O(1): the entry table forgets the id and
//! the heap entry becomes a tombstone skipped on pop. Ids are allocated
//! from a monotonic counter so a cancelled id can never alias a newer
//! timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Stable handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Idle keep-alive check for the connection at this registry token.
    ConnIdle(usize),
    /// Timeout check for the suspended command with this id.
    CmdTimeout(u64),
    /// Periodic housekeeping tick.
    Housekeeping,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerKind>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer at `deadline`.
    pub fn arm(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, kind);
        self.heap.push(Reverse((deadline, id)));
        TimerId(id)
    }

    /// Cancel an armed timer. Cancelling twice, or cancelling an already
    /// fired timer, is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id.0);
    }

    /// Number of live (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Poll timeout until the earliest live deadline.
    ///
    /// `None` means no timer is armed and the poll may block forever;
    /// a zero duration means a timer is already due.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let Reverse((deadline, id)) = *self.heap.peek()?;
            if !self.entries.contains_key(&id) {
                self.heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
    }

    /// Take the next timer whose deadline has passed, skipping tombstones.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerKind)> {
        loop {
            let Reverse((deadline, id)) = *self.heap.peek()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(kind) = self.entries.remove(&id) {
                return Some((TimerId(id), kind));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();

        timers.arm(now + Duration::from_millis(20), TimerKind::Housekeeping);
        timers.arm(now + Duration::from_millis(10), TimerKind::ConnIdle(3));

        let later = now + Duration::from_millis(30);
        assert!(matches!(
            timers.pop_expired(later),
            Some((_, TimerKind::ConnIdle(3)))
        ));
        assert!(matches!(
            timers.pop_expired(later),
            Some((_, TimerKind::Housekeeping))
        ));
        assert!(timers.pop_expired(later).is_none());
    }

    #[test]
    fn test_not_due_yet() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(now + Duration::from_secs(5), TimerKind::CmdTimeout(1));

        assert!(timers.pop_expired(now).is_none());
        let timeout = timers.next_timeout(now).unwrap();
        assert!(timeout > Duration::from_secs(4));
    }

    #[test]
    fn test_cancel_tombstones() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();

        let id = timers.arm(now + Duration::from_millis(1), TimerKind::ConnIdle(0));
        let _keep = timers.arm(now + Duration::from_millis(2), TimerKind::ConnIdle(1));
        timers.cancel(id);
        assert_eq!(timers.len(), 1);

        // The cancelled entry is skipped both for timeout computation
        // and when draining.
        let later = now + Duration::from_millis(5);
        assert!(matches!(
            timers.pop_expired(later),
            Some((_, TimerKind::ConnIdle(1)))
        ));
        assert!(timers.pop_expired(later).is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_no_timers_blocks_forever() {
        let mut timers = TimerQueue::new();
        assert!(timers.next_timeout(Instant::now()).is_none());
    }
}
