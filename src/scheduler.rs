//! Per-output repaint scheduling.
//!
//! Each output runs the cycle `NotScheduled -> BeginFromIdle ->
//! AwaitingCompletion -> Scheduled -> (commit) AwaitingCompletion`.
//! Entering from idle takes a zero-delay hop through
//! `AwaitingCompletion` so the first frame reuses the same
//! finish-frame path as every later one. Deadlines are absolute
//! monotonic nanoseconds; the engine owns a single timer armed at the
//! minimum deadline across outputs.

use tracing::trace;

use crate::error::{Error, Result};
use crate::registry::OutputIdx;

/// Monotonic clock reading in nanoseconds.
pub type Nanos = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepaintStatus {
    #[default]
    NotScheduled,
    /// Repaint requested while idle; waiting for the zero-delay hop.
    BeginFromIdle,
    /// Next repaint planned at an absolute deadline.
    Scheduled { due: Nanos },
    /// A commit is in flight; waiting for its page-flip event.
    AwaitingCompletion,
}

#[derive(Debug, Default)]
struct Slot {
    status: RepaintStatus,
}

#[derive(Debug, Default)]
pub struct RepaintScheduler {
    slots: Vec<Slot>,
}

impl RepaintScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, idx: OutputIdx) -> &mut Slot {
        if idx.0 >= self.slots.len() {
            self.slots.resize_with(idx.0 + 1, Slot::default);
        }
        &mut self.slots[idx.0]
    }

    pub fn status(&self, idx: OutputIdx) -> RepaintStatus {
        self.slots.get(idx.0).map(|s| s.status).unwrap_or_default()
    }

    /// Notes a repaint request. Returns true when the caller must arm
    /// an immediate wake to run the idle hop; every other state
    /// already has a wake planned.
    pub fn request(&mut self, idx: OutputIdx) -> bool {
        let slot = self.slot_mut(idx);
        match slot.status {
            RepaintStatus::NotScheduled => {
                slot.status = RepaintStatus::BeginFromIdle;
                trace!(output = idx.0, "repaint loop starting from idle");
                true
            }
            _ => false,
        }
    }

    /// Takes the idle hop: the output now behaves as if a frame just
    /// completed, and the caller feeds it a timestamp via
    /// [`finish_frame`](Self::finish_frame).
    pub fn begin_from_idle(&mut self, idx: OutputIdx) -> bool {
        let slot = self.slot_mut(idx);
        if slot.status == RepaintStatus::BeginFromIdle {
            slot.status = RepaintStatus::AwaitingCompletion;
            true
        } else {
            false
        }
    }

    /// Plans the next repaint after a completion with vblank timestamp
    /// `stamp`. The deadline is one refresh interval past the vblank,
    /// clamped to `now` when the clock jumped past it.
    pub fn finish_frame(
        &mut self,
        idx: OutputIdx,
        stamp: Nanos,
        now: Nanos,
        interval: Nanos,
    ) -> Result<Nanos> {
        let slot = self.slot_mut(idx);
        if slot.status != RepaintStatus::AwaitingCompletion {
            return Err(Error::Invariant("finish_frame without a commit in flight"));
        }
        let mut due = stamp.saturating_add(interval);
        if due < now {
            trace!(output = idx.0, due, now, "repaint deadline in the past, clamping");
            due = now;
        }
        slot.status = RepaintStatus::Scheduled { due };
        Ok(due)
    }

    /// Variant of [`finish_frame`](Self::finish_frame) for the idle
    /// hop, where no vblank timestamp exists yet: the repaint is due
    /// immediately.
    pub fn finish_frame_now(&mut self, idx: OutputIdx, now: Nanos) -> Result<Nanos> {
        let slot = self.slot_mut(idx);
        if slot.status != RepaintStatus::AwaitingCompletion {
            return Err(Error::Invariant("finish_frame without a commit in flight"));
        }
        slot.status = RepaintStatus::Scheduled { due: now };
        Ok(now)
    }

    /// Marks the output's commit as submitted.
    pub fn commit_in_flight(&mut self, idx: OutputIdx) -> Result<()> {
        let slot = self.slot_mut(idx);
        match slot.status {
            RepaintStatus::Scheduled { .. } => {
                slot.status = RepaintStatus::AwaitingCompletion;
                Ok(())
            }
            _ => Err(Error::Invariant("commit outside a scheduled repaint")),
        }
    }

    /// Pushes a scheduled repaint out to a later deadline, for commits
    /// the device refused transiently.
    pub fn defer(&mut self, idx: OutputIdx, due: Nanos) {
        let slot = self.slot_mut(idx);
        if matches!(slot.status, RepaintStatus::Scheduled { .. }) {
            slot.status = RepaintStatus::Scheduled { due };
        }
    }

    /// Returns the output to idle: nothing to draw, output disabled,
    /// or an unrecoverable commit failure.
    pub fn idle(&mut self, idx: OutputIdx) {
        self.slot_mut(idx).status = RepaintStatus::NotScheduled;
    }

    /// Outputs whose repaint deadline has passed.
    pub fn due_outputs(&self, now: Nanos) -> Vec<OutputIdx> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s.status {
                RepaintStatus::Scheduled { due } if due <= now => Some(OutputIdx(i)),
                _ => None,
            })
            .collect()
    }

    /// Outputs waiting on the idle hop.
    pub fn idle_hops(&self) -> Vec<OutputIdx> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| (s.status == RepaintStatus::BeginFromIdle).then_some(OutputIdx(i)))
            .collect()
    }

    /// Earliest wake the scheduler needs, if any. `BeginFromIdle`
    /// counts as due immediately.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.slots
            .iter()
            .filter_map(|s| match s.status {
                RepaintStatus::Scheduled { due } => Some(due),
                RepaintStatus::BeginFromIdle => Some(0),
                _ => None,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Nanos = 16_666_667;

    #[test]
    fn first_request_arms_immediate_wake_and_coalesces() {
        let mut sched = RepaintScheduler::new();
        assert!(sched.request(OutputIdx(0)));
        assert!(!sched.request(OutputIdx(0)));
        assert!(!sched.request(OutputIdx(0)));
        assert_eq!(sched.status(OutputIdx(0)), RepaintStatus::BeginFromIdle);
        assert_eq!(sched.next_deadline(), Some(0));
    }

    #[test]
    fn idle_hop_then_finish_frame_schedules_one_interval_out() {
        let mut sched = RepaintScheduler::new();
        sched.request(OutputIdx(0));
        assert!(sched.begin_from_idle(OutputIdx(0)));
        assert!(!sched.begin_from_idle(OutputIdx(0)));
        let due = sched.finish_frame(OutputIdx(0), 1_000_000, 1_100_000, INTERVAL).unwrap();
        assert_eq!(due, 1_000_000 + INTERVAL);
        assert_eq!(sched.status(OutputIdx(0)), RepaintStatus::Scheduled { due });
        assert!(sched.due_outputs(due - 1).is_empty());
        assert_eq!(sched.due_outputs(due), vec![OutputIdx(0)]);
    }

    #[test]
    fn stale_vblank_stamp_clamps_to_now() {
        let mut sched = RepaintScheduler::new();
        sched.request(OutputIdx(0));
        sched.begin_from_idle(OutputIdx(0));
        // Clock jumped: the stamp plus one interval is still in the past.
        let now = 10 * INTERVAL;
        let due = sched.finish_frame(OutputIdx(0), 0, now, INTERVAL).unwrap();
        assert_eq!(due, now);
    }

    #[test]
    fn commit_transitions_to_awaiting_completion() {
        let mut sched = RepaintScheduler::new();
        sched.request(OutputIdx(0));
        sched.begin_from_idle(OutputIdx(0));
        sched.finish_frame(OutputIdx(0), 0, 0, INTERVAL).unwrap();
        sched.commit_in_flight(OutputIdx(0)).unwrap();
        assert_eq!(sched.status(OutputIdx(0)), RepaintStatus::AwaitingCompletion);
        assert!(sched.next_deadline().is_none());
        // A second submit without completion is a bug.
        assert!(sched.commit_in_flight(OutputIdx(0)).is_err());
    }

    #[test]
    fn finish_frame_requires_an_in_flight_commit() {
        let mut sched = RepaintScheduler::new();
        assert!(sched.finish_frame(OutputIdx(0), 0, 0, INTERVAL).is_err());
    }

    #[test]
    fn deadline_is_minimum_across_outputs() {
        let mut sched = RepaintScheduler::new();
        for idx in [OutputIdx(0), OutputIdx(1)] {
            sched.request(idx);
            sched.begin_from_idle(idx);
        }
        sched.finish_frame(OutputIdx(0), 2_000_000, 0, INTERVAL).unwrap();
        sched.finish_frame(OutputIdx(1), 1_000_000, 0, INTERVAL).unwrap();
        assert_eq!(sched.next_deadline(), Some(1_000_000 + INTERVAL));
        sched.idle(OutputIdx(1));
        assert_eq!(sched.next_deadline(), Some(2_000_000 + INTERVAL));
    }
}
