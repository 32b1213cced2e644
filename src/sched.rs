// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! The radio schedule.
//!
//! A time-ordered set of windows, at most one of which may own the radio
//! at any instant. Items carry no callbacks: each one names its state
//! machine through [`SchedKind`] and the controller dispatches on that
//! when the window opens, returning a [`SchedState`] token that says
//! whether the radio is still busy or the next item may be considered.
//!
//! Inserting an item whose window overlaps a committed one fails; the
//! caller either drops the attempt or calls [`Scheduler::reschedule`],
//! which slides the window forward in `step` increments until it fits.
//! Inserting an item whose start has already passed still succeeds; the
//! dispatcher is responsible for counting the late start and aborting
//! that one operation cleanly.

use heapless::Vec;

use crate::config::SCHED_ITEMS;
use crate::error::Status;
use crate::time::{Duration, Instant};

/// Which state machine a schedule item belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedKind {
    Advertising,
    Scan,
    Connection { handle: u16 },
}

/// One committed radio window.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SchedItem {
    pub kind: SchedKind,
    pub start: Instant,
    /// Upper bound on the on-air time, turnaround included.
    pub end: Instant,
}

/// Token returned by a dispatched item's handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    /// The radio operation is running; do not advance the schedule.
    Running,
    /// The window produced no radio work; the next item may run.
    Done,
}

pub struct Scheduler {
    items: Vec<SchedItem, SCHED_ITEMS>,
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    fn overlaps(&self, start: Instant, end: Instant) -> bool {
        self.items
            .iter()
            .any(|it| start.is_before(it.end) && it.start.is_before(end))
    }

    /// Insert keeping start-time order. Fails on window overlap or a full
    /// table.
    pub fn insert(&mut self, item: SchedItem) -> Result<(), Status> {
        if item.end.is_before(item.start) || item.start == item.end {
            return Err(Status::InvalidHciParams);
        }
        if self.overlaps(item.start, item.end) {
            return Err(Status::ControllerBusy);
        }
        let idx = self
            .items
            .iter()
            .position(|it| item.start.is_before(it.start))
            .unwrap_or(self.items.len());
        self.items
            .insert(idx, item)
            .map_err(|_| Status::MemCapacityExceeded)
    }

    /// Remove every item of `kind`. Idempotent: removing an absent or
    /// already-fired item is not an error.
    pub fn remove(&mut self, kind: SchedKind) {
        self.items.retain(|it| it.kind != kind);
    }

    /// Slide `item` forward in `step` increments until it fits, giving up
    /// once the start has moved past `start + horizon`. Returns the start
    /// the item was committed at.
    pub fn reschedule(
        &mut self,
        mut item: SchedItem,
        step: Duration,
        horizon: Duration,
    ) -> Result<Instant, Status> {
        let give_up = item.start.wrapping_add(horizon);
        loop {
            match self.insert(item) {
                Ok(()) => return Ok(item.start),
                Err(Status::ControllerBusy) => {
                    item.start = item.start.wrapping_add(step);
                    item.end = item.end.wrapping_add(step);
                    if give_up.is_before(item.start) {
                        return Err(Status::ControllerBusy);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop the earliest item if its window has opened.
    pub fn pop_due(&mut self, now: Instant) -> Option<SchedItem> {
        let due = self
            .items
            .first()
            .is_some_and(|it| now.is_at_or_after(it.start));
        if due {
            Some(self.items.remove(0))
        } else {
            None
        }
    }

    /// Start time of the earliest committed item, for re-arming the alarm.
    pub fn next_start(&self) -> Option<Instant> {
        self.items.first().map(|it| it.start)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(kind: SchedKind, start: u32, end: u32) -> SchedItem {
        SchedItem {
            kind,
            start: Instant::from_micros(start),
            end: Instant::from_micros(end),
        }
    }

    const ADV: SchedKind = SchedKind::Advertising;
    const CONN0: SchedKind = SchedKind::Connection { handle: 1 };

    #[test]
    fn keeps_start_order() {
        let mut s = Scheduler::new();
        s.insert(item(CONN0, 2000, 3000)).unwrap();
        s.insert(item(ADV, 0, 1000)).unwrap();
        assert_eq!(s.next_start(), Some(Instant::from_micros(0)));
        let first = s.pop_due(Instant::from_micros(0)).unwrap();
        assert_eq!(first.kind, ADV);
    }

    #[test]
    fn rejects_overlap() {
        let mut s = Scheduler::new();
        s.insert(item(ADV, 1000, 2000)).unwrap();
        assert_eq!(
            s.insert(item(CONN0, 1500, 2500)).unwrap_err(),
            Status::ControllerBusy
        );
        // Adjacent windows are fine.
        s.insert(item(CONN0, 2000, 2500)).unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let mut s = Scheduler::new();
        s.insert(item(ADV, 0, 100)).unwrap();
        s.remove(ADV);
        s.remove(ADV);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn reschedule_slides_past_conflicts() {
        let mut s = Scheduler::new();
        s.insert(item(CONN0, 0, 5000)).unwrap();
        let start = s
            .reschedule(
                item(ADV, 0, 1000),
                Duration::from_micros(1000),
                Duration::from_micros(10_000),
            )
            .unwrap();
        assert_eq!(start, Instant::from_micros(5000));
    }

    #[test]
    fn reschedule_gives_up_past_horizon() {
        let mut s = Scheduler::new();
        s.insert(item(CONN0, 0, 100_000)).unwrap();
        let err = s
            .reschedule(
                item(ADV, 0, 1000),
                Duration::from_micros(1000),
                Duration::from_micros(10_000),
            )
            .unwrap_err();
        assert_eq!(err, Status::ControllerBusy);
    }

    #[test]
    fn pop_due_respects_time() {
        let mut s = Scheduler::new();
        s.insert(item(ADV, 1000, 2000)).unwrap();
        assert!(s.pop_due(Instant::from_micros(999)).is_none());
        assert!(s.pop_due(Instant::from_micros(1000)).is_some());
        assert!(s.pop_due(Instant::from_micros(1000)).is_none());
    }

    #[test]
    fn past_start_still_inserts() {
        let mut s = Scheduler::new();
        // A start behind `now` is committed; dispatch handles the miss.
        s.insert(item(ADV, 10, 500)).unwrap();
        assert!(s.pop_due(Instant::from_micros(400)).is_some());
    }
}
