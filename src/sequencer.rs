//! The EventID-ordered release buffer in front of the processor.
//!
//! Events may arrive in any order; the sequencer holds them in a min-heap
//! keyed by event id and only hands out the next id in sequence. Anything at
//! or below the release boundary is a duplicate or a replay and is dropped.
//! Gaps persist until the missing id arrives; the buffer is unbounded.

use crate::events::Event;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Heap entry ordered by event id only.
#[derive(Debug)]
struct Pending(Event);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.event_id() == other.0.event_id()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.event_id().cmp(&other.0.event_id())
    }
}

#[derive(Debug, Default)]
pub struct Sequencer {
    pending: BinaryHeap<Reverse<Pending>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered events (duplicates included until drained).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffer an event for release.
    pub fn push(&mut self, event: Event) {
        self.pending.push(Reverse(Pending(event)));
    }

    /// Pop the next releasable event given the current release boundary.
    ///
    /// Discards everything with `id <= last_released` first, then yields the
    /// event with `id == last_released + 1` if it is buffered. The caller
    /// re-reads the boundary after each successful apply, so a contiguous run
    /// drains one event per call.
    pub fn next_ready(&mut self, last_released: i64) -> Option<Event> {
        loop {
            let top_id = self.pending.peek().map(|Reverse(Pending(e))| e.event_id())?;
            if top_id <= last_released {
                // Duplicate or replayed id, silently absorbed.
                if let Some(Reverse(Pending(event))) = self.pending.pop() {
                    tracing::debug!(event_id = event.event_id(), "dropping duplicate event");
                }
                continue;
            }
            if top_id == last_released + 1 {
                return self.pending.pop().map(|Reverse(Pending(event))| event);
            }
            // Gap still open; hold everything.
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FxEvent;
    use rust_decimal::Decimal;

    fn fx(event_id: i64) -> Event {
        Event::Fx(FxEvent {
            event_id,
            ccy: "JPX".to_string(),
            rate: Decimal::from(135),
        })
    }

    /// Drain the sequencer the way the intake loop does, pretending every
    /// released event applies successfully.
    fn drain(seq: &mut Sequencer, mut last_released: i64) -> (Vec<i64>, i64) {
        let mut released = Vec::new();
        while let Some(event) = seq.next_ready(last_released) {
            last_released = event.event_id();
            released.push(last_released);
        }
        (released, last_released)
    }

    #[test]
    fn releases_contiguous_prefix_in_order() {
        let mut seq = Sequencer::new();
        for id in [1, 2, 3] {
            seq.push(fx(id));
        }
        let (released, last) = drain(&mut seq, 0);
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(last, 3);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn buffers_until_gap_closes() {
        let mut seq = Sequencer::new();
        let mut last = 0;

        for id in [1, 3] {
            seq.push(fx(id));
        }
        let (released, new_last) = drain(&mut seq, last);
        assert_eq!(released, vec![1]);
        last = new_last;
        assert_eq!(seq.pending_len(), 1);

        // Admitting 2 releases both 2 and the buffered 3.
        seq.push(fx(2));
        let (released, new_last) = drain(&mut seq, last);
        assert_eq!(released, vec![2, 3]);
        assert_eq!(new_last, 3);
    }

    #[test]
    fn out_of_order_admission_releases_everything() {
        let mut seq = Sequencer::new();
        let mut last = 0;
        let mut all_released = Vec::new();

        for id in [1, 3, 2, 6, 5, 4] {
            seq.push(fx(id));
            let (released, new_last) = drain(&mut seq, last);
            all_released.extend(released);
            last = new_last;
        }

        assert_eq!(all_released, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(last, 6);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn duplicates_are_silently_absorbed() {
        let mut seq = Sequencer::new();

        seq.push(fx(1));
        let (released, last) = drain(&mut seq, 0);
        assert_eq!(released, vec![1]);

        // Redelivery of an applied id, plus a duplicate of a buffered one.
        seq.push(fx(1));
        seq.push(fx(3));
        seq.push(fx(3));
        let (released, last) = drain(&mut seq, last);
        assert_eq!(released, Vec::<i64>::new());
        assert_eq!(last, 1);

        seq.push(fx(2));
        let (released, last) = drain(&mut seq, last);
        assert_eq!(released, vec![2, 3]);
        assert_eq!(last, 3);
        assert_eq!(seq.pending_len(), 0, "second copy of 3 must be discarded");
    }

    #[test]
    fn failed_apply_keeps_the_gap_open() {
        let mut seq = Sequencer::new();
        seq.push(fx(1));
        seq.push(fx(2));

        // Caller pops 1 but the apply fails: the boundary stays at 0 and the
        // event is gone from the buffer. 2 stays parked behind the gap.
        let popped = seq.next_ready(0).unwrap();
        assert_eq!(popped.event_id(), 1);
        assert!(seq.next_ready(0).is_none());
        assert_eq!(seq.pending_len(), 1);

        // Redelivery of 1 closes the gap again.
        seq.push(fx(1));
        let (released, last) = drain(&mut seq, 0);
        assert_eq!(released, vec![1, 2]);
        assert_eq!(last, 2);
    }
}
