//! The ordering machinery backing [`super::TimerManager`]'s heap.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::Shared;

/// A heap entry. Carries the `generation` the entry was pushed at so that a
/// stale entry left behind by `refresh`/`reset` (which push a fresh entry
/// rather than mutate this one in place, since a `BinaryHeap` can't reorder
/// on mutation) can be recognized and discarded instead of misfiring.
pub(super) struct HeapEntry {
    pub(super) deadline: Instant,
    pub(super) id: u64,
    pub(super) generation: u64,
    pub(super) shared: Arc<Shared>,
}

impl HeapEntry {
    /// True once this entry no longer represents the timer's live schedule:
    /// it was canceled, already fired, or superseded by a later
    /// `refresh`/`reset` generation.
    pub(super) fn is_stale(&self) -> bool {
        self.shared.is_canceled() || self.shared.is_fired() || self.shared.generation() != self.generation
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so a `BinaryHeap<HeapEntry>` (a max-heap) surfaces the
    // earliest deadline first; ties broken by id for a total order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Shared;
    use proptest::prelude::*;
    use std::collections::BinaryHeap;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Mutex;

    fn entry(offset_ms: u64, id: u64, base: Instant) -> HeapEntry {
        let shared = Arc::new(Shared {
            id,
            callback: Mutex::new(Box::new(|| {})),
            deadline: Mutex::new(base + std::time::Duration::from_millis(offset_ms)),
            period: Mutex::new(std::time::Duration::ZERO),
            canceled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        HeapEntry {
            deadline: base + std::time::Duration::from_millis(offset_ms),
            id,
            generation: 0,
            shared,
        }
    }

    proptest! {
        /// Popping a `BinaryHeap<HeapEntry>` built from arbitrary
        /// (deadline offset, id) pairs must yield non-decreasing deadlines,
        /// with ties broken by id (§3, "Ordering").
        #[test]
        fn pops_in_non_decreasing_deadline_order(
            pairs in prop::collection::vec((0u64..1000, 0u64..1000), 0..64),
        ) {
            let base = Instant::now();
            let mut heap: BinaryHeap<HeapEntry> = pairs
                .iter()
                .map(|&(offset, id)| entry(offset, id, base))
                .collect();

            let mut last: Option<(Instant, u64)> = None;
            while let Some(e) = heap.pop() {
                if let Some((d, id)) = last {
                    prop_assert!((d, id) <= (e.deadline, e.id));
                }
                last = Some((e.deadline, e.id));
            }
        }
    }
}
