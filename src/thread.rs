//! Per-thread service contexts.
//!
//! Each service thread owns a bounded fd table mapping poll positions to
//! slot handles. The table's lock is exclusive to the owning thread except
//! during cross-thread adoption, where the creating thread holds it only
//! for the duration of the insertion call.

use crate::slot::SlotId;
use parking_lot::Mutex;
use slab::Slab;

/// One service thread's context.
pub struct PerThread {
    tsi: usize,
    pub(crate) fds: Mutex<FdTable>,
    /// Slots on this thread with replay bytes still queued.
    pub(crate) pending_replay: Mutex<Vec<SlotId>>,
}

impl PerThread {
    pub(crate) fn new(tsi: usize, fd_limit: usize) -> Self {
        Self {
            tsi,
            fds: Mutex::new(FdTable::with_limit(fd_limit)),
            pending_replay: Mutex::new(Vec::new()),
        }
    }

    pub fn tsi(&self) -> usize {
        self.tsi
    }

    /// Number of descriptors currently installed.
    pub fn fd_count(&self) -> usize {
        self.fds.lock().len()
    }
}

/// Bounded table of installed descriptors for one thread.
pub(crate) struct FdTable {
    entries: Slab<SlotId>,
    limit: usize,
}

impl FdTable {
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            entries: Slab::new(),
            limit,
        }
    }

    /// One table entry stays reserved for the thread's waker.
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() + 1 >= self.limit
    }

    /// Install a slot, returning its position. `None` when the table is
    /// full.
    pub(crate) fn insert(&mut self, id: SlotId) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.entries.insert(id))
    }

    pub(crate) fn remove(&mut self, pos: usize) -> Option<SlotId> {
        self.entries.try_remove(pos)
    }

    pub(crate) fn get(&self, pos: usize) -> Option<SlotId> {
        self.entries.get(pos).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pick the thread with the fewest installed fds among those not at
/// capacity. Ties resolve to the lowest index; `None` when every thread is
/// full.
pub(crate) fn idlest_thread(threads: &[PerThread]) -> Option<usize> {
    let mut lowest = usize::MAX;
    let mut hit = None;

    for (n, pt) in threads.iter().enumerate() {
        let fds = pt.fds.lock();
        if !fds.is_full() && fds.len() < lowest {
            lowest = fds.len();
            hit = Some(n);
        }
    }

    hit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(threads: usize, limit: usize) -> Vec<PerThread> {
        (0..threads).map(|n| PerThread::new(n, limit)).collect()
    }

    fn fill(pt: &PerThread, count: usize) {
        let mut fds = pt.fds.lock();
        for _ in 0..count {
            fds.insert(SlotId(0)).unwrap();
        }
    }

    #[test]
    fn selector_prefers_emptiest() {
        let threads = table_with(3, 16);
        fill(&threads[0], 3);
        fill(&threads[1], 1);
        fill(&threads[2], 2);
        assert_eq!(idlest_thread(&threads), Some(1));
    }

    #[test]
    fn selector_ties_resolve_to_lowest_index() {
        let threads = table_with(3, 16);
        fill(&threads[0], 2);
        fill(&threads[1], 2);
        fill(&threads[2], 2);
        assert_eq!(idlest_thread(&threads), Some(0));
    }

    #[test]
    fn selector_skips_full_threads() {
        let threads = table_with(2, 4);
        // capacity is limit - 1 = 3
        fill(&threads[0], 3);
        fill(&threads[1], 1);
        assert_eq!(idlest_thread(&threads), Some(1));

        fill(&threads[1], 2);
        assert_eq!(idlest_thread(&threads), None);
    }

    #[test]
    fn fd_table_positions_are_stable() {
        let mut fds = FdTable::with_limit(8);
        let a = fds.insert(SlotId(10)).unwrap();
        let b = fds.insert(SlotId(11)).unwrap();
        assert_ne!(a, b);

        fds.remove(a);
        assert_eq!(fds.get(a), None);
        assert_eq!(fds.get(b), Some(SlotId(11)));
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn fd_table_rejects_at_capacity() {
        let mut fds = FdTable::with_limit(3);
        assert!(fds.insert(SlotId(0)).is_some());
        assert!(fds.insert(SlotId(1)).is_some());
        assert!(fds.insert(SlotId(2)).is_none());
    }
}
