//! The bounded window of slots a single rule matches and rewrites.
//!
//! Entry 0 holds the slot just before the window (or `None` at the start
//! of the chain), so rule-relative indexing is 1-based: slot *i* of the
//! rule is `slots[i + 1]` with `pre_context` slots of lookahead context
//! counted in front of the rule proper.

use crate::segment::Segment;
use crate::slot::SlotKey;

/// Widest window a rule may address.
pub const MAX_SLOTS: usize = 64;

/// Cap on how many slots rules may insert per input slot, used to seed
/// the growth budget of a [`SlotMap`].
pub const MAX_SEG_GROWTH_FACTOR: usize = 64;

#[derive(Debug)]
pub struct SlotMap {
    pub(crate) slots: Vec<Option<SlotKey>>,
    pub(crate) pre_context: u16,
    pub(crate) highwater: Option<SlotKey>,
    pub(crate) highpassed: bool,
    max_size: i64,
    pub is_rtl: bool,
}

impl SlotMap {
    pub fn new(is_rtl: bool, max_size: i64) -> Self {
        SlotMap {
            slots: vec![None],
            pre_context: 0,
            highwater: None,
            highpassed: false,
            max_size,
            is_rtl,
        }
    }

    /// Rewind the window to start again at `before`, the slot preceding
    /// the first matched slot.
    pub fn reset(&mut self, before: Option<SlotKey>, pre_context: u16) {
        self.slots.clear();
        self.slots.push(before);
        self.pre_context = pre_context;
    }

    pub fn push_slot(&mut self, slot: Option<SlotKey>) {
        self.slots.push(slot);
    }

    /// Number of slots in the window, not counting entry 0.
    pub fn size(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn pre_context(&self) -> u16 {
        self.pre_context
    }

    /// Slot at 0-based window index `i`.
    pub fn get(&self, i: usize) -> Option<SlotKey> {
        self.slots.get(i + 1).copied().flatten()
    }

    pub(crate) fn put(&mut self, i: usize, slot: Option<SlotKey>) {
        self.slots[i + 1] = slot;
    }

    pub fn begin(&self) -> Option<SlotKey> {
        self.get(0)
    }

    /// Last slot of the window.
    pub fn end_minus_1(&self) -> Option<SlotKey> {
        self.slots.last().copied().flatten()
    }

    pub fn highwater(&self) -> Option<SlotKey> {
        self.highwater
    }

    pub fn set_highwater(&mut self, slot: Option<SlotKey>) {
        self.highwater = slot;
        self.highpassed = false;
    }

    pub fn highpassed(&self) -> bool {
        self.highpassed
    }

    pub fn set_highpassed(&mut self, passed: bool) {
        self.highpassed = passed;
    }

    /// Spend one unit of growth budget, returning what remains.
    pub(crate) fn dec_max(&mut self) -> i64 {
        self.max_size -= 1;
        self.max_size
    }

    pub fn remaining_growth(&self) -> i64 {
        self.max_size
    }

    /// Free slots a rule marked deleted or left behind as temporary
    /// copies. `current` is the caller's cursor; if it is collected, the
    /// returned cursor moves to a surviving neighbour.
    pub fn collect_garbage(
        &mut self,
        seg: &mut Segment,
        mut current: Option<SlotKey>,
    ) -> Option<SlotKey> {
        for i in 1..self.slots.len().saturating_sub(1) {
            let Some(key) = self.slots[i] else { continue };
            let Some(slot) = seg.try_slot(key) else {
                self.slots[i] = None;
                continue;
            };
            if slot.is_deleted() || slot.is_copied() {
                if current == Some(key) {
                    current = slot.prev().or_else(|| slot.next());
                }
                seg.free_slot(key);
                self.slots[i] = None;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::small_segment;

    #[test]
    fn window_indexing() {
        let seg = small_segment(3);
        let mut map = SlotMap::new(false, 8);
        let first = seg.first().unwrap();
        map.reset(None, 0);
        let mut cur = Some(first);
        while let Some(k) = cur {
            map.push_slot(Some(k));
            cur = seg.slot(k).next();
        }
        assert_eq!(map.size(), 3);
        assert_eq!(map.begin(), Some(first));
        assert_eq!(map.end_minus_1(), seg.last());
        assert_eq!(map.get(3), None);
    }

    #[test]
    fn growth_budget_counts_down() {
        let mut map = SlotMap::new(false, 2);
        assert_eq!(map.dec_max(), 1);
        assert_eq!(map.dec_max(), 0);
        assert_eq!(map.dec_max(), -1);
        assert_eq!(map.remaining_growth(), -1);
    }

    #[test]
    fn garbage_collection_frees_deleted_and_copied() {
        let mut seg = small_segment(3);
        let first = seg.first().unwrap();
        let mid = seg.slot(first).next().unwrap();
        let last = seg.last().unwrap();
        let mut map = SlotMap::new(false, 8);
        map.reset(None, 0);
        for k in [first, mid, last] {
            map.push_slot(Some(k));
        }
        // pad so the final entry is outside the collected range
        map.push_slot(None);
        // unlink and mark, the way a delete instruction leaves a slot
        seg.slot_mut(first).next = Some(last);
        seg.slot_mut(last).prev = Some(first);
        seg.slot_mut(mid).mark_deleted(true);
        let cursor = map.collect_garbage(&mut seg, Some(mid));
        assert_eq!(cursor, Some(first));
        assert!(seg.try_slot(mid).is_none());
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(0), Some(first));
    }
}
