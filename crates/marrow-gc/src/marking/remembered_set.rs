//! Old-to-young references recorded for minor collections.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub(crate) struct RememberedSet {
    // slot address -> is weak
    slots: BTreeMap<usize, bool>,
    source_objects: BTreeSet<usize>,
}

impl RememberedSet {
    pub(crate) fn add_slot(&mut self, slot: usize, weak: bool) {
        self.slots.insert(slot, weak);
    }

    pub(crate) fn add_source_object(&mut self, payload: usize) {
        self.source_objects.insert(payload);
    }

    /// Forgets everything recorded inside `[start, end)`.
    pub(crate) fn remove_range(&mut self, start: usize, end: usize) {
        let slots: Vec<usize> = self.slots.range(start..end).map(|(slot, _)| *slot).collect();
        for slot in slots {
            self.slots.remove(&slot);
        }
        let objects: Vec<usize> = self.source_objects.range(start..end).copied().collect();
        for object in objects {
            self.source_objects.remove(&object);
        }
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.slots.iter().map(|(slot, weak)| (*slot, *weak))
    }

    pub(crate) fn source_objects(&self) -> impl Iterator<Item = usize> + '_ {
        self.source_objects.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() + self.source_objects.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.source_objects.clear();
    }
}
