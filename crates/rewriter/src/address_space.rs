//! A map from non-overlapping address ranges to arbitrary items.
//!
//! This is the backbone of both the parser (which carves an image into
//! blocks) and the layout stage (which places blocks at final addresses).
//! The single invariant: no two stored ranges ever intersect. `insert` is
//! all-or-nothing and never mutates the space on failure.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::address::{AddressKind, AddressRange};

#[derive(Debug, Clone)]
pub struct AddressSpace<A, I> {
    ranges: BTreeMap<AddressRange<A>, I>,
}

impl<A: AddressKind, I> Default for AddressSpace<A, I> {
    fn default() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }
}

impl<A: AddressKind, I> AddressSpace<A, I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Inserts `item` at `range`. Fails without mutating the space when the
    /// range intersects anything already present.
    pub fn insert(&mut self, range: AddressRange<A>, item: I) -> Result<(), I> {
        if self.find_first_intersecting(&range).is_some() {
            return Err(item);
        }
        self.ranges.insert(range, item);
        Ok(())
    }

    /// Removes the exact `range`. Returns the item, or `None` when the range
    /// is not present as stored (intersecting is not enough).
    pub fn remove(&mut self, range: &AddressRange<A>) -> Option<I> {
        self.ranges.remove(range)
    }

    /// The stored range that fully contains `range`, if any.
    pub fn find_containing(&self, range: &AddressRange<A>) -> Option<(&AddressRange<A>, &I)> {
        let (found, item) = self.find_first_intersecting(range)?;
        found.contains_range(range).then_some((found, item))
    }

    /// The lowest stored range intersecting `range`, if any.
    pub fn find_first_intersecting(
        &self,
        range: &AddressRange<A>,
    ) -> Option<(&AddressRange<A>, &I)> {
        self.intersecting(range).next()
    }

    /// All stored ranges intersecting `range`, in address order.
    pub fn intersecting<'a>(
        &'a self,
        range: &AddressRange<A>,
    ) -> impl Iterator<Item = (&'a AddressRange<A>, &'a I)> + 'a {
        // A predecessor may still reach into `range`, so back up one entry
        // before scanning forward.
        let range = *range;
        let start_key = self
            .ranges
            .range((Bound::Unbounded, Bound::Excluded(range)))
            .next_back()
            .map(|(r, _)| *r);

        let lower = match start_key {
            Some(r) if r.intersects(&range) => Bound::Included(r),
            _ => Bound::Included(range),
        };

        self.ranges
            .range((lower, Bound::Unbounded))
            .take_while(move |(r, _)| r.start() < range.end() || r.intersects(&range))
            .filter(move |(r, _)| r.intersects(&range))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AddressRange<A>, &I)> {
        self.ranges.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&AddressRange<A>, &mut I)> {
        self.ranges.iter_mut()
    }
}
