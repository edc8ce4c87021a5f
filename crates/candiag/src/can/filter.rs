//! Acceptance filters
//!
//! Filters are bookkeeping only: the hardware or driver behind a transport
//! does the real acceptance filtering. The table keeps the list consistent
//! (no duplicates) and counts how many filters have been applied.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::CanFrame;

/// Id/mask acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    #[serde(default)]
    pub extended: bool,
    /// `true` passes matching frames, `false` blocks them
    #[serde(default = "default_pass_through")]
    pub pass_through: bool,
}

fn default_pass_through() -> bool {
    true
}

impl CanFilter {
    /// Pass filter for standard frames
    pub fn pass(id: u32, mask: u32) -> Self {
        Self {
            id,
            mask,
            extended: false,
            pass_through: true,
        }
    }

    /// Block filter for standard frames
    pub fn block(id: u32, mask: u32) -> Self {
        Self {
            pass_through: false,
            ..Self::pass(id, mask)
        }
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Whether a frame satisfies this filter
    ///
    /// A frame whose id type differs from the filter's never matches; for a
    /// block filter the id/mask comparison is inverted.
    pub fn matches(&self, frame: &CanFrame) -> bool {
        if frame.extended != self.extended {
            return false;
        }
        let hit = (frame.id & self.mask) == (self.id & self.mask);
        if self.pass_through {
            hit
        } else {
            !hit
        }
    }

    /// Same id, mask and id type; the pass/block flag is not compared
    pub fn same_pattern(&self, other: &CanFilter) -> bool {
        self.id == other.id && self.mask == other.mask && self.extended == other.extended
    }
}

/// Mutex-guarded filter list shared by transport implementations
#[derive(Debug, Default)]
pub struct FilterTable {
    filters: Mutex<Vec<CanFilter>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter. Returns `false` (and changes nothing) if an equal
    /// pattern is already present.
    pub fn add(&self, filter: CanFilter) -> bool {
        let mut filters = self.filters.lock();
        if filters.iter().any(|f| f.same_pattern(&filter)) {
            return false;
        }
        filters.push(filter);
        true
    }

    /// Remove a filter. Returns `false` if no filter with that pattern exists.
    pub fn remove(&self, filter: &CanFilter) -> bool {
        let mut filters = self.filters.lock();
        match filters.iter().position(|f| f.same_pattern(filter)) {
            Some(index) => {
                filters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<CanFilter> {
        self.filters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.filters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.lock().is_empty()
    }

    pub fn clear(&self) {
        self.filters.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_filter_matches_masked_id() {
        let filter = CanFilter::pass(0x100, 0x700);
        assert!(filter.matches(&CanFrame::new(0x123, &[])));
        assert!(!filter.matches(&CanFrame::new(0x200, &[])));
    }

    #[test]
    fn test_block_filter_inverts_match() {
        let filter = CanFilter::block(0x100, 0x700);
        assert!(!filter.matches(&CanFrame::new(0x123, &[])));
        assert!(filter.matches(&CanFrame::new(0x200, &[])));
    }

    #[test]
    fn test_id_type_mismatch_never_matches() {
        let standard = CanFilter::pass(0x100, 0x700);
        assert!(!standard.matches(&CanFrame::new_extended(0x123, &[])));

        // Not inverted for block filters either
        let block = CanFilter::block(0x100, 0x700);
        assert!(!block.matches(&CanFrame::new_extended(0x200, &[])));

        let extended = CanFilter::pass(0x18DA_F100, 0x1FFF_FF00).extended();
        assert!(extended.matches(&CanFrame::new_extended(0x18DA_F1AB, &[])));
    }

    #[test]
    fn test_filter_table_is_idempotent() {
        let table = FilterTable::new();
        let filter = CanFilter::pass(0x7E8, 0x7FF);

        assert!(table.add(filter));
        assert!(!table.add(filter));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&filter));
        assert!(!table.remove(&filter));
        assert!(table.is_empty());
    }

    #[test]
    fn test_filter_table_remove_ignores_pass_flag() {
        let table = FilterTable::new();
        table.add(CanFilter::pass(0x7E8, 0x7FF));
        assert!(table.remove(&CanFilter::block(0x7E8, 0x7FF)));
    }
}
