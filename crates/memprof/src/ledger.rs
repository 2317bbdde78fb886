//! Outstanding heap allocations.
//!
//! The ledger trusts the allocator: an address that is allocated again
//! without being freed first simply replaces the old entry.

use alloc::vec::Vec;

use hashbrown::HashMap;
use log::debug;

use crate::Addr;

/// What we remember about a live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Requested size
    pub size: usize,
    /// Requested alignment, if the allocation came from an aligned allocator
    pub alignment: Option<usize>,
}

/// Address to size table of allocations not freed yet
#[derive(Debug, Default, Clone)]
pub struct AllocationLedger {
    allocations: HashMap<Addr, AllocationInfo>,
}

impl AllocationLedger {
    /// An empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an allocation of `size` bytes at `address`
    pub fn record_allocation(&mut self, address: Addr, size: usize) {
        self.insert(
            address,
            AllocationInfo {
                size,
                alignment: None,
            },
        );
    }

    /// Track an allocation of `size` bytes at `address`, aligned to `alignment`
    pub fn record_aligned_allocation(&mut self, address: Addr, size: usize, alignment: usize) {
        self.insert(
            address,
            AllocationInfo {
                size,
                alignment: Some(alignment),
            },
        );
    }

    fn insert(&mut self, address: Addr, info: AllocationInfo) {
        debug!("alloc - address: {address:#x}, size: {:#x}", info.size);
        if let Some(previous) = self.allocations.insert(address, info) {
            debug!(
                "allocation at {address:#x} replaces an unfreed one of size {:#x}",
                previous.size
            );
        }
    }

    /// Stop tracking `address`, returning its size.
    ///
    /// `None` if the address was never allocated or already freed.
    pub fn record_free(&mut self, address: Addr) -> Option<usize> {
        let size = self.allocations.remove(&address).map(|info| info.size);
        debug!("free - address: {address:#x}, size: {size:x?}");
        size
    }

    /// Size of the live allocation at `address`
    #[must_use]
    pub fn size_of(&self, address: Addr) -> Option<usize> {
        self.allocations.get(&address).map(|info| info.size)
    }

    /// Details of the live allocation at `address`
    #[must_use]
    pub fn get(&self, address: Addr) -> Option<&AllocationInfo> {
        self.allocations.get(&address)
    }

    /// Number of live allocations
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// `true` if every allocation was freed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Bytes held by live allocations
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.allocations
            .values()
            .map(|info| info.size)
            .fold(0, usize::saturating_add)
    }

    /// `(address, size)` of every live allocation, in no particular order
    #[must_use]
    pub fn outstanding_entries(&self) -> Vec<(Addr, usize)> {
        self.allocations
            .iter()
            .map(|(address, info)| (*address, info.size))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_round_trip() {
        let mut ledger = AllocationLedger::new();
        ledger.record_allocation(0x1000, 256);
        assert_eq!(ledger.size_of(0x1000), Some(256));
        assert_eq!(ledger.record_free(0x1000), Some(256));
        assert_eq!(ledger.record_free(0x1000), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_free_untracked() {
        let mut ledger = AllocationLedger::new();
        assert_eq!(ledger.record_free(0xdead), None);
    }

    #[test]
    fn test_reallocation_overwrites() {
        let mut ledger = AllocationLedger::new();
        ledger.record_allocation(0x1000, 16);
        ledger.record_aligned_allocation(0x1000, 64, 32);
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get(0x1000),
            Some(&AllocationInfo {
                size: 64,
                alignment: Some(32)
            })
        );
    }

    #[test]
    fn test_outstanding_entries() {
        let mut ledger = AllocationLedger::new();
        ledger.record_allocation(0x3000, 3);
        ledger.record_allocation(0x1000, 1);
        ledger.record_allocation(0x2000, 2);
        ledger.record_free(0x2000);

        let mut entries = ledger.outstanding_entries();
        entries.sort_unstable();
        assert_eq!(entries, [(0x1000, 1), (0x3000, 3)]);
        assert_eq!(ledger.outstanding_bytes(), 4);
    }
}
