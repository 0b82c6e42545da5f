//! Bitmap-indexed handle table.
//!
//! Maps dense 16-bit ids to shared payloads. The backing store is a slot
//! array plus a byte-packed bitmap; growth doubles amortized in units of
//! 128 slots, rounded to a power of two, up to a fixed ceiling. Id 0 is
//! reserved as the invalid handle.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::Mutex;

/// Initial table capacity
pub const NR_OPEN_DEFAULT: usize = 256;
/// Absolute ceiling on table growth
pub const BITMAP_SIZE: usize = 65536;
/// First allocatable id; 0 stays invalid
pub const START_FID: usize = 1;

/// Growth granularity in slots
const GROW_UNIT: usize = 128;

struct TableInner<T> {
    slots: Vec<Option<Arc<T>>>,
    bitmap: Vec<u8>,
    start_pos: usize,
    max_fids: usize,
}

impl<T> TableInner<T> {
    fn with_capacity(num: usize) -> Self {
        let mut inner = Self {
            slots: Vec::new(),
            bitmap: Vec::new(),
            start_pos: START_FID,
            max_fids: num,
        };
        inner.slots.resize_with(num, || None);
        inner.bitmap.resize(num.div_ceil(8), 0);
        inner
    }

    fn bit(&self, id: usize) -> bool {
        self.bitmap[id / 8] & (1 << (id % 8)) != 0
    }

    fn set_bit(&mut self, id: usize) {
        self.bitmap[id / 8] |= 1 << (id % 8);
    }

    fn clear_bit(&mut self, id: usize) {
        self.bitmap[id / 8] &= !(1 << (id % 8));
    }

    fn find_next_zero(&self, from: usize) -> Option<usize> {
        (from.max(START_FID)..self.max_fids).find(|&id| !self.bit(id))
    }

    /// Copy-grow to at least `want + 1` slots, amortized-doubling in
    /// GROW_UNIT chunks rounded up to a power of two.
    fn grow(&mut self, want: usize) -> Result<()> {
        let units = want / GROW_UNIT;
        let num = (units + 1).next_power_of_two() * GROW_UNIT;
        if num > BITMAP_SIZE {
            return Err(Error::TooManyOpenFiles);
        }
        if num <= self.max_fids {
            return Ok(());
        }
        self.slots.resize_with(num, || None);
        self.bitmap.resize(num.div_ceil(8), 0);
        self.max_fids = num;
        Ok(())
    }
}

/// Dense id table holding shared payloads
pub struct FidTable<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T> Default for FidTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FidTable<T> {
    /// Create an empty table at the default capacity.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner::with_capacity(NR_OPEN_DEFAULT)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner<T>> {
        // Mutex poisoning only happens on a panicking holder; the table
        // contents stay consistent, so take the data either way.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate the lowest free id at or above the scan hint.
    pub fn allocate(&self) -> Result<u16> {
        let mut inner = self.lock();
        loop {
            match inner.find_next_zero(inner.start_pos) {
                Some(id) => {
                    inner.set_bit(id);
                    inner.start_pos = id + 1;
                    return Ok(id as u16);
                }
                None => {
                    // Retry from the bottom once before growing: released
                    // ids below the hint are reusable.
                    if let Some(id) = inner.find_next_zero(START_FID) {
                        inner.set_bit(id);
                        inner.start_pos = id + 1;
                        return Ok(id as u16);
                    }
                    let want = inner.max_fids;
                    inner.grow(want)?;
                }
            }
        }
    }

    /// Publish a payload under an allocated id. The slot must be empty.
    pub fn bind(&self, id: u16, payload: Arc<T>) -> Result<()> {
        let mut inner = self.lock();
        let id = id as usize;
        if id < START_FID || id >= inner.max_fids {
            return Err(Error::Internal(format!("bind of out-of-range id {}", id)));
        }
        if inner.slots[id].is_some() {
            return Err(Error::Internal(format!("bind of occupied slot {}", id)));
        }
        inner.slots[id] = Some(payload);
        Ok(())
    }

    /// Look up the payload bound to `id`.
    pub fn lookup(&self, id: u16) -> Option<Arc<T>> {
        let inner = self.lock();
        let id = id as usize;
        if id < START_FID || id >= inner.max_fids {
            return None;
        }
        inner.slots[id].clone()
    }

    /// Clear the bitmap bit for `id`, moving the scan hint down.
    pub fn release(&self, id: u16) {
        let mut inner = self.lock();
        let id = id as usize;
        if id >= inner.max_fids {
            return;
        }
        inner.clear_bit(id);
        if id < inner.start_pos {
            inner.start_pos = id;
        }
    }

    /// Snapshot and null the slot for `id`, returning the payload. The
    /// bitmap bit stays set until `release`.
    pub fn unbind(&self, id: u16) -> Option<Arc<T>> {
        let mut inner = self.lock();
        let id = id as usize;
        if id < START_FID || id >= inner.max_fids {
            return None;
        }
        inner.slots[id].take()
    }

    /// All currently bound (id, payload) pairs.
    pub fn entries(&self) -> Vec<(u16, Arc<T>)> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|p| (id as u16, Arc::clone(p))))
            .collect()
    }

    /// Number of bound slots.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether any slot is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity, for diagnostics.
    pub fn capacity(&self) -> usize {
        self.lock().max_fids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_starts_at_one() {
        let table: FidTable<u32> = FidTable::new();
        assert_eq!(table.allocate().unwrap(), 1);
        assert_eq!(table.allocate().unwrap(), 2);
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let table: FidTable<String> = FidTable::new();
        let id = table.allocate().unwrap();
        table.bind(id, Arc::new("payload".to_string())).unwrap();

        let found = table.lookup(id).unwrap();
        assert_eq!(*found, "payload");

        let taken = table.unbind(id).unwrap();
        assert_eq!(*taken, "payload");
        assert!(table.lookup(id).is_none());
        table.release(id);
    }

    #[test]
    fn test_double_bind_is_internal_error() {
        let table: FidTable<u32> = FidTable::new();
        let id = table.allocate().unwrap();
        table.bind(id, Arc::new(1)).unwrap();
        assert!(matches!(
            table.bind(id, Arc::new(2)),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_lookup_of_invalid_ids() {
        let table: FidTable<u32> = FidTable::new();
        assert!(table.lookup(0).is_none());
        assert!(table.lookup(9999).is_none());
    }

    #[test]
    fn test_release_reuses_lowest_id() {
        let table: FidTable<u32> = FidTable::new();
        let a = table.allocate().unwrap();
        let _b = table.allocate().unwrap();
        let _c = table.allocate().unwrap();
        table.release(a);
        assert_eq!(table.allocate().unwrap(), a);
    }

    #[test]
    fn test_no_two_live_ids_collide() {
        let table: FidTable<u32> = FidTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = table.allocate().unwrap();
            assert!(seen.insert(id), "id {} allocated twice", id);
        }
    }

    #[test]
    fn test_growth_past_default() {
        let table: FidTable<u32> = FidTable::new();
        for _ in 0..NR_OPEN_DEFAULT + 10 {
            table.allocate().unwrap();
        }
        assert!(table.capacity() > NR_OPEN_DEFAULT);
    }

    #[test]
    fn test_exhaustion_reports_too_many_files() {
        let table: FidTable<u32> = FidTable::new();
        let mut last = Ok(0u16);
        for _ in 0..BITMAP_SIZE + 1 {
            last = table.allocate();
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(Error::TooManyOpenFiles)));
    }

    #[test]
    fn test_entries_snapshot() {
        let table: FidTable<u32> = FidTable::new();
        for v in 0..5u32 {
            let id = table.allocate().unwrap();
            table.bind(id, Arc::new(v)).unwrap();
        }
        let entries = table.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(table.len(), 5);
    }
}
