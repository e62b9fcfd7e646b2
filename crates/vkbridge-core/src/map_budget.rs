//! Mapped-byte accounting and scratch redirection.
//!
//! The marshaling bridge falls over once too many bytes are mapped at the
//! same time, so every successful real mapping is recorded in a ledger
//! against a hard ceiling. A map request that would cross the ceiling is
//! not refused: the client gets a pointer into a shared scratch region
//! instead, so its own logic keeps running even though those writes never
//! reach the device.
//!
//! Unmap of a REAL mapping subtracts its tracked size from the running
//! total before the real unmap is invoked; without the subtraction the
//! total only ever grows and every later mapping silently goes FAKE.

use std::collections::HashMap;
use std::os::raw::c_void;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mapping {
    Real { bytes: u64 },
    Fake,
}

/// What the caller must do after [`MapLedger::unmap`].
#[derive(Debug, PartialEq, Eq)]
pub enum UnmapAction {
    /// Forward the unmap to the real driver.
    RealUnmap,
    /// The mapping only ever existed in scratch; do not call the driver.
    DropFake,
    /// Never tracked here (mapped before the layer attached, or a bug).
    Untracked,
}

struct LedgerInner {
    real_bytes: u64,
    entries: HashMap<u64, Mapping>,
    fake_live: u32,
    scratch: usize, // lazily allocated; stored as address so the guard is Send
}

/// Ledger of live mappings, keyed by real memory identity.
pub struct MapLedger {
    inner: Mutex<LedgerInner>,
    budget: u64,
    scratch_bytes: usize,
    whole_size_nominal: u64,
}

impl MapLedger {
    pub fn new(budget: u64, scratch_bytes: u64, whole_size_nominal: u64) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                real_bytes: 0,
                entries: HashMap::new(),
                fake_live: 0,
                scratch: 0,
            }),
            budget,
            scratch_bytes: scratch_bytes as usize,
            whole_size_nominal,
        }
    }

    /// Accounting size for a request. The real extent of a WHOLE_SIZE
    /// request is not cheaply known at this layer, so it is booked at a
    /// fixed nominal size.
    pub fn tracked_size(&self, size: vk::DeviceSize) -> u64 {
        if size == vk::WHOLE_SIZE {
            self.whole_size_nominal
        } else {
            size
        }
    }

    /// Reserve budget for a REAL mapping of `memory`. Returns `false`
    /// when the reservation would cross the ceiling (the caller should
    /// fall back to [`MapLedger::map_fake`]). No lock is held while the
    /// caller performs the real map; a failed real map must be undone
    /// with [`MapLedger::cancel`].
    pub fn try_reserve(&self, memory: u64, size: vk::DeviceSize) -> bool {
        let bytes = self.tracked_size(size);
        let mut inner = self.inner.lock();
        if inner.real_bytes.saturating_add(bytes) > self.budget {
            return false;
        }
        inner.real_bytes += bytes;
        inner.entries.insert(memory, Mapping::Real { bytes });
        debug!(memory, bytes, total = inner.real_bytes, "mapping reserved");
        true
    }

    /// Undo a reservation whose real map failed.
    pub fn cancel(&self, memory: u64) {
        let mut inner = self.inner.lock();
        if let Some(Mapping::Real { bytes }) = inner.entries.remove(&memory) {
            inner.real_bytes -= bytes;
        }
    }

    /// Record a FAKE mapping and hand out the shared scratch region.
    /// Writes through the returned pointer are accepted and discarded.
    ///
    /// A request larger than the scratch region cannot be redirected;
    /// handing out the scratch anyway would let the client write past
    /// its end. WHOLE_SIZE requests have no known extent at this layer
    /// and get the scratch as is.
    pub fn map_fake(&self, memory: u64, size: vk::DeviceSize) -> Result<*mut c_void, vk::Result> {
        if size != vk::WHOLE_SIZE && size > self.scratch_bytes as u64 {
            warn!(
                memory,
                size,
                scratch = self.scratch_bytes,
                "map request exceeds scratch capacity"
            );
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let mut inner = self.inner.lock();
        if inner.scratch == 0 {
            let layout = scratch_layout(self.scratch_bytes);
            // SAFETY: layout is non-zero sized.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            inner.scratch = ptr as usize;
        }
        inner.entries.insert(memory, Mapping::Fake);
        inner.fake_live += 1;
        warn!(
            memory,
            total = inner.real_bytes,
            budget = self.budget,
            "mapping budget exhausted; redirecting to scratch"
        );
        Ok(inner.scratch as *mut c_void)
    }

    /// Retire the mapping for `memory`. For REAL mappings the tracked
    /// size is subtracted here, before the caller reaches the real
    /// driver.
    pub fn unmap(&self, memory: u64) -> UnmapAction {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&memory) {
            Some(Mapping::Real { bytes }) => {
                inner.real_bytes -= bytes;
                debug!(memory, bytes, total = inner.real_bytes, "mapping retired");
                UnmapAction::RealUnmap
            }
            Some(Mapping::Fake) => {
                inner.fake_live -= 1;
                UnmapAction::DropFake
            }
            None => UnmapAction::Untracked,
        }
    }

    pub fn real_bytes(&self) -> u64 {
        self.inner.lock().real_bytes
    }

    pub fn fake_live(&self) -> u32 {
        self.inner.lock().fake_live
    }
}

impl Drop for MapLedger {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.scratch != 0 {
            // SAFETY: allocated in map_fake with the same layout.
            unsafe {
                std::alloc::dealloc(inner.scratch as *mut u8, scratch_layout(self.scratch_bytes))
            };
        }
    }
}

fn scratch_layout(bytes: usize) -> std::alloc::Layout {
    // 64-byte alignment keeps the scratch usable for clients that assume
    // at least cache-line-aligned map results.
    std::alloc::Layout::from_size_align(bytes.max(1), 64)
        .unwrap_or(std::alloc::Layout::new::<u8>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_unmap_restores_total_exactly() {
        let ledger = MapLedger::new(1000, 128, 16);
        assert!(ledger.try_reserve(1, 400));
        assert!(ledger.try_reserve(2, 300));
        assert_eq!(ledger.real_bytes(), 700);

        assert_eq!(ledger.unmap(1), UnmapAction::RealUnmap);
        assert_eq!(ledger.real_bytes(), 300);
        assert_eq!(ledger.unmap(2), UnmapAction::RealUnmap);
        assert_eq!(ledger.real_bytes(), 0);
    }

    #[test]
    fn test_over_budget_goes_fake() {
        let ledger = MapLedger::new(500, 128, 16);
        assert!(ledger.try_reserve(1, 400));
        assert!(!ledger.try_reserve(2, 200));

        let p = ledger.map_fake(2, 200).expect("scratch");
        assert!(!p.is_null());
        assert_eq!(ledger.fake_live(), 1);
        // The fake mapping never counted against the real total.
        assert_eq!(ledger.real_bytes(), 400);

        assert_eq!(ledger.unmap(2), UnmapAction::DropFake);
        assert_eq!(ledger.fake_live(), 0);
        // Budget frees up after the real unmap and the slot can go real.
        assert_eq!(ledger.unmap(1), UnmapAction::RealUnmap);
        assert!(ledger.try_reserve(2, 200));
    }

    #[test]
    fn test_fake_mappings_share_one_scratch() {
        let ledger = MapLedger::new(0, 128, 16);
        let a = ledger.map_fake(1, 32).expect("scratch");
        let b = ledger.map_fake(2, vk::WHOLE_SIZE).expect("scratch");
        assert_eq!(a, b);
        assert_eq!(ledger.fake_live(), 2);
    }

    #[test]
    fn test_oversized_fake_request_is_refused() {
        let ledger = MapLedger::new(0, 128, 16);
        assert_eq!(
            ledger.map_fake(1, 129),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
        assert_eq!(ledger.fake_live(), 0);
        assert_eq!(ledger.unmap(1), UnmapAction::Untracked);
        // At capacity still fits.
        assert!(ledger.map_fake(1, 128).is_ok());
    }

    #[test]
    fn test_whole_size_uses_nominal_accounting() {
        let ledger = MapLedger::new(100, 128, 64);
        assert_eq!(ledger.tracked_size(vk::WHOLE_SIZE), 64);
        assert!(ledger.try_reserve(1, vk::WHOLE_SIZE));
        assert_eq!(ledger.real_bytes(), 64);
        assert!(!ledger.try_reserve(2, vk::WHOLE_SIZE));
        assert_eq!(ledger.unmap(1), UnmapAction::RealUnmap);
        assert_eq!(ledger.real_bytes(), 0);
    }

    #[test]
    fn test_failed_real_map_is_cancelled() {
        let ledger = MapLedger::new(100, 128, 16);
        assert!(ledger.try_reserve(1, 80));
        ledger.cancel(1);
        assert_eq!(ledger.real_bytes(), 0);
        assert_eq!(ledger.unmap(1), UnmapAction::Untracked);
    }
}
