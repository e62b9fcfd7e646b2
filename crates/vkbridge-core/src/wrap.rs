//! Wrapper records for dispatchable handles.
//!
//! Every dispatchable handle the client sees (instance, physical device,
//! device, queue, command buffer) is a pointer to a [`WrapperRecord`]
//! owned by this layer. The loader requires the first pointer-sized slot
//! of a dispatchable handle to be writable by it; the real identity lives
//! in the second slot and is set exactly once at construction, so readers
//! on any thread can take it without synchronization.
//!
//! Wrapping replaces an earlier scheme that temporarily overwrote the
//! dispatch slot of the shared real object, which raced under concurrent
//! calls on the same handle from different threads.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::BridgeError;

/// The loader magic value expected in fresh dispatchable handles.
pub const LOADER_MAGIC: usize = 0x01CDC0DE;

/// One dispatchable identity exposed to the client.
#[repr(C)]
pub struct WrapperRecord {
    /// Caller-owned slot; the loader overwrites it with its dispatch table.
    pub loader_data: usize,
    /// The real driver handle. Immutable after construction.
    real: u64,
}

/// Read the real identity out of a wrapper. Lock-free: the field is
/// write-once.
///
/// # Safety
/// `ptr` must point to a live `WrapperRecord` produced by [`WrapTable::wrap`].
pub unsafe fn unwrap_raw(ptr: *const WrapperRecord) -> u64 {
    unsafe { (*ptr).real }
}

/// Registry of live wrapper records.
///
/// The backing map exists so teardown paths can verify a pointer was ours
/// before freeing it; the hot unwrap path never touches it.
pub struct WrapTable {
    live: DashMap<usize, u64>,
    created: AtomicU64,
}

impl WrapTable {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    /// Allocate a wrapper over `real`. The only failure mode is host
    /// allocation failure.
    pub fn wrap(&self, real: u64) -> Result<*mut WrapperRecord, BridgeError> {
        let layout = std::alloc::Layout::new::<WrapperRecord>();
        // SAFETY: layout is non-zero sized.
        let ptr = unsafe { std::alloc::alloc(layout) } as *mut WrapperRecord;
        if ptr.is_null() {
            return Err(BridgeError::WrapperAlloc);
        }
        // SAFETY: ptr is valid for writes of WrapperRecord.
        unsafe {
            ptr.write(WrapperRecord {
                loader_data: LOADER_MAGIC,
                real,
            });
        }
        self.live.insert(ptr as usize, real);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Checked unwrap: resolve the real identity of a pointer this table
    /// produced. Unwrapping a never-wrapped pointer is a caller bug.
    pub fn unwrap(&self, ptr: *const WrapperRecord) -> Result<u64, BridgeError> {
        if !self.live.contains_key(&(ptr as usize)) {
            return Err(BridgeError::UnknownHandle(ptr as u64));
        }
        // SAFETY: the record is live per the registry.
        Ok(unsafe { unwrap_raw(ptr) })
    }

    pub fn is_wrapped(&self, ptr: *const WrapperRecord) -> bool {
        self.live.contains_key(&(ptr as usize))
    }

    /// Destroy a wrapper. The real object is not touched; whether it is
    /// torn down is the caller's decision.
    ///
    /// # Safety
    /// `ptr` must have been produced by [`WrapTable::wrap`] on this table
    /// and must not be used afterwards.
    pub unsafe fn release(&self, ptr: *mut WrapperRecord) {
        if self.live.remove(&(ptr as usize)).is_some() {
            let layout = std::alloc::Layout::new::<WrapperRecord>();
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Default for WrapTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_of_wrap_is_identity() {
        let table = WrapTable::new();
        for real in [0u64, 1, 0xdead_beef, u64::MAX] {
            let w = table.wrap(real).expect("wrap");
            assert_eq!(table.unwrap(w).expect("unwrap"), real);
            assert_eq!(unsafe { unwrap_raw(w) }, real);
            unsafe { table.release(w) };
        }
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_loader_slot_is_caller_writable() {
        let table = WrapTable::new();
        let w = table.wrap(7).expect("wrap");
        unsafe {
            assert_eq!((*w).loader_data, LOADER_MAGIC);
            (*w).loader_data = 0x1234;
            // The real identity is unaffected by loader writes.
            assert_eq!(unwrap_raw(w), 7);
            table.release(w);
        }
    }

    #[test]
    fn test_unwrap_of_foreign_pointer_is_error() {
        let table = WrapTable::new();
        let bogus = 0x10usize as *const WrapperRecord;
        assert!(matches!(
            table.unwrap(bogus),
            Err(BridgeError::UnknownHandle(_))
        ));
    }
}
