//! Heap splitting and the synthetic memory type.
//!
//! The driver reports one big unified heap; the marshaling bridge cannot
//! actually back more than a few hundred megabytes of host-visible
//! allocations out of it before it starts failing with device-loss
//! statuses. To keep client allocators honest, the reported properties
//! are rewritten once per physical device:
//!
//! - every oversized device-local heap is doubled into (original, capped)
//!   and the host-visible types move onto the capped heap;
//! - if that leaves no device-local-only type, one is synthesized on the
//!   original heap, and allocations against it are remapped back to a
//!   real type at allocation time.
//!
//! The rewritten layout is computed lazily on first query and never
//! changes again for the process lifetime.

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Virtualized memory layout for one physical device.
#[derive(Clone)]
pub struct MemoryPlan {
    /// The properties reported to the client.
    pub props: vk::PhysicalDeviceMemoryProperties,
    /// Index of the synthesized device-local-only type, if one was added.
    pub synthetic_type: Option<u32>,
    /// Real type an allocation against the synthetic type must use.
    pub remap_type: u32,
    /// Bitmask of type indices whose allocations count against the
    /// staging budget (the types repointed to a capped heap).
    pub staging_type_mask: u32,
}

impl MemoryPlan {
    /// Compute the virtualized layout from the driver-reported one.
    pub fn virtualize(reported: &vk::PhysicalDeviceMemoryProperties, staging_cap: u64) -> Self {
        let mut props = *reported;
        let mut staging_type_mask = 0u32;

        // Split the largest oversized device-local heap. One synthesized
        // heap is enough in practice: the constrained drivers report a
        // single unified heap.
        let split_target = (0..props.memory_heap_count as usize)
            .filter(|&i| {
                props.memory_heaps[i]
                    .flags
                    .contains(vk::MemoryHeapFlags::DEVICE_LOCAL)
                    && props.memory_heaps[i].size > staging_cap
            })
            .max_by_key(|&i| props.memory_heaps[i].size)
            .filter(|_| {
                // Both tables must have room for the synthesized entries.
                (props.memory_heap_count as usize) < vk::MAX_MEMORY_HEAPS
                    && (props.memory_type_count as usize) < vk::MAX_MEMORY_TYPES
            });

        if let Some(orig_heap) = split_target {
            let capped_heap = props.memory_heap_count as usize;
            props.memory_heaps[capped_heap] = vk::MemoryHeap {
                size: staging_cap,
                flags: props.memory_heaps[orig_heap].flags,
            };
            props.memory_heap_count += 1;

            for t in 0..props.memory_type_count as usize {
                let ty = &mut props.memory_types[t];
                if ty.heap_index == orig_heap as u32
                    && ty.property_flags
                        .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                {
                    ty.heap_index = capped_heap as u32;
                    staging_type_mask |= 1 << t;
                }
            }
            info!(
                orig_heap,
                capped_heap,
                cap = staging_cap,
                staging_type_mask,
                "split device-local heap"
            );
        }

        // If every type is unified (device-local implies host-visible),
        // synthesize a device-local-only type on the original large heap
        // so clients that insist on a non-host-visible type find one.
        let mut synthetic_type = None;
        let mut remap_type = 0;
        let has_device_local_only = (0..props.memory_type_count as usize).any(|t| {
            let f = props.memory_types[t].property_flags;
            f.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
                && !f.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        });

        if let (Some(orig_heap), false) = (split_target, has_device_local_only) {
            if let Some(donor) = (0..props.memory_type_count as usize).find(|&t| {
                reported.memory_types[t]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            }) {
                let idx = props.memory_type_count as usize;
                props.memory_types[idx] = vk::MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: orig_heap as u32,
                };
                props.memory_type_count += 1;
                synthetic_type = Some(idx as u32);
                remap_type = donor as u32;
                info!(synthetic = idx, remap = donor, "synthesized device-local-only type");
            }
        }

        Self {
            props,
            synthetic_type,
            remap_type,
            staging_type_mask,
        }
    }

    /// Substitute the real type for an allocation against the synthetic
    /// type. Returns the type index the real driver should see.
    pub fn rewrite_allocation_type(&self, requested: u32) -> u32 {
        match self.synthetic_type {
            Some(synth) if requested == synth => {
                debug!(requested, remap = self.remap_type, "remapping synthetic allocation");
                self.remap_type
            }
            _ => requested,
        }
    }

    /// OR the synthetic type's bit into a driver-reported type mask so
    /// client allocators can select it.
    pub fn patch_type_bits(&self, real_bits: u32) -> u32 {
        match self.synthetic_type {
            Some(synth) => real_bits | (1 << synth),
            None => real_bits,
        }
    }

    pub fn is_staging_type(&self, type_index: u32) -> bool {
        type_index < 32 && (self.staging_type_mask >> type_index) & 1 == 1
    }
}

/// Running total of staging-classified allocation bytes, checked before
/// each allocation is forwarded. Exceeding the cap is reported as a
/// recoverable out-of-device-memory so client fallback logic engages.
pub struct StagingLedger {
    inner: Mutex<StagingInner>,
    budget: u64,
}

struct StagingInner {
    total: u64,
    sizes: std::collections::HashMap<u64, u64>,
}

impl StagingLedger {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(StagingInner {
                total: 0,
                sizes: std::collections::HashMap::new(),
            }),
            budget,
        }
    }

    /// Pre-flight check: reserve `size` bytes for `memory`. Fails without
    /// side effects when the reservation would exceed the budget.
    pub fn reserve(&self, memory: u64, size: u64) -> Result<(), vk::Result> {
        let mut inner = self.inner.lock();
        if inner.total.saturating_add(size) > self.budget {
            debug!(size, total = inner.total, budget = self.budget, "staging budget exceeded");
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        inner.total += size;
        inner.sizes.insert(memory, size);
        Ok(())
    }

    /// Move a reservation made under a preflight key onto the real memory
    /// handle, once the allocation has succeeded and the handle exists.
    pub fn rekey(&self, preflight: u64, memory: u64) {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.sizes.remove(&preflight) {
            inner.sizes.insert(memory, size);
        }
    }

    /// Drop the reservation for `memory` (allocation failed or was freed).
    pub fn release(&self, memory: u64) {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.sizes.remove(&memory) {
            inner.total -= size;
        }
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unified_report(heap_size: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 1,
            ..Default::default()
        };
        props.memory_heaps[0] = vk::MemoryHeap {
            size: heap_size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED,
            heap_index: 0,
        };
        props
    }

    const GIB: u64 = 1024 * 1024 * 1024;
    const CAP: u64 = 512 * 1024 * 1024;

    #[test]
    fn test_unified_heap_split_scenario() {
        // 4 GiB device-local heap, two host-visible types, 512 MiB cap.
        let reported = unified_report(4 * GIB);
        let plan = MemoryPlan::virtualize(&reported, CAP);

        assert_eq!(plan.props.memory_heap_count, 2);
        assert_eq!(plan.props.memory_heaps[0].size, 4 * GIB);
        assert_eq!(plan.props.memory_heaps[1].size, CAP);
        assert_eq!(
            plan.props.memory_heaps[1].flags,
            vk::MemoryHeapFlags::DEVICE_LOCAL
        );

        // Both host-visible types moved to the capped heap.
        assert_eq!(plan.props.memory_types[0].heap_index, 1);
        assert_eq!(plan.props.memory_types[1].heap_index, 1);
        assert_eq!(plan.staging_type_mask, 0b11);

        // No device-local-only type existed, so one was synthesized on
        // the original heap.
        let synth = plan.synthetic_type.expect("synthetic type") as usize;
        assert_eq!(synth, 2);
        assert_eq!(plan.props.memory_type_count, 3);
        assert_eq!(
            plan.props.memory_types[synth].property_flags,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
        assert_eq!(plan.props.memory_types[synth].heap_index, 0);
        assert_eq!(plan.remap_type, 0);
    }

    #[test]
    fn test_non_host_visible_types_keep_their_heap() {
        let mut reported = unified_report(4 * GIB);
        reported.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let plan = MemoryPlan::virtualize(&reported, CAP);

        assert_eq!(plan.props.memory_types[0].heap_index, 1);
        // Device-local-only type stays on the original heap...
        assert_eq!(plan.props.memory_types[1].heap_index, 0);
        assert_eq!(plan.staging_type_mask, 0b01);
        // ...and suppresses the synthetic type.
        assert!(plan.synthetic_type.is_none());
    }

    #[test]
    fn test_small_heap_not_split() {
        let reported = unified_report(CAP / 2);
        let plan = MemoryPlan::virtualize(&reported, CAP);
        assert_eq!(plan.props.memory_heap_count, 1);
        assert_eq!(plan.props.memory_type_count, 2);
        assert!(plan.synthetic_type.is_none());
        assert_eq!(plan.staging_type_mask, 0);
    }

    #[test]
    fn test_synthetic_type_bit_is_disjoint_and_patched() {
        let plan = MemoryPlan::virtualize(&unified_report(4 * GIB), CAP);
        let synth = plan.synthetic_type.expect("synthetic type");
        // Disjoint from every real type bit.
        assert_eq!((0b11 >> synth) & 1, 0);
        assert_eq!(plan.patch_type_bits(0b01), 0b01 | (1 << synth));
        // Allocation against the synthetic type remaps to a real type.
        assert_eq!(plan.rewrite_allocation_type(synth), plan.remap_type);
        assert_eq!(plan.rewrite_allocation_type(0), 0);
    }

    #[test]
    fn test_staging_ledger_preflight() {
        let ledger = StagingLedger::new(100);
        ledger.reserve(1, 60).expect("within budget");
        assert_eq!(
            ledger.reserve(2, 60),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        // A rejected reservation leaves the total untouched.
        assert_eq!(ledger.total(), 60);
        ledger.release(1);
        assert_eq!(ledger.total(), 0);
        ledger.reserve(2, 100).expect("budget available again");
    }

    #[test]
    fn test_staging_ledger_rekey_preserves_total() {
        let ledger = StagingLedger::new(100);
        ledger.reserve(0xffff, 40).expect("preflight");
        ledger.rekey(0xffff, 7);
        assert_eq!(ledger.total(), 40);
        // Releasing under the preflight key is a no-op after rekey.
        ledger.release(0xffff);
        assert_eq!(ledger.total(), 40);
        ledger.release(7);
        assert_eq!(ledger.total(), 0);
    }
}
