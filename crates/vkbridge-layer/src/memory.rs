//! Memory allocation, mapping, and requirements patching.
//!
//! Allocations against the synthetic device-local type are rewritten to
//! the real staging-capable type, staging allocations are budgeted with
//! a preflight reservation, and mappings beyond the mapped budget are
//! served from the shared scratch region instead of the real driver.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk::{self, Handle};
use tracing::{debug, warn};
use vkbridge_core::device_table::query_device_fault;
use vkbridge_core::error::soften_device_loss;
use vkbridge_core::map_budget::UnmapAction;
use vkbridge_core::memory_props::MemoryPlan;
use vkbridge_core::BridgeState;

use crate::device::device_fns;
use crate::physical_device::memory_plan;

// Reservation keys for allocations whose real handle does not exist yet.
// The high bit keeps them disjoint from driver handles.
static PREFLIGHT: AtomicU64 = AtomicU64::new(1);

fn preflight_key() -> u64 {
    PREFLIGHT.fetch_add(1, Ordering::Relaxed) | (1 << 63)
}

unsafe fn plan_of(state: &BridgeState, device: vk::Device) -> Option<MemoryPlan> {
    let real = unsafe { crate::dispatch::real_device(device) };
    let info = state.devices.lookup(real.as_raw())?;
    Some(unsafe { memory_plan(state, vk::PhysicalDevice::from_raw(info.physical)) })
}

#[no_mangle]
pub unsafe extern "C" fn vkAllocateMemory(
    device: vk::Device,
    p_allocate_info: *const vk::MemoryAllocateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_memory: *mut vk::DeviceMemory,
) -> vk::Result {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(plan) = (unsafe { plan_of(state, device) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let mut info = unsafe { *p_allocate_info };
    let real_type = plan.rewrite_allocation_type(info.memory_type_index);
    if real_type != info.memory_type_index {
        debug!(
            requested = info.memory_type_index,
            real = real_type,
            "remapping synthetic memory type"
        );
        info.memory_type_index = real_type;
    }

    // Staging allocations are budgeted before the driver sees them. The
    // reservation is keyed provisionally and moved onto the handle once
    // the allocation exists.
    let preflight = if plan.is_staging_type(real_type) {
        let key = preflight_key();
        if let Err(status) = state.staging.reserve(key, info.allocation_size) {
            warn!(
                size = info.allocation_size,
                total = state.staging.total(),
                "staging allocation budget exhausted"
            );
            return status;
        }
        Some(key)
    } else {
        None
    };

    let mut memory = vk::DeviceMemory::null();
    let result = unsafe { (fns.allocate_memory)(real_dev, &info, p_allocator, &mut memory) };
    let result = soften_device_loss(result, || query_device_fault(real_dev, &fns));
    match (result, preflight) {
        (vk::Result::SUCCESS, Some(key)) => state.staging.rekey(key, memory.as_raw()),
        (vk::Result::SUCCESS, None) => {}
        (_, Some(key)) => state.staging.release(key),
        (_, None) => {}
    }
    if result == vk::Result::SUCCESS {
        unsafe { *p_memory = memory };
    }
    result
}

#[no_mangle]
pub unsafe extern "C" fn vkFreeMemory(
    device: vk::Device,
    memory: vk::DeviceMemory,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if memory == vk::DeviceMemory::null() {
        return;
    }
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    // Freeing while mapped implies an unmap; retire any ledger record so
    // the budget does not leak.
    match state.map_ledger.unmap(memory.as_raw()) {
        UnmapAction::RealUnmap => unsafe { (fns.unmap_memory)(real_dev, memory) },
        UnmapAction::DropFake | UnmapAction::Untracked => {}
    }
    state.staging.release(memory.as_raw());
    unsafe { (fns.free_memory)(real_dev, memory, p_allocator) };
}

#[no_mangle]
pub unsafe extern "C" fn vkMapMemory(
    device: vk::Device,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    flags: vk::MemoryMapFlags,
    pp_data: *mut *mut std::ffi::c_void,
) -> vk::Result {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return vk::Result::ERROR_MEMORY_MAP_FAILED;
    };

    if state.map_ledger.try_reserve(memory.as_raw(), size) {
        let result = unsafe { (fns.map_memory)(real_dev, memory, offset, size, flags, pp_data) };
        if result != vk::Result::SUCCESS {
            state.map_ledger.cancel(memory.as_raw());
            return soften_device_loss(result, || query_device_fault(real_dev, &fns));
        }
        return vk::Result::SUCCESS;
    }

    // Over budget: the client gets a scratch pointer whose writes are
    // accepted and discarded.
    warn!(
        memory = memory.as_raw(),
        real_bytes = state.map_ledger.real_bytes(),
        "mapped budget exhausted, serving scratch mapping"
    );
    match state.map_ledger.map_fake(memory.as_raw(), size) {
        Ok(ptr) => {
            unsafe { *pp_data = ptr };
            vk::Result::SUCCESS
        }
        Err(status) => status,
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkUnmapMemory(device: vk::Device, memory: vk::DeviceMemory) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    // The ledger subtracts before the driver is called, so a client
    // re-mapping immediately afterwards sees the freed budget.
    match state.map_ledger.unmap(memory.as_raw()) {
        UnmapAction::RealUnmap | UnmapAction::Untracked => unsafe {
            (fns.unmap_memory)(real_dev, memory)
        },
        UnmapAction::DropFake => {
            debug!(memory = memory.as_raw(), "discarding scratch mapping");
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetBufferMemoryRequirements(
    device: vk::Device,
    buffer: vk::Buffer,
    p_memory_requirements: *mut vk::MemoryRequirements,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        (fns.get_buffer_memory_requirements)(real_dev, buffer, p_memory_requirements);
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut *p_memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetImageMemoryRequirements(
    device: vk::Device,
    image: vk::Image,
    p_memory_requirements: *mut vk::MemoryRequirements,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        (fns.get_image_memory_requirements)(real_dev, image, p_memory_requirements);
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut *p_memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetBufferMemoryRequirements2(
    device: vk::Device,
    p_info: *const vk::BufferMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        if let Some(get2) = fns.get_buffer_memory_requirements2 {
            get2(real_dev, p_info, p_memory_requirements);
        } else {
            (fns.get_buffer_memory_requirements)(
                real_dev,
                (*p_info).buffer,
                &mut (*p_memory_requirements).memory_requirements,
            );
        }
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut (*p_memory_requirements).memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetBufferMemoryRequirements2KHR(
    device: vk::Device,
    p_info: *const vk::BufferMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    unsafe { vkGetBufferMemoryRequirements2(device, p_info, p_memory_requirements) }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetImageMemoryRequirements2(
    device: vk::Device,
    p_info: *const vk::ImageMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        if let Some(get2) = fns.get_image_memory_requirements2 {
            get2(real_dev, p_info, p_memory_requirements);
        } else {
            (fns.get_image_memory_requirements)(
                real_dev,
                (*p_info).image,
                &mut (*p_memory_requirements).memory_requirements,
            );
        }
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut (*p_memory_requirements).memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetImageMemoryRequirements2KHR(
    device: vk::Device,
    p_info: *const vk::ImageMemoryRequirementsInfo2,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    unsafe { vkGetImageMemoryRequirements2(device, p_info, p_memory_requirements) }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetDeviceBufferMemoryRequirements(
    device: vk::Device,
    p_info: *const vk::DeviceBufferMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    let Some(get) = fns.get_device_buffer_memory_requirements else {
        warn!("real driver lacks vkGetDeviceBufferMemoryRequirements");
        return;
    };
    unsafe {
        get(real_dev, p_info, p_memory_requirements);
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut (*p_memory_requirements).memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetDeviceImageMemoryRequirements(
    device: vk::Device,
    p_info: *const vk::DeviceImageMemoryRequirements,
    p_memory_requirements: *mut vk::MemoryRequirements2,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    let Some(get) = fns.get_device_image_memory_requirements else {
        warn!("real driver lacks vkGetDeviceImageMemoryRequirements");
        return;
    };
    unsafe {
        get(real_dev, p_info, p_memory_requirements);
        if let Some(plan) = plan_of(state, device) {
            let reqs = &mut (*p_memory_requirements).memory_requirements;
            reqs.memory_type_bits = plan.patch_type_bits(reqs.memory_type_bits);
        }
    }
}
