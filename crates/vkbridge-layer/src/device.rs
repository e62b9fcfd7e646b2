//! Device creation, teardown, and queue retrieval.
//!
//! Logical devices multiplex onto shared real devices, so creation
//! refcounts through [`DeviceTable`] and teardown only reaches the
//! real driver on the final release.

use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::vk::{self, Handle};
use dashmap::DashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};
use vkbridge_core::device_table::{query_device_fault, DeviceFns};
use vkbridge_core::error::soften_device_loss;
use vkbridge_core::forward::Pfn;
use vkbridge_core::{capability, BridgeState};

use crate::dispatch::{as_wrapper, real_device, real_physical_device, wrap_handle};
use crate::instance::{real_device_extensions, resolve_real};
use crate::physical_device::real_feature_support;

// Sharing makes real handles many-to-one, so per-real-device side tables
// are keyed by the real handle and cleaned up on the final release.
static DEVICE_GDPA: OnceLock<DashMap<u64, usize>> = OnceLock::new();
static QUEUE_FNS: OnceLock<DashMap<u64, (u64, Arc<DeviceFns>)>> = OnceLock::new();
static QUEUE_WRAPPERS: OnceLock<DashMap<u64, usize>> = OnceLock::new();
static DEVICE_QUEUES: OnceLock<DashMap<u64, Vec<u64>>> = OnceLock::new();

fn device_gdpa_map() -> &'static DashMap<u64, usize> {
    DEVICE_GDPA.get_or_init(DashMap::new)
}

fn queue_fns_map() -> &'static DashMap<u64, (u64, Arc<DeviceFns>)> {
    QUEUE_FNS.get_or_init(DashMap::new)
}

fn queue_wrappers() -> &'static DashMap<u64, usize> {
    QUEUE_WRAPPERS.get_or_init(DashMap::new)
}

fn device_queues() -> &'static DashMap<u64, Vec<u64>> {
    DEVICE_QUEUES.get_or_init(DashMap::new)
}

/// The real driver's device-level resolver for a real device.
pub(crate) fn device_gdpa(real: u64) -> Option<vk::PFN_vkGetDeviceProcAddr> {
    let raw = *device_gdpa_map().get(&real)?;
    // SAFETY: the slot was filled from the transmuted resolver itself.
    Some(unsafe { std::mem::transmute::<usize, vk::PFN_vkGetDeviceProcAddr>(raw) })
}

/// Real device and entry-point table behind a real queue handle.
pub(crate) fn queue_fns(real_queue: u64) -> Option<(vk::Device, Arc<DeviceFns>)> {
    queue_fns_map()
        .get(&real_queue)
        .map(|e| (vk::Device::from_raw(e.0), e.1.clone()))
}

/// Table of the real device behind a logical device wrapper.
pub(crate) unsafe fn device_fns(
    state: &BridgeState,
    device: vk::Device,
) -> Option<(vk::Device, Arc<DeviceFns>)> {
    let real = unsafe { real_device(device) };
    let info = state.devices.lookup(real.as_raw())?;
    Some((real, info.fns))
}

/// Filter the requested device extension list down to names the bridge
/// injected but the real driver cannot honor.
unsafe fn filter_extensions(
    names: *const *const c_char,
    count: u32,
    real_list: &[vk::ExtensionProperties],
) -> Vec<*const c_char> {
    let real_names: Vec<&CStr> = real_list
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .collect();
    let mut kept = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let ptr = unsafe { *names.add(i) };
        if ptr.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(ptr) };
        let real_has = real_names.iter().any(|n| *n == name);
        if capability::strip_on_create(name, real_has) {
            debug!(extension = ?name, "stripping injected extension from device create");
            continue;
        }
        kept.push(ptr);
    }
    kept
}

#[no_mangle]
pub unsafe extern "C" fn vkCreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    let state = BridgeState::get();
    let real_pd = unsafe { real_physical_device(physical_device) };

    let Some(create_pfn) = resolve_real(c"vkCreateDevice") else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(gdpa_pfn) = resolve_real(c"vkGetDeviceProcAddr") else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create: vk::PFN_vkCreateDevice = unsafe { std::mem::transmute(create_pfn) };
    let gdpa: vk::PFN_vkGetDeviceProcAddr = unsafe { std::mem::transmute(gdpa_pfn) };

    let real_list = match unsafe { real_device_extensions(real_pd) } {
        Ok(list) => list,
        Err(status) => return status,
    };

    let mut info = unsafe { *p_create_info };
    let kept = unsafe {
        filter_extensions(
            info.pp_enabled_extension_names,
            info.enabled_extension_count,
            &real_list,
        )
    };
    info.pp_enabled_extension_names = kept.as_ptr();
    info.enabled_extension_count = kept.len() as u32;
    // Features the bridge only pretends to have must not reach the
    // driver enabled. Booleans the driver actually claims stay on.
    let support = unsafe { real_feature_support(real_pd) };
    unsafe { capability::strip_create_info_features(&info, &support) };

    let created = state
        .devices
        .acquire(real_pd.as_raw(), state.config.share_device, || {
            let mut real_dev = vk::Device::null();
            // SAFETY: forwarding the client's call with the edited info.
            let result = unsafe { create(real_pd, &info, p_allocator, &mut real_dev) };
            let result = soften_device_loss(result, || {});
            if result != vk::Result::SUCCESS {
                return Err(result);
            }
            let fns = DeviceFns::load(|name| {
                // SAFETY: resolver bound to the device it just created.
                let resolved = unsafe { gdpa(real_dev, name.as_ptr()) };
                resolved.map(|f| unsafe { std::mem::transmute::<_, Pfn>(f) })
            })
            .map_err(|e| {
                warn!(error = %e, "real device is missing a core entry point");
                e.to_vk()
            })?;
            device_gdpa_map().insert(real_dev.as_raw(), gdpa as usize);
            Ok((real_dev.as_raw(), Arc::new(fns)))
        });
    let dev_info = match created {
        Ok(info) => info,
        Err(status) => return status,
    };

    match wrap_handle::<vk::Device>(state, dev_info.real) {
        Ok(wrapper) => {
            unsafe { *p_device = wrapper };
            vk::Result::SUCCESS
        }
        Err(status) => {
            state.devices.release(dev_info.real, |fns| {
                teardown_real_device(state, dev_info.real, fns);
            });
            status
        }
    }
}

/// Final-release cleanup: dummy objects, queue wrappers, resolver slot,
/// then the real device itself.
fn teardown_real_device(state: &BridgeState, real: u64, fns: &DeviceFns) {
    let real_dev = vk::Device::from_raw(real);
    let guard = state.guard_for(real);
    if let Some(dummies) = guard.current() {
        unsafe {
            (fns.destroy_sampler)(real_dev, dummies.sampler, std::ptr::null());
            (fns.destroy_image_view)(real_dev, dummies.image_view, std::ptr::null());
            (fns.destroy_image)(real_dev, dummies.image, std::ptr::null());
            (fns.free_memory)(real_dev, dummies.image_memory, std::ptr::null());
            (fns.destroy_buffer)(real_dev, dummies.buffer, std::ptr::null());
            (fns.free_memory)(real_dev, dummies.buffer_memory, std::ptr::null());
        }
    }
    state.forget_guard(real);

    if let Some((_, reals)) = device_queues().remove(&real) {
        for real_queue in reals {
            queue_fns_map().remove(&real_queue);
            if let Some((_, wrapper)) = queue_wrappers().remove(&real_queue) {
                unsafe {
                    state
                        .wrappers
                        .release(wrapper as *mut vkbridge_core::wrap::WrapperRecord)
                };
            }
        }
    }
    device_gdpa_map().remove(&real);

    unsafe { (fns.destroy_device)(real_dev, std::ptr::null()) };
}

#[no_mangle]
pub unsafe extern "C" fn vkDestroyDevice(
    device: vk::Device,
    _p_allocator: *const vk::AllocationCallbacks,
) {
    if device == vk::Device::null() {
        return;
    }
    let state = BridgeState::get();
    let real = unsafe { real_device(device) }.as_raw();
    state.devices.release(real, |fns| {
        teardown_real_device(state, real, fns);
    });
    unsafe { state.wrappers.release(as_wrapper(device)) };
}

unsafe fn wrap_queue(
    state: &BridgeState,
    real_dev: u64,
    real_queue: vk::Queue,
    fns: &Arc<DeviceFns>,
) -> vk::Queue {
    if real_queue == vk::Queue::null() {
        return vk::Queue::null();
    }
    let raw = real_queue.as_raw();
    if let Some(existing) = queue_wrappers().get(&raw) {
        return vk::Queue::from_raw(*existing as u64);
    }
    let Ok(wrapper) = wrap_handle::<vk::Queue>(state, raw) else {
        return vk::Queue::null();
    };
    let entry = *queue_wrappers().entry(raw).or_insert(wrapper.as_raw() as usize);
    if entry != wrapper.as_raw() as usize {
        unsafe { state.wrappers.release(as_wrapper(wrapper)) };
    } else {
        queue_fns_map().insert(raw, (real_dev, fns.clone()));
        device_queues().entry(real_dev).or_default().push(raw);
    }
    vk::Queue::from_raw(entry as u64)
}

#[no_mangle]
pub unsafe extern "C" fn vkGetDeviceQueue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        unsafe { *p_queue = vk::Queue::null() };
        return;
    };
    let mut real_queue = vk::Queue::null();
    unsafe {
        (fns.get_device_queue)(real_dev, queue_family_index, queue_index, &mut real_queue);
        *p_queue = wrap_queue(state, real_dev.as_raw(), real_queue, &fns);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetDeviceQueue2(
    device: vk::Device,
    p_queue_info: *const vk::DeviceQueueInfo2,
    p_queue: *mut vk::Queue,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        unsafe { *p_queue = vk::Queue::null() };
        return;
    };
    unsafe {
        let info = &*p_queue_info;
        let mut real_queue = vk::Queue::null();
        if let Some(get2) = fns.get_device_queue2 {
            get2(real_dev, p_queue_info, &mut real_queue);
        } else if info.flags.is_empty() {
            (fns.get_device_queue)(
                real_dev,
                info.queue_family_index,
                info.queue_index,
                &mut real_queue,
            );
        } else {
            // Flagged queues need the real 1.1 entry point.
            warn!("vkGetDeviceQueue2 with flags but no real entry point");
        }
        *p_queue = wrap_queue(state, real_dev.as_raw(), real_queue, &fns);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkDeviceWaitIdle(device: vk::Device) -> vk::Result {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let _guard = state.devices.queue_lock.lock();
    let result = unsafe { (fns.device_wait_idle)(real_dev) };
    if vkbridge_core::error::is_device_loss(result) {
        query_device_fault(real_dev, &fns);
    }
    result
}
