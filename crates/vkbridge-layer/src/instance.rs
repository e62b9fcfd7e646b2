//! Instance-scope entry points.
//!
//! The bridge reaches the real driver without a loader of its own, so
//! instance creation resolves the driver's global entry points directly
//! and remembers the one real instance for later instance-level
//! resolution.

use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use ash::vk::{self, Handle};
use dashmap::DashMap;
use tracing::{debug, warn};
use vkbridge_core::forward::Pfn;
use vkbridge_core::{capability, BridgeState};

use crate::dispatch::{as_wrapper, real_instance, real_physical_device, wrap_handle};

static REAL_INSTANCE: AtomicU64 = AtomicU64::new(0);
static PD_WRAPPERS: OnceLock<DashMap<u64, usize>> = OnceLock::new();

fn pd_wrappers() -> &'static DashMap<u64, usize> {
    PD_WRAPPERS.get_or_init(DashMap::new)
}

/// The real instance the bridge created, for instance-level resolution.
/// Null until `vkCreateInstance` has run.
pub(crate) fn current_real_instance() -> vk::Instance {
    vk::Instance::from_raw(REAL_INSTANCE.load(Ordering::Acquire))
}

/// Resolve an entry point against the real driver using the current
/// real instance.
pub(crate) fn resolve_real(name: &CStr) -> Option<Pfn> {
    BridgeState::get()
        .driver()?
        .resolve(current_real_instance(), name)
}

/// Wrapper for a real physical device, stable across repeated
/// enumerations so clients can use the handle as an identity.
pub(crate) fn wrap_physical_device(
    state: &BridgeState,
    real: u64,
) -> Result<vk::PhysicalDevice, vk::Result> {
    let map = pd_wrappers();
    if let Some(existing) = map.get(&real) {
        return Ok(vk::PhysicalDevice::from_raw(*existing as u64));
    }
    let wrapper: vk::PhysicalDevice = wrap_handle(state, real)?;
    let entry = *map.entry(real).or_insert(wrapper.as_raw() as usize);
    if entry != wrapper.as_raw() as usize {
        // Lost an enumeration race; keep the first wrapper.
        unsafe { state.wrappers.release(as_wrapper(wrapper)) };
    }
    Ok(vk::PhysicalDevice::from_raw(entry as u64))
}

/// Drop loader bookkeeping records from the head of a creation chain.
/// The real driver rejects structure types it does not know.
unsafe fn skip_loader_nodes(mut chain: *const c_void) -> *const c_void {
    loop {
        if chain.is_null() {
            return chain;
        }
        let node = unsafe { &*(chain as *const vk::BaseInStructure) };
        match node.s_type {
            vk::StructureType::LOADER_INSTANCE_CREATE_INFO
            | vk::StructureType::LOADER_DEVICE_CREATE_INFO => {
                chain = node.p_next as *const c_void;
            }
            _ => return chain,
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCreateInstance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    let state = BridgeState::install();
    let Some(driver) = state.driver() else {
        return vk::Result::ERROR_INCOMPATIBLE_DRIVER;
    };
    let Some(pfn) = driver.resolve(vk::Instance::null(), c"vkCreateInstance") else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create: vk::PFN_vkCreateInstance = unsafe { std::mem::transmute(pfn) };

    let mut info = unsafe { *p_create_info };
    info.p_next = unsafe { skip_loader_nodes(info.p_next) };

    let mut real = vk::Instance::null();
    let result = unsafe { create(&info, p_allocator, &mut real) };
    if result != vk::Result::SUCCESS {
        return result;
    }
    REAL_INSTANCE.store(real.as_raw(), Ordering::Release);
    debug!(real = real.as_raw(), "created real instance");

    match wrap_handle::<vk::Instance>(state, real.as_raw()) {
        Ok(wrapper) => {
            unsafe { *p_instance = wrapper };
            vk::Result::SUCCESS
        }
        Err(status) => {
            if let Some(pfn) = driver.resolve(real, c"vkDestroyInstance") {
                unsafe {
                    let destroy: vk::PFN_vkDestroyInstance = std::mem::transmute(pfn);
                    destroy(real, p_allocator);
                }
            }
            status
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkDestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let state = BridgeState::get();
    let real = unsafe { real_instance(instance) };

    if let Some(pfn) = state
        .driver()
        .and_then(|d| d.resolve(real, c"vkDestroyInstance"))
    {
        unsafe {
            let destroy: vk::PFN_vkDestroyInstance = std::mem::transmute(pfn);
            destroy(real, p_allocator);
        }
    }

    for entry in pd_wrappers().iter() {
        unsafe {
            state
                .wrappers
                .release(*entry.value() as *mut vkbridge_core::wrap::WrapperRecord);
        }
    }
    pd_wrappers().clear();
    unsafe { state.wrappers.release(as_wrapper(instance)) };
    REAL_INSTANCE.store(0, Ordering::Release);
}

#[no_mangle]
pub unsafe extern "C" fn vkEnumeratePhysicalDevices(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    if p_physical_device_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let state = BridgeState::get();
    let real = unsafe { real_instance(instance) };
    let Some(pfn) = resolve_real(c"vkEnumeratePhysicalDevices") else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let enumerate: vk::PFN_vkEnumeratePhysicalDevices = unsafe { std::mem::transmute(pfn) };

    if p_physical_devices.is_null() {
        return unsafe { enumerate(real, p_physical_device_count, std::ptr::null_mut()) };
    }

    let mut real_count = 0u32;
    let result = unsafe { enumerate(real, &mut real_count, std::ptr::null_mut()) };
    if result != vk::Result::SUCCESS {
        return result;
    }
    let mut reals = vec![vk::PhysicalDevice::null(); real_count as usize];
    let result = unsafe { enumerate(real, &mut real_count, reals.as_mut_ptr()) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return result;
    }

    let requested = unsafe { *p_physical_device_count } as usize;
    let count = std::cmp::min(requested, real_count as usize);
    for i in 0..count {
        match wrap_physical_device(state, reals[i].as_raw()) {
            Ok(wrapper) => unsafe { *p_physical_devices.add(i) = wrapper },
            Err(status) => return status,
        }
    }
    unsafe { *p_physical_device_count = count as u32 };
    if count < real_count as usize {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkEnumerateInstanceExtensionProperties(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    // Deny/inject editing applies at device scope only; the instance
    // list forwards as the driver reports it.
    let Some(pfn) = BridgeState::install()
        .driver()
        .and_then(|d| d.resolve(vk::Instance::null(), c"vkEnumerateInstanceExtensionProperties"))
    else {
        unsafe { *p_property_count = 0 };
        return vk::Result::SUCCESS;
    };
    unsafe {
        let enumerate: vk::PFN_vkEnumerateInstanceExtensionProperties = std::mem::transmute(pfn);
        enumerate(p_layer_name, p_property_count, p_properties)
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkEnumerateInstanceLayerProperties(
    p_property_count: *mut u32,
    _p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    // No nested layers underneath the bridge.
    unsafe { *p_property_count = 0 };
    vk::Result::SUCCESS
}

/// The real driver's device extension list, unedited. Shared with
/// device creation, which needs to know what the driver actually has.
pub(crate) unsafe fn real_device_extensions(
    real_pd: vk::PhysicalDevice,
) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
    let Some(pfn) = resolve_real(c"vkEnumerateDeviceExtensionProperties") else {
        return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
    };
    let enumerate: vk::PFN_vkEnumerateDeviceExtensionProperties = unsafe { std::mem::transmute(pfn) };

    let mut count = 0u32;
    let result = unsafe { enumerate(real_pd, std::ptr::null(), &mut count, std::ptr::null_mut()) };
    if result != vk::Result::SUCCESS {
        return Err(result);
    }
    let mut props = vec![vk::ExtensionProperties::default(); count as usize];
    let result = unsafe { enumerate(real_pd, std::ptr::null(), &mut count, props.as_mut_ptr()) };
    if result != vk::Result::SUCCESS && result != vk::Result::INCOMPLETE {
        return Err(result);
    }
    props.truncate(count as usize);
    Ok(props)
}

#[no_mangle]
pub unsafe extern "C" fn vkEnumerateDeviceExtensionProperties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if !p_layer_name.is_null() {
        unsafe { *p_property_count = 0 };
        return vk::Result::SUCCESS;
    }
    let real_pd = unsafe { real_physical_device(physical_device) };
    let real_list = match unsafe { real_device_extensions(real_pd) } {
        Ok(list) => list,
        Err(status) => {
            warn!(status = ?status, "device extension enumeration failed");
            unsafe { *p_property_count = 0 };
            return status;
        }
    };
    let edited = capability::edit_extension_list(&real_list);

    if p_properties.is_null() {
        unsafe { *p_property_count = edited.len() as u32 };
        return vk::Result::SUCCESS;
    }
    let requested = unsafe { *p_property_count } as usize;
    let count = std::cmp::min(requested, edited.len());
    for i in 0..count {
        unsafe { *p_properties.add(i) = edited[i] };
    }
    unsafe { *p_property_count = count as u32 };
    if count < edited.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}
