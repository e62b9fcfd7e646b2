//! Physical-device queries with edited answers.
//!
//! Three answer families are rewritten here: feature queries get the
//! spoofed booleans forced on, format queries get BC formats claimed,
//! and memory properties are replaced wholesale with the virtualized
//! layout.

use ash::vk;
use tracing::warn;
use vkbridge_core::capability::FeatureSupport;
use vkbridge_core::memory_props::MemoryPlan;
use vkbridge_core::{capability, BridgeState};

use crate::dispatch::real_physical_device;
use crate::instance::resolve_real;

unsafe fn real_memory_properties(real_pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceMemoryProperties") {
        unsafe {
            let get: vk::PFN_vkGetPhysicalDeviceMemoryProperties = std::mem::transmute(pfn);
            get(real_pd, &mut props);
        }
    } else {
        warn!("real driver lacks vkGetPhysicalDeviceMemoryProperties");
    }
    props
}

/// The virtualized memory plan for a real physical device, computing it
/// from the driver's report on first use.
pub(crate) unsafe fn memory_plan(state: &BridgeState, real_pd: vk::PhysicalDevice) -> MemoryPlan {
    use ash::vk::Handle;
    state.plan_for(real_pd.as_raw(), || unsafe {
        real_memory_properties(real_pd)
    })
}

/// Query the real driver's unedited claims for every spoofable feature
/// boolean. Drivers without a features2 entry point report only the
/// legacy block; everything chained counts as unsupported there, which
/// strips all of it on device creation.
pub(crate) unsafe fn real_feature_support(real_pd: vk::PhysicalDevice) -> FeatureSupport {
    let mut robustness = vk::PhysicalDeviceRobustness2FeaturesEXT::default();
    let mut border_color = vk::PhysicalDeviceCustomBorderColorFeaturesEXT::default();
    let mut depth_clip = vk::PhysicalDeviceDepthClipEnableFeaturesEXT::default();
    let mut cube_map = vk::PhysicalDeviceNonSeamlessCubeMapFeaturesEXT::default();
    let mut sync2 = vk::PhysicalDeviceSynchronization2Features::default();
    let mut xfb = vk::PhysicalDeviceTransformFeedbackFeaturesEXT::default();
    let mut maint5 = vk::PhysicalDeviceMaintenance5FeaturesKHR::default();
    let mut maint6 = vk::PhysicalDeviceMaintenance6FeaturesKHR::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut robustness)
        .push_next(&mut border_color)
        .push_next(&mut depth_clip)
        .push_next(&mut cube_map)
        .push_next(&mut sync2)
        .push_next(&mut xfb)
        .push_next(&mut maint5)
        .push_next(&mut maint6);

    if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFeatures2")
        .or_else(|| resolve_real(c"vkGetPhysicalDeviceFeatures2KHR"))
    {
        unsafe {
            let get: vk::PFN_vkGetPhysicalDeviceFeatures2 = std::mem::transmute(pfn);
            get(real_pd, &mut features);
        }
    } else if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFeatures") {
        unsafe {
            let get: vk::PFN_vkGetPhysicalDeviceFeatures = std::mem::transmute(pfn);
            get(real_pd, &mut features.features);
        }
    }
    unsafe { capability::query_support(&features) }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFeatures(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures,
) {
    let real_pd = unsafe { real_physical_device(physical_device) };
    if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFeatures") {
        unsafe {
            let get: vk::PFN_vkGetPhysicalDeviceFeatures = std::mem::transmute(pfn);
            get(real_pd, p_features);
        }
    }
    capability::spoof_features(unsafe { &mut *p_features });
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFeatures2(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2,
) {
    let real_pd = unsafe { real_physical_device(physical_device) };
    unsafe {
        if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFeatures2")
            .or_else(|| resolve_real(c"vkGetPhysicalDeviceFeatures2KHR"))
        {
            let get: vk::PFN_vkGetPhysicalDeviceFeatures2 = std::mem::transmute(pfn);
            get(real_pd, p_features);
        } else if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFeatures") {
            // Pre-1.1 driver: fill the core block, leave the chain zeroed.
            let get: vk::PFN_vkGetPhysicalDeviceFeatures = std::mem::transmute(pfn);
            get(real_pd, &mut (*p_features).features);
        }
        capability::spoof_features2(&mut *p_features);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFeatures2KHR(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures2,
) {
    unsafe { vkGetPhysicalDeviceFeatures2(physical_device, p_features) }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFormatProperties(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_format_properties: *mut vk::FormatProperties,
) {
    let real_pd = unsafe { real_physical_device(physical_device) };
    unsafe {
        if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFormatProperties") {
            let get: vk::PFN_vkGetPhysicalDeviceFormatProperties = std::mem::transmute(pfn);
            get(real_pd, format, p_format_properties);
        }
        capability::spoof_format_properties(format, &mut *p_format_properties);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFormatProperties2(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_format_properties: *mut vk::FormatProperties2,
) {
    let real_pd = unsafe { real_physical_device(physical_device) };
    unsafe {
        if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFormatProperties2")
            .or_else(|| resolve_real(c"vkGetPhysicalDeviceFormatProperties2KHR"))
        {
            let get: vk::PFN_vkGetPhysicalDeviceFormatProperties2 = std::mem::transmute(pfn);
            get(real_pd, format, p_format_properties);
        } else if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceFormatProperties") {
            let get: vk::PFN_vkGetPhysicalDeviceFormatProperties = std::mem::transmute(pfn);
            get(real_pd, format, &mut (*p_format_properties).format_properties);
        }
        capability::spoof_format_properties(format, &mut (*p_format_properties).format_properties);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceFormatProperties2KHR(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_format_properties: *mut vk::FormatProperties2,
) {
    unsafe { vkGetPhysicalDeviceFormatProperties2(physical_device, format, p_format_properties) }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceMemoryProperties(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    let state = BridgeState::get();
    unsafe {
        let real_pd = real_physical_device(physical_device);
        let plan = memory_plan(state, real_pd);
        *p_memory_properties = plan.props;
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceMemoryProperties2(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties2,
) {
    let state = BridgeState::get();
    unsafe {
        let real_pd = real_physical_device(physical_device);
        // Let the real driver fill any chained structures first, then
        // replace the core block with the virtualized layout.
        if let Some(pfn) = resolve_real(c"vkGetPhysicalDeviceMemoryProperties2")
            .or_else(|| resolve_real(c"vkGetPhysicalDeviceMemoryProperties2KHR"))
        {
            let get: vk::PFN_vkGetPhysicalDeviceMemoryProperties2 = std::mem::transmute(pfn);
            get(real_pd, p_memory_properties);
        }
        let plan = memory_plan(state, real_pd);
        (*p_memory_properties).memory_properties = plan.props;
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkGetPhysicalDeviceMemoryProperties2KHR(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties2,
) {
    unsafe { vkGetPhysicalDeviceMemoryProperties2(physical_device, p_memory_properties) }
}
