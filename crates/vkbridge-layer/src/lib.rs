//! Loader-facing surface of the bridge.
//!
//! Toward the loader this library is a layer: it negotiates the layer
//! interface and resolves entry points through the two proc-addr
//! functions below. Toward the real driver it acts as a loader of its
//! own, negotiating the ICD interface over `dlopen` (see
//! `vkbridge_core::driver`).
//!
//! Resolution order is always the same: an intercepted entry point wins,
//! anything else falls through to a default-forward word stub bound to
//! the real driver's pointer for that name.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;
use ash::vk::Handle;
use tracing::debug;
use vkbridge_core::forward::{self, Pfn};
use vkbridge_core::BridgeState;

mod command;
mod descriptor;
mod device;
mod dispatch;
mod instance;
mod memory;
mod physical_device;

/// Entry points resolvable before any instance exists.
unsafe fn global_intercept(name: &str) -> Option<Pfn> {
    unsafe {
        match name {
            "vkGetInstanceProcAddr" => {
                Some(std::mem::transmute(vkGetInstanceProcAddr as *const ()))
            }
            "vkGetDeviceProcAddr" => {
                Some(std::mem::transmute(vkGetDeviceProcAddr as *const ()))
            }
            "vkCreateInstance" => {
                Some(std::mem::transmute(instance::vkCreateInstance as *const ()))
            }
            "vkDestroyInstance" => {
                Some(std::mem::transmute(instance::vkDestroyInstance as *const ()))
            }
            "vkEnumeratePhysicalDevices" => {
                Some(std::mem::transmute(
                    instance::vkEnumeratePhysicalDevices as *const (),
                ))
            }
            "vkEnumerateInstanceExtensionProperties" => {
                Some(std::mem::transmute(
                    instance::vkEnumerateInstanceExtensionProperties as *const (),
                ))
            }
            "vkEnumerateInstanceLayerProperties" => {
                Some(std::mem::transmute(
                    instance::vkEnumerateInstanceLayerProperties as *const (),
                ))
            }
            _ => None,
        }
    }
}

/// Physical-device queries whose answers the bridge edits.
unsafe fn physical_device_intercept(name: &str) -> Option<Pfn> {
    unsafe {
        match name {
            "vkEnumerateDeviceExtensionProperties" => {
                Some(std::mem::transmute(
                    instance::vkEnumerateDeviceExtensionProperties as *const (),
                ))
            }
            "vkCreateDevice" => {
                Some(std::mem::transmute(device::vkCreateDevice as *const ()))
            }
            "vkGetPhysicalDeviceFeatures" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFeatures as *const (),
                ))
            }
            "vkGetPhysicalDeviceFeatures2" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFeatures2 as *const (),
                ))
            }
            "vkGetPhysicalDeviceFeatures2KHR" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFeatures2KHR as *const (),
                ))
            }
            "vkGetPhysicalDeviceFormatProperties" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFormatProperties as *const (),
                ))
            }
            "vkGetPhysicalDeviceFormatProperties2" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFormatProperties2 as *const (),
                ))
            }
            "vkGetPhysicalDeviceFormatProperties2KHR" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceFormatProperties2KHR as *const (),
                ))
            }
            "vkGetPhysicalDeviceMemoryProperties" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceMemoryProperties as *const (),
                ))
            }
            "vkGetPhysicalDeviceMemoryProperties2" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceMemoryProperties2 as *const (),
                ))
            }
            "vkGetPhysicalDeviceMemoryProperties2KHR" => {
                Some(std::mem::transmute(
                    physical_device::vkGetPhysicalDeviceMemoryProperties2KHR as *const (),
                ))
            }
            _ => None,
        }
    }
}

/// Device and queue scope entry points with bridge semantics.
unsafe fn device_intercept(name: &str) -> Option<Pfn> {
    unsafe {
        match name {
            "vkGetDeviceProcAddr" => {
                Some(std::mem::transmute(vkGetDeviceProcAddr as *const ()))
            }

            // ── Device lifetime and queues ──────────────────────
            "vkDestroyDevice" => {
                Some(std::mem::transmute(device::vkDestroyDevice as *const ()))
            }
            "vkGetDeviceQueue" => {
                Some(std::mem::transmute(device::vkGetDeviceQueue as *const ()))
            }
            "vkGetDeviceQueue2" => {
                Some(std::mem::transmute(device::vkGetDeviceQueue2 as *const ()))
            }
            "vkDeviceWaitIdle" => {
                Some(std::mem::transmute(device::vkDeviceWaitIdle as *const ()))
            }

            // ── Memory ──────────────────────────────────────────
            "vkAllocateMemory" => {
                Some(std::mem::transmute(memory::vkAllocateMemory as *const ()))
            }
            "vkFreeMemory" => {
                Some(std::mem::transmute(memory::vkFreeMemory as *const ()))
            }
            "vkMapMemory" => {
                Some(std::mem::transmute(memory::vkMapMemory as *const ()))
            }
            "vkUnmapMemory" => {
                Some(std::mem::transmute(memory::vkUnmapMemory as *const ()))
            }
            "vkGetBufferMemoryRequirements" => {
                Some(std::mem::transmute(
                    memory::vkGetBufferMemoryRequirements as *const (),
                ))
            }
            "vkGetImageMemoryRequirements" => {
                Some(std::mem::transmute(
                    memory::vkGetImageMemoryRequirements as *const (),
                ))
            }
            "vkGetBufferMemoryRequirements2" => {
                Some(std::mem::transmute(
                    memory::vkGetBufferMemoryRequirements2 as *const (),
                ))
            }
            "vkGetBufferMemoryRequirements2KHR" => {
                Some(std::mem::transmute(
                    memory::vkGetBufferMemoryRequirements2KHR as *const (),
                ))
            }
            "vkGetImageMemoryRequirements2" => {
                Some(std::mem::transmute(
                    memory::vkGetImageMemoryRequirements2 as *const (),
                ))
            }
            "vkGetImageMemoryRequirements2KHR" => {
                Some(std::mem::transmute(
                    memory::vkGetImageMemoryRequirements2KHR as *const (),
                ))
            }
            "vkGetDeviceBufferMemoryRequirements" => {
                Some(std::mem::transmute(
                    memory::vkGetDeviceBufferMemoryRequirements as *const (),
                ))
            }
            "vkGetDeviceImageMemoryRequirements" => {
                Some(std::mem::transmute(
                    memory::vkGetDeviceImageMemoryRequirements as *const (),
                ))
            }

            // ── Descriptors ─────────────────────────────────────
            "vkUpdateDescriptorSets" => {
                Some(std::mem::transmute(
                    descriptor::vkUpdateDescriptorSets as *const (),
                ))
            }
            "vkCreateDescriptorUpdateTemplate" => {
                Some(std::mem::transmute(
                    descriptor::vkCreateDescriptorUpdateTemplate as *const (),
                ))
            }
            "vkCreateDescriptorUpdateTemplateKHR" => {
                Some(std::mem::transmute(
                    descriptor::vkCreateDescriptorUpdateTemplateKHR as *const (),
                ))
            }
            "vkDestroyDescriptorUpdateTemplate" => {
                Some(std::mem::transmute(
                    descriptor::vkDestroyDescriptorUpdateTemplate as *const (),
                ))
            }
            "vkDestroyDescriptorUpdateTemplateKHR" => {
                Some(std::mem::transmute(
                    descriptor::vkDestroyDescriptorUpdateTemplateKHR as *const (),
                ))
            }
            "vkUpdateDescriptorSetWithTemplate" => {
                Some(std::mem::transmute(
                    descriptor::vkUpdateDescriptorSetWithTemplate as *const (),
                ))
            }
            "vkUpdateDescriptorSetWithTemplateKHR" => {
                Some(std::mem::transmute(
                    descriptor::vkUpdateDescriptorSetWithTemplateKHR as *const (),
                ))
            }

            // ── Command buffers and submission ──────────────────
            "vkAllocateCommandBuffers" => {
                Some(std::mem::transmute(
                    command::vkAllocateCommandBuffers as *const (),
                ))
            }
            "vkFreeCommandBuffers" => {
                Some(std::mem::transmute(
                    command::vkFreeCommandBuffers as *const (),
                ))
            }
            "vkCmdExecuteCommands" => {
                Some(std::mem::transmute(
                    command::vkCmdExecuteCommands as *const (),
                ))
            }
            "vkQueueSubmit" => {
                Some(std::mem::transmute(command::vkQueueSubmit as *const ()))
            }
            "vkQueueSubmit2" => {
                Some(std::mem::transmute(command::vkQueueSubmit2 as *const ()))
            }
            "vkQueueSubmit2KHR" => {
                Some(std::mem::transmute(command::vkQueueSubmit2KHR as *const ()))
            }
            "vkQueueWaitIdle" => {
                Some(std::mem::transmute(command::vkQueueWaitIdle as *const ()))
            }

            // ── Synchronization2 lowering ───────────────────────
            "vkCmdPipelineBarrier2" => {
                Some(std::mem::transmute(
                    command::vkCmdPipelineBarrier2 as *const (),
                ))
            }
            "vkCmdPipelineBarrier2KHR" => {
                Some(std::mem::transmute(
                    command::vkCmdPipelineBarrier2KHR as *const (),
                ))
            }
            "vkCmdSetEvent2" => {
                Some(std::mem::transmute(command::vkCmdSetEvent2 as *const ()))
            }
            "vkCmdSetEvent2KHR" => {
                Some(std::mem::transmute(command::vkCmdSetEvent2KHR as *const ()))
            }
            "vkCmdResetEvent2" => {
                Some(std::mem::transmute(command::vkCmdResetEvent2 as *const ()))
            }
            "vkCmdResetEvent2KHR" => {
                Some(std::mem::transmute(command::vkCmdResetEvent2KHR as *const ()))
            }
            "vkCmdWriteTimestamp2" => {
                Some(std::mem::transmute(
                    command::vkCmdWriteTimestamp2 as *const (),
                ))
            }
            "vkCmdWriteTimestamp2KHR" => {
                Some(std::mem::transmute(
                    command::vkCmdWriteTimestamp2KHR as *const (),
                ))
            }

            // ── Float-argument setters (never word-forwarded) ───
            "vkCmdSetLineWidth" => {
                Some(std::mem::transmute(command::vkCmdSetLineWidth as *const ()))
            }
            "vkCmdSetDepthBias" => {
                Some(std::mem::transmute(command::vkCmdSetDepthBias as *const ()))
            }
            "vkCmdSetDepthBounds" => {
                Some(std::mem::transmute(
                    command::vkCmdSetDepthBounds as *const (),
                ))
            }
            "vkCmdSetBlendConstants" => {
                Some(std::mem::transmute(
                    command::vkCmdSetBlendConstants as *const (),
                ))
            }
            _ => None,
        }
    }
}

/// Layer entry resolution for instance scope. The loader also routes
/// device-scope queries through here before a device exists.
#[no_mangle]
pub unsafe extern "C" fn vkGetInstanceProcAddr(
    _instance: vk::Instance,
    p_name: *const c_char,
) -> Option<Pfn> {
    if p_name.is_null() {
        return None;
    }
    let cname = unsafe { CStr::from_ptr(p_name) };
    let name = cname.to_str().ok()?;

    unsafe {
        if let Some(pfn) = global_intercept(name) {
            return Some(pfn);
        }
        if let Some(pfn) = physical_device_intercept(name) {
            return Some(pfn);
        }
        if let Some(pfn) = device_intercept(name) {
            return Some(pfn);
        }
    }

    // No semantic change: bind a word stub to the real pointer.
    let real = instance::resolve_real(cname)?;
    let stub = forward::make_forwarder(name, real);
    if stub.is_none() {
        debug!(name, "no forward stub, reporting unsupported");
    }
    stub
}

/// Layer entry resolution for device scope.
#[no_mangle]
pub unsafe extern "C" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> Option<Pfn> {
    if p_name.is_null() {
        return None;
    }
    unsafe {
        let cname = CStr::from_ptr(p_name);
        let name = cname.to_str().ok()?;

        if let Some(pfn) = device_intercept(name) {
            return Some(pfn);
        }

        let real_dev = dispatch::real_device(device);
        let gdpa = device::device_gdpa(real_dev.as_raw())?;
        let real = gdpa(real_dev, p_name)?;
        forward::make_forwarder(name, std::mem::transmute(real))
    }
}

/// Resolution slot for uninstanced physical-device extension entry
/// points. Only names the bridge intercepts resolve here; everything
/// else goes back through `vkGetInstanceProcAddr`.
unsafe extern "C" fn vkGetPhysicalDeviceProcAddr(
    _instance: vk::Instance,
    p_name: *const c_char,
) -> Option<Pfn> {
    if p_name.is_null() {
        return None;
    }
    unsafe {
        let name = CStr::from_ptr(p_name).to_str().ok()?;
        physical_device_intercept(name)
    }
}

const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;
const MIN_LAYER_INTERFACE_VERSION: u32 = 2;
const CURRENT_LAYER_INTERFACE_VERSION: u32 = 2;

/// Mirror of `VkNegotiateLayerInterface` from the loader-layer
/// interface.
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr:
        Option<unsafe extern "C" fn(vk::Instance, *const c_char) -> Option<Pfn>>,
    pub pfn_get_device_proc_addr:
        Option<unsafe extern "C" fn(vk::Device, *const c_char) -> Option<Pfn>>,
    pub pfn_get_physical_device_proc_addr:
        Option<unsafe extern "C" fn(vk::Instance, *const c_char) -> Option<Pfn>>,
}

/// Layer interface negotiation, the loader's first call into this
/// library.
#[no_mangle]
pub unsafe extern "C" fn vkNegotiateLoaderLayerInterface(
    p_interface: *mut NegotiateLayerInterface,
) -> vk::Result {
    if p_interface.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let interface = unsafe { &mut *p_interface };
    if interface.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if interface.loader_layer_interface_version < MIN_LAYER_INTERFACE_VERSION {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    BridgeState::install();
    interface.loader_layer_interface_version = CURRENT_LAYER_INTERFACE_VERSION;
    interface.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
    interface.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
    interface.pfn_get_physical_device_proc_addr = Some(vkGetPhysicalDeviceProcAddr);
    debug!(
        version = interface.loader_layer_interface_version,
        "negotiated layer interface"
    );
    vk::Result::SUCCESS
}
