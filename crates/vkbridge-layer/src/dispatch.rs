//! Handle translation between client-visible wrappers and real driver
//! identities.
//!
//! Every dispatchable handle handed to the client is a pointer to a
//! [`WrapperRecord`]; these helpers are the only place the layer's entry
//! points cast between the two views.

use ash::vk::{self, Handle};
use vkbridge_core::wrap::{unwrap_raw, WrapperRecord};
use vkbridge_core::BridgeState;

pub(crate) fn as_wrapper<T: Handle>(handle: T) -> *mut WrapperRecord {
    handle.as_raw() as *mut WrapperRecord
}

/// Real identity behind a wrapped dispatchable handle. Null stays null.
///
/// # Safety
/// A non-null `handle` must be a wrapper this layer produced.
pub(crate) unsafe fn real_of<T: Handle + Copy>(handle: T) -> u64 {
    if handle.as_raw() == 0 {
        return 0;
    }
    unsafe { unwrap_raw(as_wrapper(handle)) }
}

pub(crate) unsafe fn real_instance(instance: vk::Instance) -> vk::Instance {
    vk::Instance::from_raw(unsafe { real_of(instance) })
}

pub(crate) unsafe fn real_physical_device(pd: vk::PhysicalDevice) -> vk::PhysicalDevice {
    vk::PhysicalDevice::from_raw(unsafe { real_of(pd) })
}

pub(crate) unsafe fn real_device(device: vk::Device) -> vk::Device {
    vk::Device::from_raw(unsafe { real_of(device) })
}

pub(crate) unsafe fn real_queue(queue: vk::Queue) -> vk::Queue {
    vk::Queue::from_raw(unsafe { real_of(queue) })
}

pub(crate) unsafe fn real_command_buffer(cb: vk::CommandBuffer) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(unsafe { real_of(cb) })
}

/// Wrap a freshly produced real handle for the client.
pub(crate) fn wrap_handle<T: Handle>(state: &BridgeState, real: u64) -> Result<T, vk::Result> {
    match state.wrappers.wrap(real) {
        Ok(ptr) => Ok(T::from_raw(ptr as u64)),
        Err(e) => Err(e.to_vk()),
    }
}
