//! Real-device multiplexing.
//!
//! The driver underneath the translation layers corrupts state when two
//! real devices from the same physical device coexist, so by default all
//! logical devices the client creates share one real device. Each
//! `vkCreateDevice` after the first only bumps a reference count and
//! returns a fresh wrapper over the same real identity; the real device
//! is torn down when the last wrapper is destroyed.
//!
//! Sharing the real device also shares its queues, and the driver's queue
//! is not safe to use concurrently once shared, so every queue submission
//! and queue wait goes through [`DeviceTable::queue_lock`] for the full
//! duration of the real call. This is the only lock in the layer that is
//! held across a call into the real driver.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::forward::Pfn;

/// Resolved per-device entry points of the real driver.
///
/// Loaded once per real device through the driver's device-level resolver,
/// the same way the rest of the ecosystem loads a driver API by name.
pub struct DeviceFns {
    pub destroy_device: vk::PFN_vkDestroyDevice,
    pub get_device_queue: vk::PFN_vkGetDeviceQueue,
    pub device_wait_idle: vk::PFN_vkDeviceWaitIdle,
    pub queue_submit: vk::PFN_vkQueueSubmit,
    pub queue_wait_idle: vk::PFN_vkQueueWaitIdle,
    pub allocate_memory: vk::PFN_vkAllocateMemory,
    pub free_memory: vk::PFN_vkFreeMemory,
    pub map_memory: vk::PFN_vkMapMemory,
    pub unmap_memory: vk::PFN_vkUnmapMemory,
    pub get_buffer_memory_requirements: vk::PFN_vkGetBufferMemoryRequirements,
    pub get_image_memory_requirements: vk::PFN_vkGetImageMemoryRequirements,
    pub cmd_pipeline_barrier: vk::PFN_vkCmdPipelineBarrier,
    pub update_descriptor_sets: vk::PFN_vkUpdateDescriptorSets,
    pub create_buffer: vk::PFN_vkCreateBuffer,
    pub destroy_buffer: vk::PFN_vkDestroyBuffer,
    pub create_image: vk::PFN_vkCreateImage,
    pub destroy_image: vk::PFN_vkDestroyImage,
    pub create_image_view: vk::PFN_vkCreateImageView,
    pub destroy_image_view: vk::PFN_vkDestroyImageView,
    pub create_sampler: vk::PFN_vkCreateSampler,
    pub destroy_sampler: vk::PFN_vkDestroySampler,
    pub bind_buffer_memory: vk::PFN_vkBindBufferMemory,
    pub bind_image_memory: vk::PFN_vkBindImageMemory,
    pub allocate_command_buffers: vk::PFN_vkAllocateCommandBuffers,
    pub free_command_buffers: vk::PFN_vkFreeCommandBuffers,
    pub cmd_execute_commands: vk::PFN_vkCmdExecuteCommands,
    pub cmd_set_event: vk::PFN_vkCmdSetEvent,
    pub cmd_reset_event: vk::PFN_vkCmdResetEvent,
    pub cmd_write_timestamp: vk::PFN_vkCmdWriteTimestamp,
    pub cmd_set_line_width: vk::PFN_vkCmdSetLineWidth,
    pub cmd_set_depth_bias: vk::PFN_vkCmdSetDepthBias,
    pub cmd_set_depth_bounds: vk::PFN_vkCmdSetDepthBounds,
    pub cmd_set_blend_constants: vk::PFN_vkCmdSetBlendConstants,
    // 1.1+/extension entry points the driver may not expose.
    pub get_device_queue2: Option<vk::PFN_vkGetDeviceQueue2>,
    pub get_buffer_memory_requirements2: Option<vk::PFN_vkGetBufferMemoryRequirements2>,
    pub get_image_memory_requirements2: Option<vk::PFN_vkGetImageMemoryRequirements2>,
    pub get_device_buffer_memory_requirements:
        Option<vk::PFN_vkGetDeviceBufferMemoryRequirements>,
    pub get_device_image_memory_requirements:
        Option<vk::PFN_vkGetDeviceImageMemoryRequirements>,
    pub create_descriptor_update_template: Option<vk::PFN_vkCreateDescriptorUpdateTemplate>,
    pub destroy_descriptor_update_template: Option<vk::PFN_vkDestroyDescriptorUpdateTemplate>,
    pub update_descriptor_set_with_template: Option<vk::PFN_vkUpdateDescriptorSetWithTemplate>,
    pub get_device_fault_info: Option<vk::PFN_vkGetDeviceFaultInfoEXT>,
}

macro_rules! required_fn {
    ($get:expr, $name:literal) => {
        match $get(cstr(concat!($name, "\0"))) {
            // SAFETY: the driver resolved this pointer for exactly this name.
            Some(pfn) => unsafe { std::mem::transmute(pfn) },
            None => return Err(BridgeError::MissingEntryPoint($name)),
        }
    };
}

macro_rules! optional_fn {
    ($get:expr, $name:literal) => {
        // SAFETY: same as required_fn.
        $get(cstr(concat!($name, "\0"))).map(|pfn| unsafe { std::mem::transmute(pfn) })
    };
}

fn cstr(s: &str) -> &CStr {
    CStr::from_bytes_with_nul(s.as_bytes()).unwrap_or(c"")
}

impl DeviceFns {
    /// Resolve the entry points this layer calls directly. `get` is the
    /// real driver's device-level resolver bound to the real device;
    /// it may legitimately return null for post-1.0 names.
    pub fn load(get: impl Fn(&CStr) -> Option<Pfn>) -> Result<Self, BridgeError> {
        Ok(Self {
            destroy_device: required_fn!(get, "vkDestroyDevice"),
            get_device_queue: required_fn!(get, "vkGetDeviceQueue"),
            device_wait_idle: required_fn!(get, "vkDeviceWaitIdle"),
            queue_submit: required_fn!(get, "vkQueueSubmit"),
            queue_wait_idle: required_fn!(get, "vkQueueWaitIdle"),
            allocate_memory: required_fn!(get, "vkAllocateMemory"),
            free_memory: required_fn!(get, "vkFreeMemory"),
            map_memory: required_fn!(get, "vkMapMemory"),
            unmap_memory: required_fn!(get, "vkUnmapMemory"),
            get_buffer_memory_requirements: required_fn!(get, "vkGetBufferMemoryRequirements"),
            get_image_memory_requirements: required_fn!(get, "vkGetImageMemoryRequirements"),
            cmd_pipeline_barrier: required_fn!(get, "vkCmdPipelineBarrier"),
            update_descriptor_sets: required_fn!(get, "vkUpdateDescriptorSets"),
            create_buffer: required_fn!(get, "vkCreateBuffer"),
            destroy_buffer: required_fn!(get, "vkDestroyBuffer"),
            create_image: required_fn!(get, "vkCreateImage"),
            destroy_image: required_fn!(get, "vkDestroyImage"),
            create_image_view: required_fn!(get, "vkCreateImageView"),
            destroy_image_view: required_fn!(get, "vkDestroyImageView"),
            create_sampler: required_fn!(get, "vkCreateSampler"),
            destroy_sampler: required_fn!(get, "vkDestroySampler"),
            bind_buffer_memory: required_fn!(get, "vkBindBufferMemory"),
            bind_image_memory: required_fn!(get, "vkBindImageMemory"),
            allocate_command_buffers: required_fn!(get, "vkAllocateCommandBuffers"),
            free_command_buffers: required_fn!(get, "vkFreeCommandBuffers"),
            cmd_execute_commands: required_fn!(get, "vkCmdExecuteCommands"),
            cmd_set_event: required_fn!(get, "vkCmdSetEvent"),
            cmd_reset_event: required_fn!(get, "vkCmdResetEvent"),
            cmd_write_timestamp: required_fn!(get, "vkCmdWriteTimestamp"),
            cmd_set_line_width: required_fn!(get, "vkCmdSetLineWidth"),
            cmd_set_depth_bias: required_fn!(get, "vkCmdSetDepthBias"),
            cmd_set_depth_bounds: required_fn!(get, "vkCmdSetDepthBounds"),
            cmd_set_blend_constants: required_fn!(get, "vkCmdSetBlendConstants"),
            get_device_queue2: optional_fn!(get, "vkGetDeviceQueue2"),
            get_buffer_memory_requirements2: optional_fn!(get, "vkGetBufferMemoryRequirements2"),
            get_image_memory_requirements2: optional_fn!(get, "vkGetImageMemoryRequirements2"),
            get_device_buffer_memory_requirements: optional_fn!(
                get,
                "vkGetDeviceBufferMemoryRequirements"
            ),
            get_device_image_memory_requirements: optional_fn!(
                get,
                "vkGetDeviceImageMemoryRequirements"
            ),
            create_descriptor_update_template: optional_fn!(
                get,
                "vkCreateDescriptorUpdateTemplate"
            ),
            destroy_descriptor_update_template: optional_fn!(
                get,
                "vkDestroyDescriptorUpdateTemplate"
            ),
            update_descriptor_set_with_template: optional_fn!(
                get,
                "vkUpdateDescriptorSetWithTemplate"
            ),
            get_device_fault_info: optional_fn!(get, "vkGetDeviceFaultInfoEXT"),
        })
    }
}

/// A snapshot of one tracked real device.
#[derive(Clone)]
pub struct DeviceInfo {
    pub real: u64,
    pub physical: u64,
    pub fns: Arc<DeviceFns>,
}

struct SharedRecord {
    physical: u64,
    real: u64,
    refs: u32,
    fns: Arc<DeviceFns>,
}

/// Table of real devices, at most one per physical device while sharing
/// is enabled.
pub struct DeviceTable {
    records: Mutex<Vec<SharedRecord>>,
    // Serializes real-device creation so two racing vkCreateDevice calls
    // cannot both reach the real driver. Never taken while `records` is
    // held.
    create_gate: Mutex<()>,
    /// Held for the full duration of every real queue submission or wait.
    pub queue_lock: Mutex<()>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            create_gate: Mutex::new(()),
            queue_lock: Mutex::new(()),
        }
    }

    /// Acquire a real device for `physical`.
    ///
    /// With `share` set, the first caller creates the real device and
    /// later callers only increment the reference count; the client is
    /// told a new device exists each time. With `share` unset every call
    /// creates its own real device (refcounted at 1).
    pub fn acquire(
        &self,
        physical: u64,
        share: bool,
        create: impl FnOnce() -> Result<(u64, Arc<DeviceFns>), vk::Result>,
    ) -> Result<DeviceInfo, vk::Result> {
        let _gate = self.create_gate.lock();

        if share {
            let mut records = self.records.lock();
            if let Some(rec) = records.iter_mut().find(|r| r.physical == physical) {
                rec.refs += 1;
                debug!(physical, refs = rec.refs, "sharing existing real device");
                return Ok(DeviceInfo {
                    real: rec.real,
                    physical,
                    fns: rec.fns.clone(),
                });
            }
        }

        // No record: create the real device without holding `records`.
        let (real, fns) = create()?;
        info!(physical, real, share, "created real device");
        self.records.lock().push(SharedRecord {
            physical,
            real,
            refs: 1,
            fns: fns.clone(),
        });
        Ok(DeviceInfo {
            real,
            physical,
            fns,
        })
    }

    /// Release one reference on `real`. Only the drop below the
    /// zero threshold invokes `destroy`; returns whether it did.
    pub fn release(&self, real: u64, destroy: impl FnOnce(&DeviceFns)) -> bool {
        let record = {
            let mut records = self.records.lock();
            let Some(idx) = records.iter().position(|r| r.real == real) else {
                return false;
            };
            records[idx].refs -= 1;
            if records[idx].refs > 0 {
                debug!(real, refs = records[idx].refs, "logical device released");
                return false;
            }
            records.swap_remove(idx)
        };
        info!(real = record.real, "tearing down real device");
        destroy(&record.fns);
        true
    }

    pub fn lookup(&self, real: u64) -> Option<DeviceInfo> {
        let records = self.records.lock();
        records.iter().find(|r| r.real == real).map(|r| DeviceInfo {
            real: r.real,
            physical: r.physical,
            fns: r.fns.clone(),
        })
    }

    pub fn live_refs(&self, real: u64) -> u32 {
        let records = self.records.lock();
        records
            .iter()
            .find(|r| r.real == real)
            .map(|r| r.refs)
            .unwrap_or(0)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort device-fault diagnostic, attempted once per fatal event
/// before the status is downgraded. Only the fault counts are queried;
/// the result is logged and every failure is ignored.
pub fn query_device_fault(real: vk::Device, fns: &DeviceFns) {
    let Some(get_fault) = fns.get_device_fault_info else {
        return;
    };
    let mut counts = vk::DeviceFaultCountsEXT::default();
    // SAFETY: a null info pointer asks for counts only, per the extension.
    let res = unsafe { get_fault(real, &mut counts, std::ptr::null_mut()) };
    tracing::warn!(
        ?res,
        address_infos = counts.address_info_count,
        vendor_infos = counts.vendor_info_count,
        "device fault query"
    );
}
