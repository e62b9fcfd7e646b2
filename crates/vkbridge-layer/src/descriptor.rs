//! Descriptor updates with null-reference repair.
//!
//! The real driver dereferences descriptor writes eagerly, so absent
//! references are substituted with per-device dummy objects before
//! forwarding. Writes that cannot be repaired are dropped from the
//! batch; the remainder still lands.

use ash::vk::{self, Handle};
use tracing::{debug, warn};
use vkbridge_core::device_table::DeviceFns;
use vkbridge_core::null_guard::{repair_template_data, repair_writes, DummyObjects};
use vkbridge_core::BridgeState;

use crate::device::device_fns;

const DUMMY_BUFFER_BYTES: u64 = 256;
const DUMMY_IMAGE_EXTENT: u32 = 4;

fn first_memory_type(bits: u32) -> Option<u32> {
    if bits == 0 {
        None
    } else {
        Some(bits.trailing_zeros())
    }
}

unsafe fn alloc_and_bind_buffer(
    real_dev: vk::Device,
    fns: &DeviceFns,
    buffer: vk::Buffer,
) -> Option<vk::DeviceMemory> {
    let mut reqs = vk::MemoryRequirements::default();
    unsafe { (fns.get_buffer_memory_requirements)(real_dev, buffer, &mut reqs) };
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(first_memory_type(reqs.memory_type_bits)?);
    let mut memory = vk::DeviceMemory::null();
    if unsafe { (fns.allocate_memory)(real_dev, &info, std::ptr::null(), &mut memory) }
        != vk::Result::SUCCESS
    {
        return None;
    }
    if unsafe { (fns.bind_buffer_memory)(real_dev, buffer, memory, 0) } != vk::Result::SUCCESS {
        unsafe { (fns.free_memory)(real_dev, memory, std::ptr::null()) };
        return None;
    }
    Some(memory)
}

unsafe fn alloc_and_bind_image(
    real_dev: vk::Device,
    fns: &DeviceFns,
    image: vk::Image,
) -> Option<vk::DeviceMemory> {
    let mut reqs = vk::MemoryRequirements::default();
    unsafe { (fns.get_image_memory_requirements)(real_dev, image, &mut reqs) };
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(first_memory_type(reqs.memory_type_bits)?);
    let mut memory = vk::DeviceMemory::null();
    if unsafe { (fns.allocate_memory)(real_dev, &info, std::ptr::null(), &mut memory) }
        != vk::Result::SUCCESS
    {
        return None;
    }
    if unsafe { (fns.bind_image_memory)(real_dev, image, memory, 0) } != vk::Result::SUCCESS {
        unsafe { (fns.free_memory)(real_dev, memory, std::ptr::null()) };
        return None;
    }
    Some(memory)
}

/// Build the per-device dummy set on the real device. Partial failures
/// clean up behind themselves and give up; the guard then drops
/// unrepairable writes instead of substituting.
unsafe fn create_dummies(real_dev: vk::Device, fns: &DeviceFns) -> Option<DummyObjects> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(DUMMY_BUFFER_BYTES)
        .usage(
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let mut buffer = vk::Buffer::null();
    if unsafe { (fns.create_buffer)(real_dev, &buffer_info, std::ptr::null(), &mut buffer) }
        != vk::Result::SUCCESS
    {
        return None;
    }
    let Some(buffer_memory) = (unsafe { alloc_and_bind_buffer(real_dev, fns, buffer) }) else {
        unsafe { (fns.destroy_buffer)(real_dev, buffer, std::ptr::null()) };
        return None;
    };

    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width: DUMMY_IMAGE_EXTENT,
            height: DUMMY_IMAGE_EXTENT,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let destroy_buffer_side = |fns: &DeviceFns| unsafe {
        (fns.destroy_buffer)(real_dev, buffer, std::ptr::null());
        (fns.free_memory)(real_dev, buffer_memory, std::ptr::null());
    };
    let mut image = vk::Image::null();
    if unsafe { (fns.create_image)(real_dev, &image_info, std::ptr::null(), &mut image) }
        != vk::Result::SUCCESS
    {
        destroy_buffer_side(fns);
        return None;
    }
    let Some(image_memory) = (unsafe { alloc_and_bind_image(real_dev, fns, image) }) else {
        unsafe { (fns.destroy_image)(real_dev, image, std::ptr::null()) };
        destroy_buffer_side(fns);
        return None;
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let mut image_view = vk::ImageView::null();
    if unsafe { (fns.create_image_view)(real_dev, &view_info, std::ptr::null(), &mut image_view) }
        != vk::Result::SUCCESS
    {
        unsafe {
            (fns.destroy_image)(real_dev, image, std::ptr::null());
            (fns.free_memory)(real_dev, image_memory, std::ptr::null());
        }
        destroy_buffer_side(fns);
        return None;
    }

    let sampler_info = vk::SamplerCreateInfo::default();
    let mut sampler = vk::Sampler::null();
    if unsafe { (fns.create_sampler)(real_dev, &sampler_info, std::ptr::null(), &mut sampler) }
        != vk::Result::SUCCESS
    {
        unsafe {
            (fns.destroy_image_view)(real_dev, image_view, std::ptr::null());
            (fns.destroy_image)(real_dev, image, std::ptr::null());
            (fns.free_memory)(real_dev, image_memory, std::ptr::null());
        }
        destroy_buffer_side(fns);
        return None;
    }

    debug!(device = real_dev.as_raw(), "created dummy descriptor objects");
    Some(DummyObjects {
        buffer,
        buffer_memory,
        image,
        image_memory,
        image_view,
        sampler,
    })
}

/// The per-device dummies, created lazily on the first write that needs
/// them. `None` means creation failed once; it is not retried.
unsafe fn ensure_dummies(
    state: &BridgeState,
    real_dev: vk::Device,
    fns: &DeviceFns,
) -> Option<DummyObjects> {
    let guard = state.guard_for(real_dev.as_raw());
    let made = guard.ensure(|| unsafe { create_dummies(real_dev, fns) });
    made.copied()
}

#[no_mangle]
pub unsafe extern "C" fn vkUpdateDescriptorSets(
    device: vk::Device,
    descriptor_write_count: u32,
    p_descriptor_writes: *const vk::WriteDescriptorSet,
    descriptor_copy_count: u32,
    p_descriptor_copies: *const vk::CopyDescriptorSet,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        let writes = if descriptor_write_count == 0 || p_descriptor_writes.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(p_descriptor_writes, descriptor_write_count as usize)
        };
        let dummies = ensure_dummies(state, real_dev, &fns);
        let repaired = repair_writes(writes, dummies.as_ref());
        if repaired.dropped > 0 {
            warn!(
                dropped = repaired.dropped,
                forwarded = repaired.count(),
                "dropped unrepairable descriptor writes"
            );
        }
        (fns.update_descriptor_sets)(
            real_dev,
            repaired.count(),
            repaired.as_ptr(),
            descriptor_copy_count,
            p_descriptor_copies,
        );
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCreateDescriptorUpdateTemplate(
    device: vk::Device,
    p_create_info: *const vk::DescriptorUpdateTemplateCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_descriptor_update_template: *mut vk::DescriptorUpdateTemplate,
) -> vk::Result {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(create) = fns.create_descriptor_update_template else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    unsafe {
        let result = create(
            real_dev,
            p_create_info,
            p_allocator,
            p_descriptor_update_template,
        );
        if result == vk::Result::SUCCESS {
            state
                .templates
                .register((*p_descriptor_update_template).as_raw(), &*p_create_info);
        }
        result
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCreateDescriptorUpdateTemplateKHR(
    device: vk::Device,
    p_create_info: *const vk::DescriptorUpdateTemplateCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_descriptor_update_template: *mut vk::DescriptorUpdateTemplate,
) -> vk::Result {
    unsafe {
        vkCreateDescriptorUpdateTemplate(
            device,
            p_create_info,
            p_allocator,
            p_descriptor_update_template,
        )
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkDestroyDescriptorUpdateTemplate(
    device: vk::Device,
    descriptor_update_template: vk::DescriptorUpdateTemplate,
    p_allocator: *const vk::AllocationCallbacks,
) {
    if descriptor_update_template == vk::DescriptorUpdateTemplate::null() {
        return;
    }
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    if let Some(destroy) = fns.destroy_descriptor_update_template {
        unsafe { destroy(real_dev, descriptor_update_template, p_allocator) };
    }
    state.templates.retire(descriptor_update_template.as_raw());
}

#[no_mangle]
pub unsafe extern "C" fn vkDestroyDescriptorUpdateTemplateKHR(
    device: vk::Device,
    descriptor_update_template: vk::DescriptorUpdateTemplate,
    p_allocator: *const vk::AllocationCallbacks,
) {
    unsafe { vkDestroyDescriptorUpdateTemplate(device, descriptor_update_template, p_allocator) }
}

#[no_mangle]
pub unsafe extern "C" fn vkUpdateDescriptorSetWithTemplate(
    device: vk::Device,
    descriptor_set: vk::DescriptorSet,
    descriptor_update_template: vk::DescriptorUpdateTemplate,
    p_data: *const std::ffi::c_void,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    let Some(update) = fns.update_descriptor_set_with_template else {
        return;
    };
    let Some(entries) = state.templates.entries(descriptor_update_template.as_raw()) else {
        // Template created before the bridge saw it; forward untouched.
        unsafe { update(real_dev, descriptor_set, descriptor_update_template, p_data) };
        return;
    };
    unsafe {
        let dummies = ensure_dummies(state, real_dev, &fns);
        match repair_template_data(&entries, p_data, dummies.as_ref()) {
            Some(blob) => update(
                real_dev,
                descriptor_set,
                descriptor_update_template,
                blob.as_ptr() as *const std::ffi::c_void,
            ),
            None => {
                // Templated updates land atomically or not at all.
                warn!(
                    template = descriptor_update_template.as_raw(),
                    "dropping unrepairable templated descriptor update"
                );
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkUpdateDescriptorSetWithTemplateKHR(
    device: vk::Device,
    descriptor_set: vk::DescriptorSet,
    descriptor_update_template: vk::DescriptorUpdateTemplate,
    p_data: *const std::ffi::c_void,
) {
    unsafe {
        vkUpdateDescriptorSetWithTemplate(
            device,
            descriptor_set,
            descriptor_update_template,
            p_data,
        )
    }
}
