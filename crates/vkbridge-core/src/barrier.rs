//! Synchronization2 barrier lowering.
//!
//! The bridge marshals the synchronization2 call shape unreliably (the
//! barrier record carries nested pointer arrays with 64-bit masks), so
//! `vkCmdPipelineBarrier2` is rewritten into the original
//! `vkCmdPipelineBarrier` call before it reaches the real driver.
//!
//! Mask narrowing never drops a bit: any stage bit above the low 32 maps
//! to ALL_COMMANDS and any access bit above the low 32 maps to
//! MEMORY_READ|MEMORY_WRITE. Over-synchronization is acceptable,
//! under-synchronization is not.

use ash::vk;

const LOW32: u64 = u32::MAX as u64;

fn narrow_stage(stage: vk::PipelineStageFlags2, empty: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    let raw = stage.as_raw();
    if raw == 0 {
        return empty;
    }
    let low = vk::PipelineStageFlags::from_raw((raw & LOW32) as u32);
    if raw & !LOW32 != 0 {
        low | vk::PipelineStageFlags::ALL_COMMANDS
    } else {
        low
    }
}

/// Narrow a source stage mask. NONE becomes TOP_OF_PIPE, which waits for
/// nothing, matching the sync2 meaning exactly.
pub fn narrow_src_stage(stage: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    narrow_stage(stage, vk::PipelineStageFlags::TOP_OF_PIPE)
}

/// Narrow a destination stage mask. NONE becomes BOTTOM_OF_PIPE, which
/// blocks nothing.
pub fn narrow_dst_stage(stage: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    narrow_stage(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
}

/// Narrow a 64-bit access mask to the legacy 32-bit form.
pub fn narrow_access(access: vk::AccessFlags2) -> vk::AccessFlags {
    let raw = access.as_raw();
    let low = vk::AccessFlags::from_raw((raw & LOW32) as u32);
    if raw & !LOW32 != 0 {
        low | vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE
    } else {
        low
    }
}

/// The lowered form of one dependency record: arguments for a single
/// `vkCmdPipelineBarrier` call.
pub struct LegacyBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    pub memory: Vec<vk::MemoryBarrier<'static>>,
    pub buffer: Vec<vk::BufferMemoryBarrier<'static>>,
    pub image: Vec<vk::ImageMemoryBarrier<'static>>,
}

/// Lower a synchronization2 dependency record.
///
/// The older call takes one source and one destination stage mask for
/// the whole batch, so the per-barrier stage masks are OR-combined; the
/// per-barrier access masks, resource ranges, layouts and queue family
/// transfers carry over unchanged.
///
/// # Safety
/// The barrier array pointers in `dep` must be valid for their declared
/// counts.
pub unsafe fn lower_dependency_info(dep: &vk::DependencyInfo<'_>) -> LegacyBarrier {
    let mut src_stage = vk::PipelineStageFlags::empty();
    let mut dst_stage = vk::PipelineStageFlags::empty();

    let mut memory = Vec::with_capacity(dep.memory_barrier_count as usize);
    for i in 0..dep.memory_barrier_count as usize {
        let b = unsafe { &*dep.p_memory_barriers.add(i) };
        src_stage |= narrow_src_stage(b.src_stage_mask);
        dst_stage |= narrow_dst_stage(b.dst_stage_mask);
        memory.push(
            vk::MemoryBarrier::default()
                .src_access_mask(narrow_access(b.src_access_mask))
                .dst_access_mask(narrow_access(b.dst_access_mask)),
        );
    }

    let mut buffer = Vec::with_capacity(dep.buffer_memory_barrier_count as usize);
    for i in 0..dep.buffer_memory_barrier_count as usize {
        let b = unsafe { &*dep.p_buffer_memory_barriers.add(i) };
        src_stage |= narrow_src_stage(b.src_stage_mask);
        dst_stage |= narrow_dst_stage(b.dst_stage_mask);
        buffer.push(
            vk::BufferMemoryBarrier::default()
                .src_access_mask(narrow_access(b.src_access_mask))
                .dst_access_mask(narrow_access(b.dst_access_mask))
                .src_queue_family_index(b.src_queue_family_index)
                .dst_queue_family_index(b.dst_queue_family_index)
                .buffer(b.buffer)
                .offset(b.offset)
                .size(b.size),
        );
    }

    let mut image = Vec::with_capacity(dep.image_memory_barrier_count as usize);
    for i in 0..dep.image_memory_barrier_count as usize {
        let b = unsafe { &*dep.p_image_memory_barriers.add(i) };
        src_stage |= narrow_src_stage(b.src_stage_mask);
        dst_stage |= narrow_dst_stage(b.dst_stage_mask);
        image.push(
            vk::ImageMemoryBarrier::default()
                .src_access_mask(narrow_access(b.src_access_mask))
                .dst_access_mask(narrow_access(b.dst_access_mask))
                .old_layout(b.old_layout)
                .new_layout(b.new_layout)
                .src_queue_family_index(b.src_queue_family_index)
                .dst_queue_family_index(b.dst_queue_family_index)
                .image(b.image)
                .subresource_range(b.subresource_range),
        );
    }

    if src_stage.is_empty() {
        src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if dst_stage.is_empty() {
        dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }

    LegacyBarrier {
        src_stage,
        dst_stage,
        dependency_flags: dep.dependency_flags,
        memory,
        buffer,
        image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_low32_masks_translate_exactly() {
        let mem = [vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::VERTEX_SHADER)
            .src_access_mask(vk::AccessFlags2::SHADER_READ)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)];
        let dep = vk::DependencyInfo::default().memory_barriers(&mem);

        let lowered = unsafe { lower_dependency_info(&dep) };
        assert_eq!(lowered.src_stage, vk::PipelineStageFlags::VERTEX_SHADER);
        assert_eq!(lowered.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(lowered.memory.len(), 1);
        assert_eq!(lowered.memory[0].src_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(lowered.memory[0].dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_high_stage_bits_widen_to_all_commands() {
        // COPY is a sync2-only stage above bit 31.
        let mem = [vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)];
        let dep = vk::DependencyInfo::default().memory_barriers(&mem);

        let lowered = unsafe { lower_dependency_info(&dep) };
        assert!(lowered.src_stage.contains(vk::PipelineStageFlags::ALL_COMMANDS));
        // The untouched direction stays exact.
        assert_eq!(lowered.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_high_access_bits_widen_to_memory_rw() {
        let exact = narrow_access(vk::AccessFlags2::SHADER_WRITE);
        let widened = narrow_access(vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(exact, vk::AccessFlags::SHADER_WRITE);
        assert!(widened.contains(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE));
        // Superset of the low-32-only translation, never a subset.
        assert!(widened.contains(narrow_access(
            vk::AccessFlags2::from_raw(vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw() & 0xffff_ffff)
        )));
    }

    #[test]
    fn test_none_stage_masks_do_not_over_block() {
        assert_eq!(
            narrow_src_stage(vk::PipelineStageFlags2::NONE),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(
            narrow_dst_stage(vk::PipelineStageFlags2::NONE),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
    }

    #[test]
    fn test_image_barrier_payload_carries_over() {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 1,
            level_count: 2,
            base_array_layer: 0,
            layer_count: 1,
        };
        let img = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(3)
            .dst_queue_family_index(5)
            .image(vk::Image::from_raw(0x77))
            .subresource_range(range)];
        let dep = vk::DependencyInfo::default().image_memory_barriers(&img);

        let lowered = unsafe { lower_dependency_info(&dep) };
        let out = &lowered.image[0];
        assert_eq!(out.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(out.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(out.src_queue_family_index, 3);
        assert_eq!(out.dst_queue_family_index, 5);
        assert_eq!(out.image, vk::Image::from_raw(0x77));
        assert_eq!(out.subresource_range.base_mip_level, 1);
    }
}
