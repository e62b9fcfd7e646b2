//! Default forwarding stubs.
//!
//! The large majority of entry points need no semantic change: the only
//! work is unwrapping the dispatchable first argument and tail-invoking
//! the real function with the remaining arguments untouched. The original
//! implementation emitted machine-code trampolines at runtime for this;
//! here each forwardable name gets a compile-time stub that passes its
//! trailing arguments as opaque machine words, and resolution time merely
//! records the real function pointer for that name.
//!
//! The resolved-pointer table is append-only: once a stub has been handed
//! to the loader its target never changes, so stub invocation takes no
//! lock beyond the sharded read in `DashMap`.
//!
//! Entry points with floating-point parameters are never routed through
//! word stubs (the words would land in the wrong registers); those few
//! are forwarded through explicitly typed intercepts in the layer crate.

use std::sync::OnceLock;

use ash::vk;
use dashmap::DashMap;

use crate::wrap::{unwrap_raw, WrapperRecord};

/// An opaque Vulkan entry point, as exchanged with the loader.
pub type Pfn = unsafe extern "C" fn();

static RESOLVED: OnceLock<DashMap<&'static str, usize>> = OnceLock::new();

fn resolved_table() -> &'static DashMap<&'static str, usize> {
    RESOLVED.get_or_init(DashMap::new)
}

fn resolved(name: &str) -> Option<usize> {
    resolved_table().get(name).map(|v| *v)
}

/// Record the real entry point for `name` and return the matching stub,
/// or `None` when no word stub exists for that name (the loader then
/// treats the function as unsupported by this layer).
pub fn make_forwarder(name: &str, real: Pfn) -> Option<Pfn> {
    let (canonical, stub) = stub_for(name)?;
    resolved_table().entry(canonical).or_insert(real as usize);
    Some(stub)
}

/// Whether `name` has a default-forward stub.
pub fn is_forwardable(name: &str) -> bool {
    stub_for(name).is_some()
}

const ERROR_UNRESOLVED: u64 = vk::Result::ERROR_UNKNOWN.as_raw() as i64 as u64;

macro_rules! word {
    ($x:ident) => {
        u64
    };
}

macro_rules! forward_stub {
    ($vk_name:literal, $fn_name:ident $(, $arg:ident)*) => {
        unsafe extern "C" fn $fn_name(
            handle: *const WrapperRecord,
            $($arg: word!($arg)),*
        ) -> u64 {
            // SAFETY: the loader only invokes this stub with a handle this
            // layer previously returned, which is always a wrapper record.
            let real = unsafe { unwrap_raw(handle) };
            let Some(pfn) = resolved($vk_name) else {
                return ERROR_UNRESOLVED;
            };
            // SAFETY: the pointer was stored for exactly this name, and
            // every trailing argument round-trips through a machine word.
            let f: unsafe extern "C" fn(u64 $(, word!($arg))*) -> u64 =
                unsafe { std::mem::transmute(pfn) };
            unsafe { f(real $(, $arg)*) }
        }
    };
}

macro_rules! forward_table {
    ($(($vk_name:literal, $fn_name:ident $(, $arg:ident)*)),* $(,)?) => {
        $(forward_stub!($vk_name, $fn_name $(, $arg)*);)*

        fn stub_for(name: &str) -> Option<(&'static str, Pfn)> {
            match name {
                $($vk_name => Some(($vk_name, unsafe {
                    std::mem::transmute($fn_name as *const ())
                })),)*
                _ => None,
            }
        }
    };
}

forward_table![
    // ── Physical-device queries without semantic change ─────
    ("vkGetPhysicalDeviceProperties", fwd_get_physical_device_properties, a),
    ("vkGetPhysicalDeviceProperties2", fwd_get_physical_device_properties2, a),
    ("vkGetPhysicalDeviceProperties2KHR", fwd_get_physical_device_properties2_khr, a),
    ("vkGetPhysicalDeviceQueueFamilyProperties", fwd_get_physical_device_queue_family_properties, a, b),
    ("vkGetPhysicalDeviceQueueFamilyProperties2", fwd_get_physical_device_queue_family_properties2, a, b),
    ("vkGetPhysicalDeviceQueueFamilyProperties2KHR", fwd_get_physical_device_queue_family_properties2_khr, a, b),
    ("vkGetPhysicalDeviceImageFormatProperties", fwd_get_physical_device_image_format_properties, a, b, c, d, e, f),
    ("vkGetPhysicalDeviceImageFormatProperties2", fwd_get_physical_device_image_format_properties2, a, b),
    ("vkGetPhysicalDeviceImageFormatProperties2KHR", fwd_get_physical_device_image_format_properties2_khr, a, b),
    ("vkGetPhysicalDeviceSparseImageFormatProperties", fwd_get_physical_device_sparse_image_format_properties, a, b, c, d, e, f, g),
    ("vkGetPhysicalDeviceSparseImageFormatProperties2", fwd_get_physical_device_sparse_image_format_properties2, a, b, c),
    ("vkGetPhysicalDeviceExternalBufferProperties", fwd_get_physical_device_external_buffer_properties, a, b),
    ("vkGetPhysicalDeviceExternalFenceProperties", fwd_get_physical_device_external_fence_properties, a, b),
    ("vkGetPhysicalDeviceExternalSemaphoreProperties", fwd_get_physical_device_external_semaphore_properties, a, b),
    // ── Device-level object creation/destruction ────────────
    ("vkCreateBuffer", fwd_create_buffer, a, b, c),
    ("vkDestroyBuffer", fwd_destroy_buffer, a, b),
    ("vkCreateBufferView", fwd_create_buffer_view, a, b, c),
    ("vkDestroyBufferView", fwd_destroy_buffer_view, a, b),
    ("vkCreateImage", fwd_create_image, a, b, c),
    ("vkDestroyImage", fwd_destroy_image, a, b),
    ("vkCreateImageView", fwd_create_image_view, a, b, c),
    ("vkDestroyImageView", fwd_destroy_image_view, a, b),
    ("vkCreateSampler", fwd_create_sampler, a, b, c),
    ("vkDestroySampler", fwd_destroy_sampler, a, b),
    ("vkCreateShaderModule", fwd_create_shader_module, a, b, c),
    ("vkDestroyShaderModule", fwd_destroy_shader_module, a, b),
    ("vkCreatePipelineLayout", fwd_create_pipeline_layout, a, b, c),
    ("vkDestroyPipelineLayout", fwd_destroy_pipeline_layout, a, b),
    ("vkCreatePipelineCache", fwd_create_pipeline_cache, a, b, c),
    ("vkDestroyPipelineCache", fwd_destroy_pipeline_cache, a, b),
    ("vkCreateGraphicsPipelines", fwd_create_graphics_pipelines, a, b, c, d, e),
    ("vkCreateComputePipelines", fwd_create_compute_pipelines, a, b, c, d, e),
    ("vkDestroyPipeline", fwd_destroy_pipeline, a, b),
    ("vkCreateDescriptorSetLayout", fwd_create_descriptor_set_layout, a, b, c),
    ("vkDestroyDescriptorSetLayout", fwd_destroy_descriptor_set_layout, a, b),
    ("vkCreateDescriptorPool", fwd_create_descriptor_pool, a, b, c),
    ("vkDestroyDescriptorPool", fwd_destroy_descriptor_pool, a, b),
    ("vkResetDescriptorPool", fwd_reset_descriptor_pool, a, b),
    ("vkAllocateDescriptorSets", fwd_allocate_descriptor_sets, a, b),
    ("vkFreeDescriptorSets", fwd_free_descriptor_sets, a, b, c),
    ("vkCreateFramebuffer", fwd_create_framebuffer, a, b, c),
    ("vkDestroyFramebuffer", fwd_destroy_framebuffer, a, b),
    ("vkCreateRenderPass", fwd_create_render_pass, a, b, c),
    ("vkCreateRenderPass2", fwd_create_render_pass2, a, b, c),
    ("vkDestroyRenderPass", fwd_destroy_render_pass, a, b),
    ("vkGetRenderAreaGranularity", fwd_get_render_area_granularity, a, b),
    ("vkCreateCommandPool", fwd_create_command_pool, a, b, c),
    ("vkDestroyCommandPool", fwd_destroy_command_pool, a, b),
    ("vkResetCommandPool", fwd_reset_command_pool, a, b),
    ("vkTrimCommandPool", fwd_trim_command_pool, a, b),
    ("vkCreateQueryPool", fwd_create_query_pool, a, b, c),
    ("vkDestroyQueryPool", fwd_destroy_query_pool, a, b),
    ("vkGetQueryPoolResults", fwd_get_query_pool_results, a, b, c, d, e, f, g),
    ("vkCreateEvent", fwd_create_event, a, b, c),
    ("vkDestroyEvent", fwd_destroy_event, a, b),
    ("vkGetEventStatus", fwd_get_event_status, a),
    ("vkSetEvent", fwd_set_event, a),
    ("vkResetEvent", fwd_reset_event, a),
    // ── Binding and synchronization primitives ──────────────
    ("vkBindBufferMemory", fwd_bind_buffer_memory, a, b, c),
    ("vkBindImageMemory", fwd_bind_image_memory, a, b, c),
    ("vkBindBufferMemory2", fwd_bind_buffer_memory2, a, b),
    ("vkBindImageMemory2", fwd_bind_image_memory2, a, b),
    ("vkCreateFence", fwd_create_fence, a, b, c),
    ("vkDestroyFence", fwd_destroy_fence, a, b),
    ("vkResetFences", fwd_reset_fences, a, b),
    ("vkGetFenceStatus", fwd_get_fence_status, a),
    ("vkWaitForFences", fwd_wait_for_fences, a, b, c, d),
    ("vkCreateSemaphore", fwd_create_semaphore, a, b, c),
    ("vkDestroySemaphore", fwd_destroy_semaphore, a, b),
    ("vkFlushMappedMemoryRanges", fwd_flush_mapped_memory_ranges, a, b),
    ("vkInvalidateMappedMemoryRanges", fwd_invalidate_mapped_memory_ranges, a, b),
    ("vkGetDeviceMemoryCommitment", fwd_get_device_memory_commitment, a, b),
    ("vkGetImageSubresourceLayout", fwd_get_image_subresource_layout, a, b, c),
    // ── Command buffer recording ────────────────────────────
    ("vkBeginCommandBuffer", fwd_begin_command_buffer, a),
    ("vkEndCommandBuffer", fwd_end_command_buffer),
    ("vkResetCommandBuffer", fwd_reset_command_buffer, a),
    ("vkCmdBindPipeline", fwd_cmd_bind_pipeline, a, b),
    ("vkCmdBindDescriptorSets", fwd_cmd_bind_descriptor_sets, a, b, c, d, e, f, g),
    ("vkCmdBindIndexBuffer", fwd_cmd_bind_index_buffer, a, b, c),
    ("vkCmdBindVertexBuffers", fwd_cmd_bind_vertex_buffers, a, b, c, d),
    ("vkCmdDraw", fwd_cmd_draw, a, b, c, d),
    ("vkCmdDrawIndexed", fwd_cmd_draw_indexed, a, b, c, d, e),
    ("vkCmdDrawIndirect", fwd_cmd_draw_indirect, a, b, c, d),
    ("vkCmdDrawIndexedIndirect", fwd_cmd_draw_indexed_indirect, a, b, c, d),
    ("vkCmdDispatch", fwd_cmd_dispatch, a, b, c),
    ("vkCmdDispatchIndirect", fwd_cmd_dispatch_indirect, a, b),
    ("vkCmdCopyBuffer", fwd_cmd_copy_buffer, a, b, c, d),
    ("vkCmdCopyImage", fwd_cmd_copy_image, a, b, c, d, e, f),
    ("vkCmdBlitImage", fwd_cmd_blit_image, a, b, c, d, e, f, g),
    ("vkCmdCopyBufferToImage", fwd_cmd_copy_buffer_to_image, a, b, c, d, e),
    ("vkCmdCopyImageToBuffer", fwd_cmd_copy_image_to_buffer, a, b, c, d, e),
    ("vkCmdUpdateBuffer", fwd_cmd_update_buffer, a, b, c, d),
    ("vkCmdFillBuffer", fwd_cmd_fill_buffer, a, b, c, d),
    ("vkCmdClearColorImage", fwd_cmd_clear_color_image, a, b, c, d, e),
    ("vkCmdClearDepthStencilImage", fwd_cmd_clear_depth_stencil_image, a, b, c, d, e),
    ("vkCmdClearAttachments", fwd_cmd_clear_attachments, a, b, c, d),
    ("vkCmdResolveImage", fwd_cmd_resolve_image, a, b, c, d, e, f),
    ("vkCmdSetViewport", fwd_cmd_set_viewport, a, b, c),
    ("vkCmdSetScissor", fwd_cmd_set_scissor, a, b, c),
    ("vkCmdSetStencilCompareMask", fwd_cmd_set_stencil_compare_mask, a, b),
    ("vkCmdSetStencilWriteMask", fwd_cmd_set_stencil_write_mask, a, b),
    ("vkCmdSetStencilReference", fwd_cmd_set_stencil_reference, a, b),
    ("vkCmdBeginRenderPass", fwd_cmd_begin_render_pass, a, b),
    ("vkCmdNextSubpass", fwd_cmd_next_subpass, a),
    ("vkCmdEndRenderPass", fwd_cmd_end_render_pass),
    ("vkCmdPipelineBarrier", fwd_cmd_pipeline_barrier, a, b, c, d, e, f, g, h, i),
    ("vkCmdSetEvent", fwd_cmd_set_event, a, b),
    ("vkCmdResetEvent", fwd_cmd_reset_event, a, b),
    ("vkCmdBeginQuery", fwd_cmd_begin_query, a, b, c),
    ("vkCmdEndQuery", fwd_cmd_end_query, a, b),
    ("vkCmdResetQueryPool", fwd_cmd_reset_query_pool, a, b, c),
    ("vkCmdWriteTimestamp", fwd_cmd_write_timestamp, a, b, c),
    ("vkCmdCopyQueryPoolResults", fwd_cmd_copy_query_pool_results, a, b, c, d, e, f, g),
    ("vkCmdPushConstants", fwd_cmd_push_constants, a, b, c, d, e),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrap::WrapTable;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEEN_HANDLE: AtomicU64 = AtomicU64::new(0);
    static SEEN_ARG: AtomicU64 = AtomicU64::new(0);

    unsafe extern "C" fn real_destroy_buffer(device: u64, buffer: u64, _alloc: u64) -> u64 {
        SEEN_HANDLE.store(device, Ordering::SeqCst);
        SEEN_ARG.store(buffer, Ordering::SeqCst);
        vk::Result::SUCCESS.as_raw() as i64 as u64
    }

    #[test]
    fn test_forwarder_unwraps_first_argument() {
        let table = WrapTable::new();
        let wrapper = table.wrap(0x1122_3344).expect("wrap");

        let stub = make_forwarder("vkDestroyBuffer", unsafe {
            std::mem::transmute(real_destroy_buffer as *const ())
        })
        .expect("vkDestroyBuffer is forwardable");

        let stub: unsafe extern "C" fn(*const WrapperRecord, u64, u64) -> u64 =
            unsafe { std::mem::transmute(stub) };
        unsafe { stub(wrapper, 0xabcd, 0) };

        assert_eq!(SEEN_HANDLE.load(Ordering::SeqCst), 0x1122_3344);
        assert_eq!(SEEN_ARG.load(Ordering::SeqCst), 0xabcd);
        unsafe { table.release(wrapper) };
    }

    #[test]
    fn test_unknown_name_has_no_forwarder() {
        assert!(!is_forwardable("vkCreateWin32SurfaceKHR"));
        assert!(make_forwarder("vkNotARealFunction", unsafe {
            std::mem::transmute(real_destroy_buffer as *const ())
        })
        .is_none());
    }

    #[test]
    fn test_float_entry_points_excluded() {
        // Word stubs would pass these in integer registers.
        assert!(!is_forwardable("vkCmdSetLineWidth"));
        assert!(!is_forwardable("vkCmdSetDepthBias"));
        assert!(!is_forwardable("vkCmdSetBlendConstants"));
    }

    #[test]
    fn test_edited_queries_excluded() {
        // The feature answer is spoofed by an intercept, never raw.
        assert!(!is_forwardable("vkGetPhysicalDeviceFeatures"));
        assert!(is_forwardable("vkGetPhysicalDeviceProperties"));
    }
}
