//! Command buffers, submission, and synchronization2 lowering.
//!
//! Command buffers are dispatchable, so allocation wraps each handle
//! and recording intercepts unwrap them. Submission holds the
//! process-wide queue lock for the duration of the real driver call;
//! the synchronization2 entry points are transcoded to their 1.0
//! equivalents because the real driver only pretends to support them.

use std::sync::Arc;
use std::sync::OnceLock;

use ash::vk::{self, Handle};
use dashmap::DashMap;
use tracing::warn;
use vkbridge_core::barrier::{lower_dependency_info, narrow_src_stage};
use vkbridge_core::device_table::{query_device_fault, DeviceFns};
use vkbridge_core::error::is_device_loss;
use vkbridge_core::BridgeState;

use crate::device::{device_fns, queue_fns};
use crate::dispatch::{as_wrapper, real_command_buffer, real_queue, wrap_handle};

static CB_FNS: OnceLock<DashMap<u64, Arc<DeviceFns>>> = OnceLock::new();

fn cb_fns_map() -> &'static DashMap<u64, Arc<DeviceFns>> {
    CB_FNS.get_or_init(DashMap::new)
}

unsafe fn cb_fns(cb: vk::CommandBuffer) -> Option<(vk::CommandBuffer, Arc<DeviceFns>)> {
    let real = unsafe { real_command_buffer(cb) };
    let fns = cb_fns_map().get(&real.as_raw())?.clone();
    Some((real, fns))
}

#[no_mangle]
pub unsafe extern "C" fn vkAllocateCommandBuffers(
    device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    unsafe {
        let count = (*p_allocate_info).command_buffer_count as usize;
        let mut reals = vec![vk::CommandBuffer::null(); count];
        let result = (fns.allocate_command_buffers)(real_dev, p_allocate_info, reals.as_mut_ptr());
        if result != vk::Result::SUCCESS {
            return result;
        }
        for (i, real) in reals.iter().enumerate() {
            match wrap_handle::<vk::CommandBuffer>(state, real.as_raw()) {
                Ok(wrapper) => {
                    cb_fns_map().insert(real.as_raw(), fns.clone());
                    *p_command_buffers.add(i) = wrapper;
                }
                Err(status) => {
                    // Unwind the batch: the client sees all-or-nothing.
                    for j in 0..i {
                        let wrapper = *p_command_buffers.add(j);
                        cb_fns_map().remove(&reals[j].as_raw());
                        state.wrappers.release(as_wrapper(wrapper));
                    }
                    (fns.free_command_buffers)(
                        real_dev,
                        (*p_allocate_info).command_pool,
                        count as u32,
                        reals.as_ptr(),
                    );
                    return status;
                }
            }
        }
    }
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "C" fn vkFreeCommandBuffers(
    device: vk::Device,
    command_pool: vk::CommandPool,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    let state = BridgeState::get();
    let Some((real_dev, fns)) = (unsafe { device_fns(state, device) }) else {
        return;
    };
    unsafe {
        let mut reals = Vec::with_capacity(command_buffer_count as usize);
        for i in 0..command_buffer_count as usize {
            let wrapper = *p_command_buffers.add(i);
            if wrapper == vk::CommandBuffer::null() {
                continue;
            }
            let real = real_command_buffer(wrapper);
            cb_fns_map().remove(&real.as_raw());
            state.wrappers.release(as_wrapper(wrapper));
            reals.push(real);
        }
        (fns.free_command_buffers)(real_dev, command_pool, reals.len() as u32, reals.as_ptr());
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdExecuteCommands(
    command_buffer: vk::CommandBuffer,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    let Some((real_cb, fns)) = (unsafe { cb_fns(command_buffer) }) else {
        return;
    };
    unsafe {
        let mut reals = Vec::with_capacity(command_buffer_count as usize);
        for i in 0..command_buffer_count as usize {
            reals.push(real_command_buffer(*p_command_buffers.add(i)));
        }
        (fns.cmd_execute_commands)(real_cb, reals.len() as u32, reals.as_ptr());
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkQueueSubmit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo,
    fence: vk::Fence,
) -> vk::Result {
    let state = BridgeState::get();
    let real_q = unsafe { real_queue(queue) };
    let Some((real_dev, fns)) = queue_fns(real_q.as_raw()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    // Rebuild each submit with unwrapped command buffers. The inner
    // vectors must outlive the driver call, so they are kept alongside
    // the rewritten infos.
    let mut cb_arrays: Vec<Vec<vk::CommandBuffer>> = Vec::with_capacity(submit_count as usize);
    let mut submits: Vec<vk::SubmitInfo> = Vec::with_capacity(submit_count as usize);
    for i in 0..submit_count as usize {
        let mut submit = unsafe { *p_submits.add(i) };
        let mut reals = Vec::with_capacity(submit.command_buffer_count as usize);
        for j in 0..submit.command_buffer_count as usize {
            reals.push(unsafe { real_command_buffer(*submit.p_command_buffers.add(j)) });
        }
        cb_arrays.push(reals);
        let stored = cb_arrays
            .last()
            .map(|v| v.as_ptr())
            .unwrap_or(std::ptr::null());
        submit.p_command_buffers = stored;
        submits.push(submit);
    }

    let _guard = state.devices.queue_lock.lock();
    let result = unsafe { (fns.queue_submit)(real_q, submits.len() as u32, submits.as_ptr(), fence) };
    if is_device_loss(result) {
        query_device_fault(real_dev, &fns);
    }
    result
}

/// Lower a synchronization2 submission to the 1.0 entry point. Timeline
/// semaphore values in the info structs are not carried over.
#[no_mangle]
pub unsafe extern "C" fn vkQueueSubmit2(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    let state = BridgeState::get();
    let real_q = unsafe { real_queue(queue) };
    let Some((real_dev, fns)) = queue_fns(real_q.as_raw()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    struct LoweredSubmit {
        waits: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        cbs: Vec<vk::CommandBuffer>,
        signals: Vec<vk::Semaphore>,
    }

    let mut lowered: Vec<LoweredSubmit> = Vec::with_capacity(submit_count as usize);
    for i in 0..submit_count as usize {
        let submit = unsafe { &*p_submits.add(i) };
        let mut entry = LoweredSubmit {
            waits: Vec::with_capacity(submit.wait_semaphore_info_count as usize),
            wait_stages: Vec::with_capacity(submit.wait_semaphore_info_count as usize),
            cbs: Vec::with_capacity(submit.command_buffer_info_count as usize),
            signals: Vec::with_capacity(submit.signal_semaphore_info_count as usize),
        };
        for j in 0..submit.wait_semaphore_info_count as usize {
            let info = unsafe { &*submit.p_wait_semaphore_infos.add(j) };
            entry.waits.push(info.semaphore);
            entry
                .wait_stages
                .push(vkbridge_core::barrier::narrow_dst_stage(info.stage_mask));
        }
        for j in 0..submit.command_buffer_info_count as usize {
            let info = unsafe { &*submit.p_command_buffer_infos.add(j) };
            entry.cbs.push(unsafe { real_command_buffer(info.command_buffer) });
        }
        for j in 0..submit.signal_semaphore_info_count as usize {
            let info = unsafe { &*submit.p_signal_semaphore_infos.add(j) };
            entry.signals.push(info.semaphore);
        }
        lowered.push(entry);
    }

    let submits: Vec<vk::SubmitInfo> = lowered
        .iter()
        .map(|e| {
            vk::SubmitInfo::default()
                .wait_semaphores(&e.waits)
                .wait_dst_stage_mask(&e.wait_stages)
                .command_buffers(&e.cbs)
                .signal_semaphores(&e.signals)
        })
        .collect();

    let _guard = state.devices.queue_lock.lock();
    let result = unsafe { (fns.queue_submit)(real_q, submits.len() as u32, submits.as_ptr(), fence) };
    if is_device_loss(result) {
        query_device_fault(real_dev, &fns);
    }
    result
}

#[no_mangle]
pub unsafe extern "C" fn vkQueueSubmit2KHR(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { vkQueueSubmit2(queue, submit_count, p_submits, fence) }
}

#[no_mangle]
pub unsafe extern "C" fn vkQueueWaitIdle(queue: vk::Queue) -> vk::Result {
    let state = BridgeState::get();
    let real_q = unsafe { real_queue(queue) };
    let Some((real_dev, fns)) = queue_fns(real_q.as_raw()) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let _guard = state.devices.queue_lock.lock();
    let result = unsafe { (fns.queue_wait_idle)(real_q) };
    if is_device_loss(result) {
        query_device_fault(real_dev, &fns);
    }
    result
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdPipelineBarrier2(
    command_buffer: vk::CommandBuffer,
    p_dependency_info: *const vk::DependencyInfo,
) {
    let Some((real_cb, fns)) = (unsafe { cb_fns(command_buffer) }) else {
        return;
    };
    unsafe {
        let lowered = lower_dependency_info(&*p_dependency_info);
        (fns.cmd_pipeline_barrier)(
            real_cb,
            lowered.src_stage,
            lowered.dst_stage,
            lowered.dependency_flags,
            lowered.memory.len() as u32,
            lowered.memory.as_ptr(),
            lowered.buffer.len() as u32,
            lowered.buffer.as_ptr(),
            lowered.image.len() as u32,
            lowered.image.as_ptr(),
        );
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdPipelineBarrier2KHR(
    command_buffer: vk::CommandBuffer,
    p_dependency_info: *const vk::DependencyInfo,
) {
    unsafe { vkCmdPipelineBarrier2(command_buffer, p_dependency_info) }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetEvent2(
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    p_dependency_info: *const vk::DependencyInfo,
) {
    let Some((real_cb, fns)) = (unsafe { cb_fns(command_buffer) }) else {
        return;
    };
    unsafe {
        let lowered = lower_dependency_info(&*p_dependency_info);
        (fns.cmd_set_event)(real_cb, event, lowered.src_stage);
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetEvent2KHR(
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    p_dependency_info: *const vk::DependencyInfo,
) {
    unsafe { vkCmdSetEvent2(command_buffer, event, p_dependency_info) }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdResetEvent2(
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    stage_mask: vk::PipelineStageFlags2,
) {
    let Some((real_cb, fns)) = (unsafe { cb_fns(command_buffer) }) else {
        return;
    };
    unsafe { (fns.cmd_reset_event)(real_cb, event, narrow_src_stage(stage_mask)) };
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdResetEvent2KHR(
    command_buffer: vk::CommandBuffer,
    event: vk::Event,
    stage_mask: vk::PipelineStageFlags2,
) {
    unsafe { vkCmdResetEvent2(command_buffer, event, stage_mask) }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdWriteTimestamp2(
    command_buffer: vk::CommandBuffer,
    stage: vk::PipelineStageFlags2,
    query_pool: vk::QueryPool,
    query: u32,
) {
    let Some((real_cb, fns)) = (unsafe { cb_fns(command_buffer) }) else {
        return;
    };
    // The 1.0 entry point takes a single stage bit.
    let narrowed = narrow_src_stage(stage);
    let stage1 = if narrowed.as_raw().count_ones() == 1 {
        narrowed
    } else {
        warn!(stage = ?stage, "timestamp stage has no single 1.0 equivalent");
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    };
    unsafe { (fns.cmd_write_timestamp)(real_cb, stage1, query_pool, query) };
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdWriteTimestamp2KHR(
    command_buffer: vk::CommandBuffer,
    stage: vk::PipelineStageFlags2,
    query_pool: vk::QueryPool,
    query: u32,
) {
    unsafe { vkCmdWriteTimestamp2(command_buffer, stage, query_pool, query) }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetLineWidth(command_buffer: vk::CommandBuffer, line_width: f32) {
    if let Some((real_cb, fns)) = unsafe { cb_fns(command_buffer) } {
        unsafe { (fns.cmd_set_line_width)(real_cb, line_width) };
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetDepthBias(
    command_buffer: vk::CommandBuffer,
    depth_bias_constant_factor: f32,
    depth_bias_clamp: f32,
    depth_bias_slope_factor: f32,
) {
    if let Some((real_cb, fns)) = unsafe { cb_fns(command_buffer) } {
        unsafe {
            (fns.cmd_set_depth_bias)(
                real_cb,
                depth_bias_constant_factor,
                depth_bias_clamp,
                depth_bias_slope_factor,
            );
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetDepthBounds(
    command_buffer: vk::CommandBuffer,
    min_depth_bounds: f32,
    max_depth_bounds: f32,
) {
    if let Some((real_cb, fns)) = unsafe { cb_fns(command_buffer) } {
        unsafe { (fns.cmd_set_depth_bounds)(real_cb, min_depth_bounds, max_depth_bounds) };
    }
}

#[no_mangle]
pub unsafe extern "C" fn vkCmdSetBlendConstants(
    command_buffer: vk::CommandBuffer,
    blend_constants: *const [f32; 4],
) {
    if let Some((real_cb, fns)) = unsafe { cb_fns(command_buffer) } {
        unsafe { (fns.cmd_set_blend_constants)(real_cb, blend_constants) };
    }
}
