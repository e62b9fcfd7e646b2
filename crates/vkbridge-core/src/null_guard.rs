//! Null reference repair for descriptor updates.
//!
//! The real driver faults on null references inside descriptor writes,
//! while the client stack leans on nullDescriptor semantics and leaves
//! unused slots empty. Before a descriptor update is forwarded, every
//! absent image view, sampler or buffer reference is replaced with a
//! minimal dummy object created once per real device.
//!
//! An entry that cannot be repaired (the needed dummy kind does not
//! exist, or dummy creation failed) is dropped from the batch instead of
//! being forwarded malformed.

use std::sync::OnceLock;

use ash::vk;
use ash::vk::Handle;

use crate::template::TemplateEntry;

/// The per-device placeholder objects and their backing memory. Handles
/// are real driver identities.
#[derive(Clone, Copy, Debug)]
pub struct DummyObjects {
    pub buffer: vk::Buffer,
    pub buffer_memory: vk::DeviceMemory,
    pub image: vk::Image,
    pub image_memory: vk::DeviceMemory,
    pub image_view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Lazy holder for one device's dummies. The creation closure runs at
/// most once; a failed creation is remembered and never retried, so a
/// device that cannot host dummies degrades to dropping broken writes.
#[derive(Default)]
pub struct NullGuard {
    dummies: OnceLock<Option<DummyObjects>>,
}

impl NullGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, create: impl FnOnce() -> Option<DummyObjects>) -> Option<&DummyObjects> {
        self.dummies
            .get_or_init(|| {
                let made = create();
                if made.is_none() {
                    tracing::warn!("dummy object creation failed, null descriptor writes will be dropped");
                }
                made
            })
            .as_ref()
    }

    /// The dummies if they were already created, without triggering
    /// creation. Used at device teardown.
    pub fn current(&self) -> Option<&DummyObjects> {
        self.dummies.get().and_then(|d| d.as_ref())
    }
}

fn uses_image_info(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

fn uses_buffer_info(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

fn uses_texel_view(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
    )
}

fn needs_sampler(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
    )
}

fn needs_view(ty: vk::DescriptorType) -> bool {
    uses_image_info(ty) && ty != vk::DescriptorType::SAMPLER
}

fn repair_image_info(
    info: &vk::DescriptorImageInfo,
    ty: vk::DescriptorType,
    dummies: &DummyObjects,
) -> vk::DescriptorImageInfo {
    let mut out = *info;
    if needs_sampler(ty) && out.sampler == vk::Sampler::null() {
        out.sampler = dummies.sampler;
    }
    if needs_view(ty) && out.image_view == vk::ImageView::null() {
        out.image_view = dummies.image_view;
        out.image_layout = vk::ImageLayout::GENERAL;
    }
    out
}

fn repair_buffer_info(info: &vk::DescriptorBufferInfo, dummies: &DummyObjects) -> vk::DescriptorBufferInfo {
    if info.buffer == vk::Buffer::null() {
        vk::DescriptorBufferInfo {
            buffer: dummies.buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    } else {
        *info
    }
}

unsafe fn image_infos_have_null(write: &vk::WriteDescriptorSet<'_>) -> bool {
    for i in 0..write.descriptor_count as usize {
        let info = unsafe { &*write.p_image_info.add(i) };
        if (needs_sampler(write.descriptor_type) && info.sampler == vk::Sampler::null())
            || (needs_view(write.descriptor_type) && info.image_view == vk::ImageView::null())
        {
            return true;
        }
    }
    false
}

unsafe fn buffer_infos_have_null(write: &vk::WriteDescriptorSet<'_>) -> bool {
    (0..write.descriptor_count as usize)
        .any(|i| unsafe { (*write.p_buffer_info.add(i)).buffer == vk::Buffer::null() })
}

unsafe fn texel_views_have_null(write: &vk::WriteDescriptorSet<'_>) -> bool {
    (0..write.descriptor_count as usize)
        .any(|i| unsafe { *write.p_texel_buffer_view.add(i) == vk::BufferView::null() })
}

/// The forwardable form of a repaired write batch. The payload vectors
/// own the rewritten info arrays the writes point into, so the whole
/// struct must outlive the forwarded call.
pub struct RepairedWrites {
    pub writes: Vec<vk::WriteDescriptorSet<'static>>,
    pub dropped: usize,
    image_payloads: Vec<Box<[vk::DescriptorImageInfo]>>,
    buffer_payloads: Vec<Box<[vk::DescriptorBufferInfo]>>,
}

impl RepairedWrites {
    pub fn as_ptr(&self) -> *const vk::WriteDescriptorSet<'static> {
        self.writes.as_ptr()
    }

    pub fn count(&self) -> u32 {
        self.writes.len() as u32
    }
}

/// Scan a direct descriptor-write batch and produce a forwardable copy
/// with every absent reference repaired.
///
/// `dummies` is None when creation failed; writes that would have
/// needed repair are then dropped. Writes without absent references are
/// passed through pointing at the client's own arrays.
///
/// # Safety
/// Each write's info pointer for its descriptor type must be valid for
/// `descriptor_count` reads, as the client guarantees for the call.
pub unsafe fn repair_writes(
    writes: &[vk::WriteDescriptorSet<'_>],
    dummies: Option<&DummyObjects>,
) -> RepairedWrites {
    let mut out = RepairedWrites {
        writes: Vec::with_capacity(writes.len()),
        dropped: 0,
        image_payloads: Vec::new(),
        buffer_payloads: Vec::new(),
    };

    for write in writes {
        let ty = write.descriptor_type;
        let count = write.descriptor_count as usize;
        // The lifetime on the ash struct is a marker; the payload is raw
        // pointers, owned below when a repair copies them.
        let clean: vk::WriteDescriptorSet<'static> = unsafe { std::mem::transmute(*write) };

        if uses_image_info(ty) && !write.p_image_info.is_null() && unsafe { image_infos_have_null(write) } {
            let Some(d) = dummies else {
                out.dropped += 1;
                continue;
            };
            let repaired: Box<[_]> = (0..count)
                .map(|i| repair_image_info(unsafe { &*write.p_image_info.add(i) }, ty, d))
                .collect();
            let mut w = clean;
            w.p_image_info = repaired.as_ptr();
            out.image_payloads.push(repaired);
            out.writes.push(w);
        } else if uses_buffer_info(ty)
            && !write.p_buffer_info.is_null()
            && unsafe { buffer_infos_have_null(write) }
        {
            let Some(d) = dummies else {
                out.dropped += 1;
                continue;
            };
            let repaired: Box<[_]> = (0..count)
                .map(|i| repair_buffer_info(unsafe { &*write.p_buffer_info.add(i) }, d))
                .collect();
            let mut w = clean;
            w.p_buffer_info = repaired.as_ptr();
            out.buffer_payloads.push(repaired);
            out.writes.push(w);
        } else if uses_texel_view(ty)
            && !write.p_texel_buffer_view.is_null()
            && unsafe { texel_views_have_null(write) }
        {
            // No dummy buffer view exists, this write cannot be made safe.
            out.dropped += 1;
        } else {
            out.writes.push(clean);
        }
    }

    if out.dropped > 0 {
        tracing::debug!(dropped = out.dropped, "dropped unrepairable descriptor writes");
    }
    out
}

fn payload_size(ty: vk::DescriptorType) -> usize {
    if uses_image_info(ty) {
        std::mem::size_of::<vk::DescriptorImageInfo>()
    } else if uses_buffer_info(ty) {
        std::mem::size_of::<vk::DescriptorBufferInfo>()
    } else if uses_texel_view(ty) {
        std::mem::size_of::<vk::BufferView>()
    } else {
        0
    }
}

fn blob_len(entries: &[TemplateEntry]) -> usize {
    entries
        .iter()
        .filter(|e| e.descriptor_count > 0)
        .map(|e| e.element_offset(e.descriptor_count as usize - 1) + payload_size(e.descriptor_type))
        .max()
        .unwrap_or(0)
}

/// Copy a templated update blob and repair absent references in place.
///
/// Returns None when the update must be dropped: a null texel buffer
/// view was found, or a repair was needed without dummies.
///
/// # Safety
/// `data` must be valid for reads over the extent the template entries
/// describe, as the client guarantees for the templated update call.
pub unsafe fn repair_template_data(
    entries: &[TemplateEntry],
    data: *const std::ffi::c_void,
    dummies: Option<&DummyObjects>,
) -> Option<Vec<u8>> {
    let len = blob_len(entries);
    let mut blob = vec![0u8; len];
    unsafe { std::ptr::copy_nonoverlapping(data as *const u8, blob.as_mut_ptr(), len) };

    for entry in entries {
        let ty = entry.descriptor_type;
        for i in 0..entry.descriptor_count as usize {
            let at = entry.element_offset(i);
            if uses_image_info(ty) {
                let p = unsafe { blob.as_mut_ptr().add(at) } as *mut vk::DescriptorImageInfo;
                let info = unsafe { std::ptr::read_unaligned(p) };
                if (needs_sampler(ty) && info.sampler == vk::Sampler::null())
                    || (needs_view(ty) && info.image_view == vk::ImageView::null())
                {
                    let d = dummies?;
                    unsafe { std::ptr::write_unaligned(p, repair_image_info(&info, ty, d)) };
                }
            } else if uses_buffer_info(ty) {
                let p = unsafe { blob.as_mut_ptr().add(at) } as *mut vk::DescriptorBufferInfo;
                let info = unsafe { std::ptr::read_unaligned(p) };
                if info.buffer == vk::Buffer::null() {
                    let d = dummies?;
                    unsafe { std::ptr::write_unaligned(p, repair_buffer_info(&info, d)) };
                }
            } else if uses_texel_view(ty) {
                let p = unsafe { blob.as_ptr().add(at) } as *const vk::BufferView;
                if unsafe { std::ptr::read_unaligned(p) } == vk::BufferView::null() {
                    return None;
                }
            }
        }
    }
    Some(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummies() -> DummyObjects {
        DummyObjects {
            buffer: vk::Buffer::from_raw(0xB0),
            buffer_memory: vk::DeviceMemory::from_raw(0xB1),
            image: vk::Image::from_raw(0xC0),
            image_memory: vk::DeviceMemory::from_raw(0xC1),
            image_view: vk::ImageView::from_raw(0xC2),
            sampler: vk::Sampler::from_raw(0xD0),
        }
    }

    #[test]
    fn test_null_image_and_sampler_repaired() {
        let infos = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }];
        let writes = [vk::WriteDescriptorSet::default()
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos)];

        let d = dummies();
        let repaired = unsafe { repair_writes(&writes, Some(&d)) };
        assert_eq!(repaired.dropped, 0);
        assert_eq!(repaired.count(), 1);
        let info = unsafe { &*repaired.writes[0].p_image_info };
        assert_eq!(info.sampler, d.sampler);
        assert_eq!(info.image_view, d.image_view);
        assert_eq!(info.image_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_clean_writes_pass_through_untouched() {
        let infos = [vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(0x42),
            offset: 0,
            range: 128,
        }];
        let writes = [vk::WriteDescriptorSet::default()
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&infos)];

        let repaired = unsafe { repair_writes(&writes, Some(&dummies())) };
        assert_eq!(repaired.count(), 1);
        // Still pointing into the caller's array, no copy was taken.
        assert_eq!(repaired.writes[0].p_buffer_info, infos.as_ptr());
    }

    #[test]
    fn test_unrepairable_writes_are_dropped() {
        let views = [vk::BufferView::null()];
        let infos = [vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .descriptor_type(vk::DescriptorType::UNIFORM_TEXEL_BUFFER)
                .texel_buffer_view(&views),
            vk::WriteDescriptorSet::default()
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos),
        ];

        // With dummies: the texel view write drops, the buffer write heals.
        let d = dummies();
        let repaired = unsafe { repair_writes(&writes, Some(&d)) };
        assert_eq!(repaired.dropped, 1);
        assert_eq!(repaired.count(), 1);
        let healed = unsafe { &*repaired.writes[0].p_buffer_info };
        assert_eq!(healed.buffer, d.buffer);
        assert_eq!(healed.range, vk::WHOLE_SIZE);

        // Without dummies: both drop.
        let repaired = unsafe { repair_writes(&writes, None) };
        assert_eq!(repaired.dropped, 2);
        assert_eq!(repaired.count(), 0);
    }

    #[test]
    fn test_guard_creates_once_and_remembers_failure() {
        let guard = NullGuard::new();
        let mut calls = 0;
        assert!(guard
            .ensure(|| {
                calls += 1;
                None
            })
            .is_none());
        assert!(guard.ensure(|| unreachable!()).is_none());
        assert_eq!(calls, 1);
        assert!(guard.current().is_none());

        let guard = NullGuard::new();
        let d = dummies();
        assert!(guard.ensure(|| Some(d)).is_some());
        assert_eq!(guard.current().map(|d| d.sampler), Some(d.sampler));
    }

    #[test]
    fn test_template_blob_repair() {
        let entries = [
            TemplateEntry {
                descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 2,
                offset: 8,
                stride: std::mem::size_of::<vk::DescriptorImageInfo>(),
            },
            TemplateEntry {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                offset: 72,
                stride: std::mem::size_of::<vk::DescriptorBufferInfo>(),
            },
        ];

        let mut blob = vec![0u8; blob_len(&entries)];
        let live_view = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: vk::ImageView::from_raw(0x99),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        unsafe {
            std::ptr::write_unaligned(blob.as_mut_ptr().add(8) as *mut vk::DescriptorImageInfo, live_view);
        }

        let d = dummies();
        let repaired = unsafe {
            repair_template_data(&entries, blob.as_ptr() as *const _, Some(&d)).unwrap()
        };

        unsafe {
            let first = std::ptr::read_unaligned(repaired.as_ptr().add(8) as *const vk::DescriptorImageInfo);
            assert_eq!(first.image_view, vk::ImageView::from_raw(0x99));
            let second = std::ptr::read_unaligned(
                repaired.as_ptr().add(8 + std::mem::size_of::<vk::DescriptorImageInfo>())
                    as *const vk::DescriptorImageInfo,
            );
            assert_eq!(second.image_view, d.image_view);
            let buf = std::ptr::read_unaligned(repaired.as_ptr().add(72) as *const vk::DescriptorBufferInfo);
            assert_eq!(buf.buffer, d.buffer);
        }

        // A repair needed without dummies drops the update.
        assert!(unsafe { repair_template_data(&entries, blob.as_ptr() as *const _, None) }.is_none());
    }
}
