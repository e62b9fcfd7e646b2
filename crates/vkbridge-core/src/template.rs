//! Descriptor update template tracking.
//!
//! Templated descriptor updates carry a bare byte pointer at update
//! time, so the layout recorded at creation is the only way to find the
//! descriptor payloads inside the client's data blob. Templates are
//! parsed once at creation, read at every templated update, and retired
//! when the client destroys the template.

use ash::vk;
use dashmap::DashMap;

/// One creation-time update entry, reduced to what the update path
/// needs to locate payloads in the client data blob.
#[derive(Clone, Copy, Debug)]
pub struct TemplateEntry {
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub offset: usize,
    pub stride: usize,
}

impl TemplateEntry {
    /// Byte offset of element `i` of this entry in the update blob.
    pub fn element_offset(&self, i: usize) -> usize {
        self.offset + i * self.stride
    }
}

/// Process-wide table of live templates, keyed by the raw template
/// handle. Entries are immutable after insert.
#[derive(Default)]
pub struct TemplateTable {
    live: DashMap<u64, Vec<TemplateEntry>>,
}

impl TemplateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a template at creation time.
    ///
    /// # Safety
    /// `info.p_descriptor_update_entries` must be valid for
    /// `info.descriptor_update_entry_count` reads.
    pub unsafe fn register(&self, template: u64, info: &vk::DescriptorUpdateTemplateCreateInfo<'_>) {
        let mut entries = Vec::with_capacity(info.descriptor_update_entry_count as usize);
        for i in 0..info.descriptor_update_entry_count as usize {
            let e = unsafe { &*info.p_descriptor_update_entries.add(i) };
            entries.push(TemplateEntry {
                descriptor_type: e.descriptor_type,
                descriptor_count: e.descriptor_count,
                offset: e.offset,
                stride: e.stride,
            });
        }
        tracing::trace!(template, entries = entries.len(), "registered update template");
        self.live.insert(template, entries);
    }

    /// Entries for a live template, or None for a handle never seen
    /// (including one already retired).
    pub fn entries(&self, template: u64) -> Option<Vec<TemplateEntry>> {
        self.live.get(&template).map(|e| e.clone())
    }

    /// Drop the record when the client destroys the template. Retiring
    /// an unknown handle is a no-op.
    pub fn retire(&self, template: u64) {
        self.live.remove(&template);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(entries: &[vk::DescriptorUpdateTemplateEntry]) -> vk::DescriptorUpdateTemplateCreateInfo<'_> {
        vk::DescriptorUpdateTemplateCreateInfo::default().descriptor_update_entries(entries)
    }

    #[test]
    fn test_register_entries_retire() {
        let raw = [
            vk::DescriptorUpdateTemplateEntry {
                dst_binding: 0,
                dst_array_element: 0,
                descriptor_count: 2,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                offset: 16,
                stride: 24,
            },
            vk::DescriptorUpdateTemplateEntry {
                dst_binding: 1,
                dst_array_element: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                offset: 64,
                stride: 24,
            },
        ];
        let table = TemplateTable::new();
        unsafe { table.register(7, &sample_info(&raw)) };

        let entries = table.entries(7).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].element_offset(1), 40);
        assert_eq!(entries[1].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);

        table.retire(7);
        assert!(table.entries(7).is_none());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_unknown_template_is_absent() {
        let table = TemplateTable::new();
        assert!(table.entries(99).is_none());
        table.retire(99);
    }
}
