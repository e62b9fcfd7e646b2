//! Extension list editing and feature spoofing.
//!
//! The enumerated device extension list is rewritten in two directions.
//! Extensions the real driver exposes but cannot deliver reliably
//! through the bridge are hidden. Extensions the client stack requires
//! but the driver does not report are appended and emulated (the bridge
//! either implements the behavior itself, as with synchronization2, or
//! the behavior is benign to fake, as with the robustness family).
//!
//! The inverse edit runs on device creation: injected names the real
//! driver never reported are stripped from the creation request, and
//! feature booleans the driver did not claim are cleared, so the driver
//! is never asked to enable something it did not claim. Booleans the
//! driver genuinely supports pass through enabled.

use std::ffi::CStr;

use ash::vk;

/// Extensions hidden from the client. These pass object-size or
/// host-pointer contracts through the bridge in ways the forwarding
/// stubs cannot honor.
pub const DENIED_EXTENSIONS: &[&CStr] = &[
    c"VK_EXT_descriptor_buffer",
    c"VK_EXT_graphics_pipeline_library",
    c"VK_KHR_map_memory2",
    c"VK_EXT_host_image_copy",
];

/// Extensions appended to the real driver's answer when absent.
pub const INJECTED_EXTENSIONS: &[&CStr] = &[
    c"VK_KHR_synchronization2",
    c"VK_EXT_robustness2",
    c"VK_EXT_custom_border_color",
    c"VK_EXT_depth_clip_enable",
    c"VK_EXT_non_seamless_cube_map",
    c"VK_EXT_transform_feedback",
    c"VK_KHR_maintenance5",
    c"VK_KHR_maintenance6",
];

pub fn is_denied(name: &CStr) -> bool {
    DENIED_EXTENSIONS.iter().any(|d| *d == name)
}

pub fn is_injected(name: &CStr) -> bool {
    INJECTED_EXTENSIONS.iter().any(|d| *d == name)
}

fn property_name(prop: &vk::ExtensionProperties) -> &CStr {
    // extension_name is a fixed NUL-padded array.
    unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) }
}

fn make_property(name: &CStr, spec_version: u32) -> vk::ExtensionProperties {
    let mut prop = vk::ExtensionProperties {
        spec_version,
        ..Default::default()
    };
    let bytes = name.to_bytes_with_nul();
    for (dst, src) in prop.extension_name.iter_mut().zip(bytes.iter()) {
        *dst = *src as std::ffi::c_char;
    }
    prop
}

/// Rewrite the real driver's extension list for the client: drop the
/// deny list, append missing injected names.
pub fn edit_extension_list(real: &[vk::ExtensionProperties]) -> Vec<vk::ExtensionProperties> {
    let mut out: Vec<vk::ExtensionProperties> = real
        .iter()
        .filter(|p| !is_denied(property_name(p)))
        .copied()
        .collect();
    for name in INJECTED_EXTENSIONS {
        let present = out.iter().any(|p| property_name(p) == *name);
        if !present {
            tracing::debug!(extension = %name.to_string_lossy(), "injecting extension");
            out.push(make_property(name, 1));
        }
    }
    out
}

/// Decide whether an enabled-extension name in a device creation request
/// must be removed before the request reaches the real driver.
///
/// `real_has` reports whether the unedited driver answer contained the
/// name. Injected names the driver never had are the bridge's to honor,
/// not the driver's.
pub fn strip_on_create(name: &CStr, real_has: bool) -> bool {
    is_injected(name) && !real_has
}

/// What the real driver actually claimed for each spoofable boolean.
/// Built from an unedited features2 query; everything defaults to
/// unsupported, which strips every spoofed boolean on create.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureSupport {
    pub texture_compression_bc: bool,
    pub null_descriptor: bool,
    pub robust_buffer_access2: bool,
    pub robust_image_access2: bool,
    pub custom_border_colors: bool,
    pub custom_border_color_without_format: bool,
    pub depth_clip_enable: bool,
    pub non_seamless_cube_map: bool,
    pub synchronization2: bool,
    pub transform_feedback: bool,
    pub geometry_streams: bool,
    pub maintenance5: bool,
    pub maintenance6: bool,
}

/// Force the spoofed booleans in a 1.0 features query answer.
pub fn spoof_features(features: &mut vk::PhysicalDeviceFeatures) {
    features.texture_compression_bc = vk::TRUE;
}

/// Force the spoofed feature booleans to true in a features2 query
/// answer: the base block and every recognized structure in the output
/// chain.
///
/// # Safety
/// Every structure reachable through `features.p_next` must be writable
/// and correctly tagged by its `s_type`, as the querying client
/// guarantees for an output chain.
pub unsafe fn spoof_features2(features: &mut vk::PhysicalDeviceFeatures2<'_>) {
    spoof_features(&mut features.features);
    let mut node = features.p_next as *mut vk::BaseOutStructure;
    while !node.is_null() {
        // SAFETY: caller guarantees a well-formed writable chain.
        unsafe {
            force_chain_node(node);
            node = (*node).p_next;
        }
    }
}

/// Read the real driver's claims out of an unedited features2 answer.
///
/// # Safety
/// Same chain requirements as [`spoof_features2`].
pub unsafe fn query_support(features: &vk::PhysicalDeviceFeatures2<'_>) -> FeatureSupport {
    let mut support = FeatureSupport {
        texture_compression_bc: features.features.texture_compression_bc == vk::TRUE,
        ..Default::default()
    };
    let mut node = features.p_next as *const vk::BaseOutStructure;
    while !node.is_null() {
        // SAFETY: caller guarantees a well-formed chain.
        unsafe {
            read_chain_node(node, &mut support);
            node = (*node).p_next;
        }
    }
    support
}

/// Clear feature booleans the real driver did not claim in a device
/// creation request, both the legacy enabled-features block and the
/// pNext chain, before the request is forwarded.
///
/// # Safety
/// Same chain requirements as [`spoof_features2`]; creation chains are
/// rewritten in place and the original values are not restored.
pub unsafe fn strip_create_info_features(
    create_info: &vk::DeviceCreateInfo<'_>,
    support: &FeatureSupport,
) {
    if !support.texture_compression_bc && !create_info.p_enabled_features.is_null() {
        // SAFETY: creation input the bridge owns for the call's duration.
        unsafe {
            let f = create_info.p_enabled_features as *mut vk::PhysicalDeviceFeatures;
            (*f).texture_compression_bc = vk::FALSE;
        }
    }
    let mut node = create_info.p_next as *mut vk::BaseOutStructure;
    while !node.is_null() {
        // SAFETY: caller guarantees a well-formed writable chain.
        unsafe {
            strip_chain_node(node, support);
            node = (*node).p_next;
        }
    }
}

macro_rules! edit_bool {
    (force, $field:expr, $support:expr) => {
        $field = vk::TRUE;
    };
    (strip, $field:expr, $support:expr) => {
        if !$support {
            $field = vk::FALSE;
        }
    };
}

macro_rules! chain_edit {
    ($mode:ident, $node:expr, $support:expr) => {
        match (*$node).s_type {
            vk::StructureType::PHYSICAL_DEVICE_FEATURES_2 => {
                let f = $node as *mut vk::PhysicalDeviceFeatures2;
                edit_bool!(
                    $mode,
                    (*f).features.texture_compression_bc,
                    $support.texture_compression_bc
                );
            }
            vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT => {
                let f = $node as *mut vk::PhysicalDeviceRobustness2FeaturesEXT;
                edit_bool!($mode, (*f).null_descriptor, $support.null_descriptor);
                edit_bool!($mode, (*f).robust_buffer_access2, $support.robust_buffer_access2);
                edit_bool!($mode, (*f).robust_image_access2, $support.robust_image_access2);
            }
            vk::StructureType::PHYSICAL_DEVICE_CUSTOM_BORDER_COLOR_FEATURES_EXT => {
                let f = $node as *mut vk::PhysicalDeviceCustomBorderColorFeaturesEXT;
                edit_bool!($mode, (*f).custom_border_colors, $support.custom_border_colors);
                edit_bool!(
                    $mode,
                    (*f).custom_border_color_without_format,
                    $support.custom_border_color_without_format
                );
            }
            vk::StructureType::PHYSICAL_DEVICE_DEPTH_CLIP_ENABLE_FEATURES_EXT => {
                let f = $node as *mut vk::PhysicalDeviceDepthClipEnableFeaturesEXT;
                edit_bool!($mode, (*f).depth_clip_enable, $support.depth_clip_enable);
            }
            vk::StructureType::PHYSICAL_DEVICE_NON_SEAMLESS_CUBE_MAP_FEATURES_EXT => {
                let f = $node as *mut vk::PhysicalDeviceNonSeamlessCubeMapFeaturesEXT;
                edit_bool!($mode, (*f).non_seamless_cube_map, $support.non_seamless_cube_map);
            }
            vk::StructureType::PHYSICAL_DEVICE_SYNCHRONIZATION_2_FEATURES => {
                let f = $node as *mut vk::PhysicalDeviceSynchronization2Features;
                edit_bool!($mode, (*f).synchronization2, $support.synchronization2);
            }
            vk::StructureType::PHYSICAL_DEVICE_TRANSFORM_FEEDBACK_FEATURES_EXT => {
                let f = $node as *mut vk::PhysicalDeviceTransformFeedbackFeaturesEXT;
                edit_bool!($mode, (*f).transform_feedback, $support.transform_feedback);
                edit_bool!($mode, (*f).geometry_streams, $support.geometry_streams);
            }
            vk::StructureType::PHYSICAL_DEVICE_MAINTENANCE_5_FEATURES_KHR => {
                let f = $node as *mut vk::PhysicalDeviceMaintenance5FeaturesKHR;
                edit_bool!($mode, (*f).maintenance5, $support.maintenance5);
            }
            vk::StructureType::PHYSICAL_DEVICE_MAINTENANCE_6_FEATURES_KHR => {
                let f = $node as *mut vk::PhysicalDeviceMaintenance6FeaturesKHR;
                edit_bool!($mode, (*f).maintenance6, $support.maintenance6);
            }
            _ => {}
        }
    };
}

unsafe fn force_chain_node(node: *mut vk::BaseOutStructure) {
    let _unused = FeatureSupport::default();
    // SAFETY: deferred to the public entry points' chain contract.
    unsafe { chain_edit!(force, node, _unused) }
}

unsafe fn strip_chain_node(node: *mut vk::BaseOutStructure, support: &FeatureSupport) {
    // SAFETY: deferred to the public entry points' chain contract.
    unsafe { chain_edit!(strip, node, support) }
}

unsafe fn read_chain_node(node: *const vk::BaseOutStructure, support: &mut FeatureSupport) {
    macro_rules! read {
        ($struct:ty, $($field:ident),+) => {{
            let f = node as *const $struct;
            $(support.$field = unsafe { (*f).$field } == vk::TRUE;)+
        }};
    }
    // SAFETY: deferred to query_support's chain contract.
    match unsafe { (*node).s_type } {
        vk::StructureType::PHYSICAL_DEVICE_ROBUSTNESS_2_FEATURES_EXT => read!(
            vk::PhysicalDeviceRobustness2FeaturesEXT,
            null_descriptor,
            robust_buffer_access2,
            robust_image_access2
        ),
        vk::StructureType::PHYSICAL_DEVICE_CUSTOM_BORDER_COLOR_FEATURES_EXT => read!(
            vk::PhysicalDeviceCustomBorderColorFeaturesEXT,
            custom_border_colors,
            custom_border_color_without_format
        ),
        vk::StructureType::PHYSICAL_DEVICE_DEPTH_CLIP_ENABLE_FEATURES_EXT => {
            read!(vk::PhysicalDeviceDepthClipEnableFeaturesEXT, depth_clip_enable)
        }
        vk::StructureType::PHYSICAL_DEVICE_NON_SEAMLESS_CUBE_MAP_FEATURES_EXT => {
            read!(vk::PhysicalDeviceNonSeamlessCubeMapFeaturesEXT, non_seamless_cube_map)
        }
        vk::StructureType::PHYSICAL_DEVICE_SYNCHRONIZATION_2_FEATURES => {
            read!(vk::PhysicalDeviceSynchronization2Features, synchronization2)
        }
        vk::StructureType::PHYSICAL_DEVICE_TRANSFORM_FEEDBACK_FEATURES_EXT => read!(
            vk::PhysicalDeviceTransformFeedbackFeaturesEXT,
            transform_feedback,
            geometry_streams
        ),
        vk::StructureType::PHYSICAL_DEVICE_MAINTENANCE_5_FEATURES_KHR => {
            read!(vk::PhysicalDeviceMaintenance5FeaturesKHR, maintenance5)
        }
        vk::StructureType::PHYSICAL_DEVICE_MAINTENANCE_6_FEATURES_KHR => {
            read!(vk::PhysicalDeviceMaintenance6FeaturesKHR, maintenance6)
        }
        _ => {}
    }
}

/// Features claimed for block-compressed formats the driver reports as
/// unsupported. Content is decoded elsewhere in the stack; the bridge
/// only needs the claim to be sampleable and copyable.
pub const BC_FORMAT_FEATURES: vk::FormatFeatureFlags = vk::FormatFeatureFlags::from_raw(
    vk::FormatFeatureFlags::SAMPLED_IMAGE.as_raw()
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_SRC.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_DST.as_raw()
        | vk::FormatFeatureFlags::BLIT_SRC.as_raw(),
);

pub fn is_bc_format(format: vk::Format) -> bool {
    let raw = format.as_raw();
    raw >= vk::Format::BC1_RGB_UNORM_BLOCK.as_raw() && raw <= vk::Format::BC7_SRGB_BLOCK.as_raw()
}

/// Patch a format property answer for BC formats the driver left empty.
pub fn spoof_format_properties(format: vk::Format, props: &mut vk::FormatProperties) {
    if is_bc_format(format) && props.optimal_tiling_features.is_empty() {
        props.optimal_tiling_features = BC_FORMAT_FEATURES;
        props.buffer_features |= vk::FormatFeatureFlags::TRANSFER_SRC | vk::FormatFeatureFlags::TRANSFER_DST;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_extensions_disappear() {
        let real = [
            make_property(c"VK_KHR_swapchain", 70),
            make_property(c"VK_EXT_descriptor_buffer", 1),
        ];
        let edited = edit_extension_list(&real);
        assert!(!edited.iter().any(|p| property_name(p) == c"VK_EXT_descriptor_buffer"));
        assert!(edited.iter().any(|p| property_name(p) == c"VK_KHR_swapchain"));
    }

    #[test]
    fn test_injected_extensions_appear_once() {
        let real = [make_property(c"VK_KHR_synchronization2", 1)];
        let edited = edit_extension_list(&real);
        let sync2 = edited
            .iter()
            .filter(|p| property_name(p) == c"VK_KHR_synchronization2")
            .count();
        assert_eq!(sync2, 1);
        // The rest of the inject list is appended.
        assert!(edited.iter().any(|p| property_name(p) == c"VK_EXT_robustness2"));
        assert!(edited.iter().any(|p| property_name(p) == c"VK_KHR_maintenance5"));
        assert_eq!(edited.len(), INJECTED_EXTENSIONS.len());
    }

    #[test]
    fn test_strip_on_create_only_hits_injected_unsupported() {
        assert!(strip_on_create(c"VK_EXT_robustness2", false));
        assert!(!strip_on_create(c"VK_EXT_robustness2", true));
        assert!(!strip_on_create(c"VK_KHR_swapchain", false));
    }

    #[test]
    fn test_base_block_bc_feature_is_spoofed() {
        let mut features = vk::PhysicalDeviceFeatures2::default();
        unsafe { spoof_features2(&mut features) };
        assert_eq!(features.features.texture_compression_bc, vk::TRUE);

        let mut legacy = vk::PhysicalDeviceFeatures::default();
        spoof_features(&mut legacy);
        assert_eq!(legacy.texture_compression_bc, vk::TRUE);
    }

    #[test]
    fn test_feature_chain_spoof_covers_every_struct() {
        let mut xfb = vk::PhysicalDeviceTransformFeedbackFeaturesEXT::default();
        let mut maint5 = vk::PhysicalDeviceMaintenance5FeaturesKHR::default();
        let mut maint6 = vk::PhysicalDeviceMaintenance6FeaturesKHR::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut xfb)
            .push_next(&mut maint5)
            .push_next(&mut maint6);

        unsafe { spoof_features2(&mut features) };
        drop(features);
        assert_eq!(xfb.transform_feedback, vk::TRUE);
        assert_eq!(xfb.geometry_streams, vk::TRUE);
        assert_eq!(maint5.maintenance5, vk::TRUE);
        assert_eq!(maint6.maintenance6, vk::TRUE);
    }

    #[test]
    fn test_strip_clears_only_unclaimed_features() {
        let mut robustness = vk::PhysicalDeviceRobustness2FeaturesEXT::default();
        let mut depth_clip = vk::PhysicalDeviceDepthClipEnableFeaturesEXT::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut depth_clip)
            .push_next(&mut robustness);

        unsafe { spoof_features2(&mut features) };
        let chain = features.p_next;
        drop(features);
        assert_eq!(robustness.null_descriptor, vk::TRUE);
        assert_eq!(depth_clip.depth_clip_enable, vk::TRUE);

        // Driver claims depth clip but none of the robustness family.
        let support = FeatureSupport {
            depth_clip_enable: true,
            ..Default::default()
        };
        let create_info = vk::DeviceCreateInfo {
            p_next: chain,
            ..Default::default()
        };
        unsafe { strip_create_info_features(&create_info, &support) };
        assert_eq!(robustness.null_descriptor, vk::FALSE);
        assert_eq!(robustness.robust_buffer_access2, vk::FALSE);
        assert_eq!(depth_clip.depth_clip_enable, vk::TRUE);
    }

    #[test]
    fn test_strip_clears_unclaimed_legacy_enabled_features() {
        let mut enabled = vk::PhysicalDeviceFeatures {
            texture_compression_bc: vk::TRUE,
            ..Default::default()
        };
        let create_info = vk::DeviceCreateInfo {
            p_enabled_features: &mut enabled as *mut _ as *const _,
            ..Default::default()
        };
        unsafe { strip_create_info_features(&create_info, &FeatureSupport::default()) };
        assert_eq!(enabled.texture_compression_bc, vk::FALSE);

        let mut claimed = vk::PhysicalDeviceFeatures {
            texture_compression_bc: vk::TRUE,
            ..Default::default()
        };
        let create_info = vk::DeviceCreateInfo {
            p_enabled_features: &mut claimed as *mut _ as *const _,
            ..Default::default()
        };
        let support = FeatureSupport {
            texture_compression_bc: true,
            ..Default::default()
        };
        unsafe { strip_create_info_features(&create_info, &support) };
        assert_eq!(claimed.texture_compression_bc, vk::TRUE);
    }

    #[test]
    fn test_query_support_reads_driver_claims() {
        let mut sync2 = vk::PhysicalDeviceSynchronization2Features {
            synchronization2: vk::TRUE,
            ..Default::default()
        };
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut sync2);
        features.features.texture_compression_bc = vk::TRUE;

        let support = unsafe { query_support(&features) };
        assert!(support.texture_compression_bc);
        assert!(support.synchronization2);
        assert!(!support.depth_clip_enable);
    }

    #[test]
    fn test_bc_format_spoof_leaves_real_answers_alone() {
        let mut empty = vk::FormatProperties::default();
        spoof_format_properties(vk::Format::BC3_UNORM_BLOCK, &mut empty);
        assert_eq!(empty.optimal_tiling_features, BC_FORMAT_FEATURES);

        let mut real = vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
            ..Default::default()
        };
        spoof_format_properties(vk::Format::BC3_UNORM_BLOCK, &mut real);
        assert_eq!(real.optimal_tiling_features, vk::FormatFeatureFlags::SAMPLED_IMAGE);

        let mut non_bc = vk::FormatProperties::default();
        spoof_format_properties(vk::Format::R8G8B8A8_UNORM, &mut non_bc);
        assert!(non_bc.optimal_tiling_features.is_empty());
    }
}
