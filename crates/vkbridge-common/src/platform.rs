/// Candidate paths for the real driver library, in search order.
///
/// The first entry honors the `VKBRIDGE_DRIVER` environment variable so a
/// deployment can pin an exact library; the rest are the locations the
/// translated driver is shipped to in practice.
pub fn driver_candidates() -> Vec<String> {
    let mut paths = Vec::new();
    if let Ok(p) = std::env::var("VKBRIDGE_DRIVER") {
        paths.push(p);
    }
    #[cfg(unix)]
    {
        if let Ok(dir) = std::env::var("VKBRIDGE_DRIVER_DIR") {
            paths.push(format!("{dir}/libvulkan_real.so"));
        }
        paths.push("libvulkan_real.so".to_string());
        paths.push("/usr/lib/libvulkan_real.so".to_string());
    }
    #[cfg(windows)]
    {
        paths.push("vulkan_real.dll".to_string());
    }
    paths
}

/// Returns the path the layer configuration file is looked up at.
pub fn config_path() -> String {
    std::env::var("VKBRIDGE_CONFIG").unwrap_or_else(|_| "vkbridge.toml".to_string())
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
