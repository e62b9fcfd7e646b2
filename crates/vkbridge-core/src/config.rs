use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Layer configuration, loaded from vkbridge.toml.
///
/// Every limit here models an empirically observed failure threshold of
/// the translation layers underneath the real driver, not a Vulkan
/// requirement, so all of them are tunable per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Size of the staging heap carved out of the device-local heap.
    #[serde(default = "default_staging_heap")]
    pub staging_heap_bytes: u64,
    /// Independent cap on the running total of staging-type allocations.
    #[serde(default = "default_staging_alloc_budget")]
    pub staging_alloc_budget_bytes: u64,
    /// Hard ceiling on concurrently mapped bytes.
    #[serde(default = "default_mapped_budget")]
    pub mapped_budget_bytes: u64,
    /// Size of the shared scratch region backing over-budget mappings.
    #[serde(default = "default_scratch")]
    pub scratch_bytes: u64,
    /// Accounting size for a WHOLE_SIZE map request.
    #[serde(default = "default_whole_size_nominal")]
    pub whole_size_nominal_bytes: u64,
    /// Share one real device among all logical devices. Disable only on
    /// drivers that survive concurrent real devices.
    #[serde(default = "default_true")]
    pub share_device: bool,
    /// Explicit path to the real driver library.
    pub driver_path: Option<String>,
}

fn default_staging_heap() -> u64 {
    512 * MIB
}

fn default_staging_alloc_budget() -> u64 {
    768 * MIB
}

fn default_mapped_budget() -> u64 {
    256 * MIB
}

fn default_scratch() -> u64 {
    64 * MIB
}

fn default_whole_size_nominal() -> u64 {
    16 * MIB
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            staging_heap_bytes: default_staging_heap(),
            staging_alloc_budget_bytes: default_staging_alloc_budget(),
            mapped_budget_bytes: default_mapped_budget(),
            scratch_bytes: default_scratch(),
            whole_size_nominal_bytes: default_whole_size_nominal(),
            share_device: true,
            driver_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the default path, falling back to defaults
    /// when the file is absent. A malformed file is an error; silently
    /// ignoring it would make limit tuning undebuggable.
    pub fn load() -> Result<Self, crate::BridgeError> {
        Self::load_from(&vkbridge_common::platform::config_path())
    }

    pub fn load_from(path: &str) -> Result<Self, crate::BridgeError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| crate::BridgeError::Config(format!("{path}: {e}")))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for the knobs that get tuned in the field.
    fn apply_env(&mut self) {
        if let Some(v) = env_u64("VKBRIDGE_MAPPED_BUDGET") {
            self.mapped_budget_bytes = v;
        }
        if let Some(v) = env_u64("VKBRIDGE_STAGING_HEAP") {
            self.staging_heap_bytes = v;
        }
        if let Ok(v) = std::env::var("VKBRIDGE_SHARE_DEVICE") {
            self.share_device = v != "0";
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = BridgeConfig::default();
        assert_eq!(c.staging_heap_bytes, 512 * MIB);
        assert_eq!(c.mapped_budget_bytes, 256 * MIB);
        assert!(c.share_device);
        assert!(c.driver_path.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let c: BridgeConfig = toml::from_str("mapped_budget_bytes = 1024\n")
            .expect("partial config parses");
        assert_eq!(c.mapped_budget_bytes, 1024);
        // Unspecified fields keep their defaults.
        assert_eq!(c.staging_heap_bytes, 512 * MIB);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let c = BridgeConfig::load_from("/nonexistent/vkbridge.toml").expect("defaults");
        assert_eq!(c.scratch_bytes, 64 * MIB);
    }
}
