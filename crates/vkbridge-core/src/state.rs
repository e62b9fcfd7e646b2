//! Process-wide bridge state.
//!
//! Everything lives behind one explicitly installed `BridgeState`
//! instead of a scatter of module-level statics, so the ownership of
//! every table is visible in one place and tests can build isolated
//! instances.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::device_table::DeviceTable;
use crate::driver::RealDriver;
use crate::map_budget::MapLedger;
use crate::memory_props::{MemoryPlan, StagingLedger};
use crate::null_guard::NullGuard;
use crate::template::TemplateTable;
use crate::wrap::WrapTable;

pub struct BridgeState {
    pub config: BridgeConfig,
    pub wrappers: WrapTable,
    pub devices: DeviceTable,
    pub map_ledger: MapLedger,
    pub staging: StagingLedger,
    pub templates: TemplateTable,
    /// Virtualized memory layout per real physical device, computed on
    /// first query and immutable afterwards.
    plans: DashMap<u64, MemoryPlan>,
    /// Dummy-object holder per real device.
    guards: DashMap<u64, Arc<NullGuard>>,
    driver: OnceLock<RealDriver>,
}

static INSTALLED: OnceLock<BridgeState> = OnceLock::new();

impl BridgeState {
    pub fn with_config(config: BridgeConfig) -> Self {
        let map_ledger = MapLedger::new(
            config.mapped_budget_bytes,
            config.scratch_bytes,
            config.whole_size_nominal_bytes,
        );
        let staging = StagingLedger::new(config.staging_alloc_budget_bytes);
        Self {
            config,
            wrappers: WrapTable::new(),
            devices: DeviceTable::new(),
            map_ledger,
            staging,
            templates: TemplateTable::new(),
            plans: DashMap::new(),
            guards: DashMap::new(),
            driver: OnceLock::new(),
        }
    }

    /// Install the process-wide instance. Called from the negotiation
    /// entry point; later calls return the already installed state.
    ///
    /// A broken configuration file falls back to defaults here rather
    /// than failing negotiation, since refusing to load the layer takes
    /// the whole client down with it.
    pub fn install() -> &'static BridgeState {
        INSTALLED.get_or_init(|| {
            vkbridge_common::logging::init_logging();
            let config = match BridgeConfig::load() {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "configuration rejected, using defaults");
                    BridgeConfig::default()
                }
            };
            info!(
                platform = vkbridge_common::platform::platform_name(),
                share_device = config.share_device,
                mapped_budget = config.mapped_budget_bytes,
                "bridge state installed"
            );
            BridgeState::with_config(config)
        })
    }

    /// The installed instance. Entry points reached before negotiation
    /// (loaders do this with global-scope resolvers) install lazily.
    pub fn get() -> &'static BridgeState {
        Self::install()
    }

    fn driver_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config.driver_path {
            candidates.push(PathBuf::from(path));
        }
        candidates.extend(
            vkbridge_common::platform::driver_candidates()
                .into_iter()
                .map(PathBuf::from),
        );
        candidates
    }

    /// The real driver, loaded on first use. A failed load is retried on
    /// the next call rather than remembered, so a driver that appears
    /// late (container mounts) still gets picked up.
    pub fn driver(&self) -> Option<&RealDriver> {
        if let Some(d) = self.driver.get() {
            return Some(d);
        }
        match RealDriver::load(&self.driver_candidates()) {
            // A racing load may have won; get_or_init keeps exactly one.
            Ok(d) => Some(self.driver.get_or_init(|| d)),
            Err(e) => {
                warn!(error = %e, "real driver not reachable yet");
                None
            }
        }
    }

    /// The memory plan for a physical device, computing it on first use
    /// from the driver-reported properties `report` produces.
    pub fn plan_for(
        &self,
        physical: u64,
        report: impl FnOnce() -> ash::vk::PhysicalDeviceMemoryProperties,
    ) -> MemoryPlan {
        self.plans
            .entry(physical)
            .or_insert_with(|| MemoryPlan::virtualize(&report(), self.config.staging_heap_bytes))
            .clone()
    }

    /// The plan if it was already computed.
    pub fn plan(&self, physical: u64) -> Option<MemoryPlan> {
        self.plans.get(&physical).map(|p| p.clone())
    }

    pub fn guard_for(&self, real_device: u64) -> Arc<NullGuard> {
        self.guards
            .entry(real_device)
            .or_insert_with(|| Arc::new(NullGuard::new()))
            .clone()
    }

    /// Drop the guard record when its real device is torn down. The
    /// dummy objects themselves die with the device.
    pub fn forget_guard(&self, real_device: u64) {
        self.guards.remove(&real_device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_plan_computed_once() {
        let state = BridgeState::with_config(BridgeConfig::default());
        let mut reports = 0;
        let report = || {
            let mut props = vk::PhysicalDeviceMemoryProperties::default();
            props.memory_heap_count = 1;
            props.memory_heaps[0] = vk::MemoryHeap {
                size: 4 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            };
            props
        };

        assert!(state.plan(0x10).is_none());
        let first = state.plan_for(0x10, || {
            reports += 1;
            report()
        });
        let second = state.plan_for(0x10, || {
            reports += 1;
            report()
        });
        assert_eq!(reports, 1);
        assert_eq!(first.props.memory_heap_count, second.props.memory_heap_count);
        assert!(state.plan(0x10).is_some());
    }

    #[test]
    fn test_guards_are_per_device() {
        let state = BridgeState::with_config(BridgeConfig::default());
        let a = state.guard_for(1);
        let a_again = state.guard_for(1);
        let b = state.guard_for(2);
        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
        state.forget_guard(1);
        let a_new = state.guard_for(1);
        assert!(!Arc::ptr_eq(&a, &a_new));
    }
}
