//! Dynamic loading of the real Vulkan driver.
//!
//! Uses `libloading` to open the real ICD shared object, run the ICD
//! interface negotiation against it, and resolve entry points through
//! its `vk_icdGetInstanceProcAddr` (falling back to the plain exported
//! `vkGetInstanceProcAddr` for drivers that predate the ICD interface).

use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};

use ash::vk;
use libloading::{Library, Symbol};
use tracing::{debug, info, trace};

use crate::error::BridgeError;
use crate::forward::Pfn;

/// Highest ICD loader interface version the bridge speaks.
pub const MAX_ICD_INTERFACE_VERSION: u32 = 5;

type FnNegotiateIcdVersion = unsafe extern "system" fn(p_version: *mut u32) -> vk::Result;

/// The loaded real driver. One per process, created on first need.
pub struct RealDriver {
    // Dropping the library would invalidate every resolved pointer.
    _lib: Library,
    gipa: vk::PFN_vkGetInstanceProcAddr,
    icd_interface_version: u32,
    path: PathBuf,
}

// SAFETY: the driver library stays loaded for the process lifetime and
// Vulkan entry points are callable from any thread.
unsafe impl Send for RealDriver {}
unsafe impl Sync for RealDriver {}

impl RealDriver {
    /// Open the first loadable candidate and negotiate against it.
    pub fn load(candidates: &[PathBuf]) -> Result<Self, BridgeError> {
        let mut last_err = String::new();
        for path in candidates {
            match unsafe { Library::new(path) } {
                Ok(lib) => return Self::from_library(lib, path),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "driver candidate failed to open");
                    last_err = format!("{}: {}", path.display(), e);
                }
            }
        }
        Err(BridgeError::DriverNotFound(last_err))
    }

    fn from_library(lib: Library, path: &Path) -> Result<Self, BridgeError> {
        // Older ICDs export no negotiation symbol at all; that means
        // interface version 1, not a broken driver.
        let icd_interface_version = unsafe {
            match lib.get::<FnNegotiateIcdVersion>(b"vk_icdNegotiateLoaderICDInterfaceVersion") {
                Ok(negotiate) => {
                    let mut version = MAX_ICD_INTERFACE_VERSION;
                    let result = negotiate(&mut version);
                    if result != vk::Result::SUCCESS {
                        return Err(BridgeError::Driver(result));
                    }
                    version.min(MAX_ICD_INTERFACE_VERSION)
                }
                Err(_) => 1,
            }
        };

        let gipa = unsafe {
            let by_icd: Option<Symbol<vk::PFN_vkGetInstanceProcAddr>> =
                lib.get(b"vk_icdGetInstanceProcAddr").ok();
            match by_icd {
                Some(sym) => *sym,
                None => *lib
                    .get::<vk::PFN_vkGetInstanceProcAddr>(b"vkGetInstanceProcAddr")
                    .map_err(|_| BridgeError::MissingEntryPoint("vkGetInstanceProcAddr"))?,
            }
        };

        info!(
            path = %path.display(),
            icd_interface_version,
            "loaded real Vulkan driver"
        );
        Ok(Self {
            _lib: lib,
            gipa,
            icd_interface_version,
            path: path.to_path_buf(),
        })
    }

    pub fn icd_interface_version(&self) -> u32 {
        self.icd_interface_version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a name against the real driver. Null answers are normal
    /// for names the driver does not know.
    ///
    /// # Safety
    /// `name` must be NUL-terminated; dereferencing it is delegated to
    /// the driver.
    pub unsafe fn resolve_raw(&self, instance: vk::Instance, name: *const c_char) -> Option<Pfn> {
        let pfn = unsafe { (self.gipa)(instance, name) }?;
        // extern "system" and extern "C" share an ABI on every platform
        // the bridge targets.
        Some(unsafe { std::mem::transmute::<unsafe extern "system" fn(), Pfn>(pfn) })
    }

    /// Convenience resolver for the bridge's own lookups.
    pub fn resolve(&self, instance: vk::Instance, name: &CStr) -> Option<Pfn> {
        let pfn = unsafe { self.resolve_raw(instance, name.as_ptr()) };
        if pfn.is_none() {
            trace!(name = %name.to_string_lossy(), "real driver returned null for entry point");
        }
        pfn
    }
}
