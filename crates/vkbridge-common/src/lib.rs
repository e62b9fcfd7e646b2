//! Shared utilities for the vkbridge layer: logging setup and platform
//! path discovery.

pub mod logging;
pub mod platform;
