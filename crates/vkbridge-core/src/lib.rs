//! Dispatch and compatibility-translation engine for the vkbridge layer.
//!
//! The layer sits between a Vulkan client and a real driver that is only
//! reachable through an instruction-set emulator and a cross-architecture
//! call-marshaling bridge. Those translation layers impose constraints the
//! driver was never designed for: a hard ceiling on concurrently mapped
//! memory, unreliable marshaling of some newer call shapes, state
//! corruption when two real devices coexist, and capabilities the client
//! requires but the driver does not advertise.
//!
//! This crate holds everything that is not the C ABI boundary itself, so
//! the translation logic is testable as ordinary Rust:
//!
//! - [`wrap`] — stable wrapper records for dispatchable handles
//! - [`forward`] — default unwrap-and-forward stubs for uninteresting calls
//! - [`device_table`] — real-device multiplexing and the queue lock
//! - [`memory_props`] — heap splitting and the synthetic memory type
//! - [`map_budget`] — the mapped-byte ledger and scratch redirection
//! - [`barrier`] — synchronization2 to legacy barrier lowering
//! - [`capability`] — extension filtering/injection and feature spoofing
//! - [`null_guard`] / [`template`] — descriptor-update repair
//! - [`driver`] — resolution of the real driver's entry points

pub mod barrier;
pub mod capability;
pub mod config;
pub mod device_table;
pub mod driver;
pub mod error;
pub mod forward;
pub mod map_budget;
pub mod memory_props;
pub mod null_guard;
pub mod state;
pub mod template;
pub mod wrap;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use state::BridgeState;
