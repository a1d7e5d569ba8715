//! Process-wide mutable configuration lookups.

pub mod config_registry;

pub use config_registry::ConfigRegistry;
