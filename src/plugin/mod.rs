//! Plugin system
//!
//! Plugins are described by a JSON manifest naming an entry file, optional
//! dependencies and an optional sha256 integrity digest. The module itself
//! comes from a [`PluginLoader`]; the bundled [`StaticPluginLoader`] maps
//! manifest names to factories compiled into the host.
//!
//! # Modules
//!
//! - `manifest`: manifest parsing, entry resolution and integrity checks
//! - `loader`: the `Plugin` trait and registered-factory loading
//! - `manager`: install / activate / deactivate lifecycle
//! - `audit`: append-only record of lifecycle transitions

pub mod audit;
pub mod loader;
pub mod manager;
pub mod manifest;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use loader::{Plugin, PluginLoader, StaticPluginLoader};
pub use manager::{PluginManager, PluginRecord, PluginState};
pub use manifest::{Integrity, PluginManifest};
