//! Plugin interface and registered-factory loading

use super::manifest::PluginManifest;
use crate::error::{PluginError, Result};
use crate::server::Server;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// An extension that installs itself into a server.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Called once per activation. Typically registers handlers, hooks and
    /// middleware on `server`.
    async fn initialize(&self, server: &Arc<Server>) -> Result<()>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

pub trait PluginLoader: Send + Sync + 'static {
    fn load(&self, manifest: &PluginManifest) -> std::result::Result<Arc<dyn Plugin>, PluginError>;
}

type Factory = dyn Fn(&PluginManifest) -> Arc<dyn Plugin> + Send + Sync;

/// Loader backed by factories compiled into the binary, keyed by manifest
/// name. The manifest and its entry file still gate installation.
#[derive(Default)]
pub struct StaticPluginLoader {
    factories: DashMap<String, Arc<Factory>>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest) -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginManifest) -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self, manifest: &PluginManifest) -> std::result::Result<Arc<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(&manifest.name)
            .map(|f| f.value().clone())
            .ok_or_else(|| PluginError::InvalidPluginModule {
                name: manifest.name.clone(),
                reason: "no plugin factory registered under this name".into(),
            })?;
        Ok(factory(manifest))
    }
}

/// Rejects modules that do not identify themselves consistently with their
/// manifest.
pub fn validate_module(
    manifest: &PluginManifest,
    plugin: &dyn Plugin,
) -> std::result::Result<(), PluginError> {
    let reason = if plugin.name().trim().is_empty() {
        Some("module does not declare a name".to_string())
    } else if plugin.version().trim().is_empty() {
        Some("module does not declare a version".to_string())
    } else if plugin.name() != manifest.name {
        Some(format!(
            "module name '{}' does not match manifest",
            plugin.name()
        ))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PluginError::InvalidPluginModule {
            name: manifest.name.clone(),
            reason,
        }),
        None => Ok(()),
    }
}
