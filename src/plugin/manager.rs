//! Plugin lifecycle management
//!
//! Install verifies a manifest and its entry, activation resolves
//! dependencies depth-first and initializes each plugin exactly once, and
//! every transition is appended to the audit log.

use super::audit::{AuditAction, AuditEntry, AuditLog};
use super::loader::{validate_module, Plugin, PluginLoader};
use super::manifest::PluginManifest;
use crate::error::PluginError;
use crate::metrics::Metrics;
use crate::server::Server;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, PluginError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginState {
    Installed,
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub entry_path: PathBuf,
    /// Whether a declared digest was checked against the entry file
    pub checksum_verified: bool,
    pub state: PluginState,
    pub installed_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Manages plugin installation, activation and deactivation
pub struct PluginManager {
    loader: Arc<dyn PluginLoader>,
    /// Installed plugins indexed by name
    records: DashMap<String, PluginRecord>,
    /// Loaded modules, kept across deactivation
    loaded: DashMap<String, Arc<dyn Plugin>>,
    /// Serializes state transitions per plugin
    transitions: DashMap<String, Arc<Mutex<()>>>,
    audit: AuditLog,
    strict_deactivation: bool,
    metrics: Option<Arc<Metrics>>,
}

impl PluginManager {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            loader,
            records: DashMap::new(),
            loaded: DashMap::new(),
            transitions: DashMap::new(),
            audit: AuditLog::new(),
            strict_deactivation: false,
            metrics: None,
        }
    }

    /// Reject deactivating a plugin while activated plugins depend on it.
    pub fn with_strict_deactivation(mut self, strict: bool) -> Self {
        self.strict_deactivation = strict;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn transition_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.transitions
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Installs the plugin described by the manifest at `path`. Nothing is
    /// recorded unless every check passes.
    pub async fn install_from_manifest(&self, path: impl AsRef<Path>) -> Result<PluginRecord> {
        let path = path.as_ref();
        let manifest = PluginManifest::load(path)?;
        let checksum_verified = manifest.verify_integrity()?;

        let lock = self.transition_lock(&manifest.name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.records.get(&manifest.name) {
            if existing.state == PluginState::Activated {
                return Err(PluginError::AlreadyActivated {
                    name: manifest.name.clone(),
                });
            }
        }

        let record = PluginRecord {
            entry_path: manifest.entry_path.clone(),
            checksum_verified,
            manifest,
            state: PluginState::Installed,
            installed_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
        };
        let name = record.manifest.name.clone();
        // a reinstall may point at a different entry
        self.loaded.remove(&name);
        self.records.insert(name.clone(), record.clone());
        self.audit
            .record(AuditAction::Install, &name, &record.manifest.version);

        info!(
            plugin = %name,
            version = %record.manifest.version,
            manifest = %path.display(),
            "Plugin installed"
        );
        Ok(record)
    }

    /// Activates `name` after its dependencies. Already active plugins are
    /// left alone.
    pub async fn activate(&self, name: &str, server: &Arc<Server>) -> Result<()> {
        self.activate_on_path(name, server, Vec::new()).await
    }

    /// `path` holds the plugins whose activation is in progress above this
    /// one; meeting one of them again is a cycle.
    fn activate_on_path<'a>(
        &'a self,
        name: &'a str,
        server: &'a Arc<Server>,
        mut path: Vec<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let manifest = match self.records.get(name) {
                Some(record) if record.state == PluginState::Activated => return Ok(()),
                Some(record) => record.manifest.clone(),
                None => {
                    return Err(PluginError::NotInstalled {
                        name: name.to_string(),
                    })
                }
            };

            if path.iter().any(|p| p == name) {
                return Err(PluginError::CircularDependency {
                    name: name.to_string(),
                });
            }
            path.push(name.to_string());

            for dependency in &manifest.dependencies {
                debug!(plugin = %name, dependency = %dependency, "Activating dependency");
                self.activate_on_path(dependency, server, path.clone())
                    .await?;
            }

            let lock = self.transition_lock(name);
            let _guard = lock.lock().await;

            // another activation may have won the race for this plugin
            let manifest = match self.records.get(name) {
                Some(record) if record.state == PluginState::Activated => return Ok(()),
                Some(record) => record.manifest.clone(),
                None => {
                    return Err(PluginError::NotInstalled {
                        name: name.to_string(),
                    })
                }
            };

            let plugin = self.load(&manifest)?;
            plugin
                .initialize(server)
                .await
                .map_err(|e| PluginError::InitializationFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;

            if let Some(mut record) = self.records.get_mut(name) {
                record.state = PluginState::Activated;
                record.activated_at = Some(Utc::now());
            }
            self.audit
                .record(AuditAction::Activate, name, &manifest.version);
            if let Some(metrics) = &self.metrics {
                metrics.plugin_activated();
            }

            info!(plugin = %name, version = %manifest.version, "Plugin activated");
            Ok(())
        })
    }

    fn load(&self, manifest: &PluginManifest) -> Result<Arc<dyn Plugin>> {
        if let Some(plugin) = self.loaded.get(&manifest.name) {
            return Ok(plugin.value().clone());
        }
        let plugin = self.loader.load(manifest)?;
        validate_module(manifest, plugin.as_ref())?;
        self.loaded.insert(manifest.name.clone(), plugin.clone());
        Ok(plugin)
    }

    /// Activates every plugin that is not yet active, highest manifest
    /// priority first. Returns the names in the order they were requested.
    pub async fn activate_all(&self, server: &Arc<Server>) -> Result<Vec<String>> {
        let mut pending: Vec<(i64, String)> = self
            .records
            .iter()
            .filter(|r| r.state != PluginState::Activated)
            .map(|r| (r.manifest.priority, r.key().clone()))
            .collect();
        pending.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut activated = Vec::with_capacity(pending.len());
        for (_, name) in pending {
            self.activate(&name, server).await?;
            activated.push(name);
        }
        Ok(activated)
    }

    /// Deactivates an active plugin. Dependents are not deactivated; in
    /// strict mode their presence is an error.
    pub async fn deactivate(&self, name: &str) -> Result<()> {
        let lock = self.transition_lock(name);
        let _guard = lock.lock().await;

        let version = match self.records.get(name) {
            Some(record) if record.state == PluginState::Activated => {
                record.manifest.version.clone()
            }
            _ => {
                warn!(plugin = %name, "Deactivation requested for a plugin that is not active");
                return Ok(());
            }
        };

        let dependents: Vec<String> = self
            .records
            .iter()
            .filter(|r| {
                r.state == PluginState::Activated
                    && r.manifest.dependencies.iter().any(|d| d == name)
            })
            .map(|r| r.key().clone())
            .collect();
        if !dependents.is_empty() {
            if self.strict_deactivation {
                return Err(PluginError::ActiveDependents {
                    name: name.to_string(),
                    dependents,
                });
            }
            warn!(
                plugin = %name,
                dependents = ?dependents,
                "Deactivating plugin with active dependents"
            );
        }

        let plugin = self.loaded.get(name).map(|p| p.value().clone());
        if let Some(plugin) = plugin {
            if let Err(e) = plugin.cleanup().await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
            }
        }

        if let Some(mut record) = self.records.get_mut(name) {
            record.state = PluginState::Deactivated;
            record.deactivated_at = Some(Utc::now());
        }
        self.audit.record(AuditAction::Deactivate, name, &version);
        if let Some(metrics) = &self.metrics {
            metrics.plugin_deactivated();
        }

        info!(plugin = %name, "Plugin deactivated");
        Ok(())
    }

    /// Installed plugins sorted by name.
    pub fn list_plugins(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        records
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }

    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }
}
