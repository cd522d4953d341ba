use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::plugin::{PluginLoader, PluginManager};
use std::sync::Arc;
use tracing::{error, info};

/// Validates the configuration and installs every configured manifest
/// without activating anything, then prints the resulting plugin table and
/// audit trail.
pub async fn run_config_check(config: &Config, loader: Arc<dyn PluginLoader>) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate_serving(config)?;
    info!("✓ Configuration is valid");

    if config.resilience.is_empty() {
        info!("  No resilience policies configured");
    }

    let manager =
        PluginManager::new(loader).with_strict_deactivation(config.plugins.strict_deactivation);
    let mut all_ok = true;

    info!("Checking {} plugin manifest(s)...", config.plugins.manifests.len());
    for path in &config.plugins.manifests {
        match manager.install_from_manifest(path).await {
            Ok(record) => info!(
                "  ✓ {} {} ({})",
                record.manifest.name,
                record.manifest.version,
                record.manifest.entry_path.display()
            ),
            Err(e) => {
                error!("  ✗ {}: {}", path, e);
                all_ok = false;
            }
        }
    }

    let plugins = manager.list_plugins();
    for record in &plugins {
        for dep in &record.manifest.dependencies {
            if manager.get_plugin(dep).is_none() {
                error!(
                    "  ✗ {} depends on {}, which is not installed",
                    record.manifest.name, dep
                );
                all_ok = false;
            }
        }
    }

    for name in &config.plugins.activate {
        if manager.get_plugin(name).is_none() {
            error!("  ✗ {} is listed for activation but not installed", name);
            all_ok = false;
        }
    }

    println!("{:<24} {:<12} {:<10} DEPENDENCIES", "PLUGIN", "VERSION", "PRIORITY");
    for record in &plugins {
        println!(
            "{:<24} {:<12} {:<10} {}",
            record.manifest.name,
            record.manifest.version,
            record.manifest.priority,
            record.manifest.dependencies.join(", ")
        );
    }

    println!();
    println!("AUDIT LOG");
    for entry in manager.get_audit_log() {
        println!(
            "{} {:<10} {} {}",
            entry.timestamp.to_rfc3339(),
            format!("{:?}", entry.action).to_lowercase(),
            entry.plugin,
            entry.version
        );
    }

    if all_ok {
        info!("✓ All checks passed");
        Ok(())
    } else {
        Err(ConfigError::Validation("One or more plugins failed checks".to_string()).into())
    }
}
