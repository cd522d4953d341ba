use super::schema::{Config, TransportConfig};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;

const ENV_PREFIX: &str = "MCP_SERVER_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("mcp-server.toml"))
        .merge(Json::file("mcp-server.json"))
        .merge(Yaml::file("mcp-server.yaml"))
        .merge(Yaml::file("mcp-server.yml"))
        // Override with environment variables, e.g. MCP_SERVER_LOGGING__LEVEL
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.name.trim().is_empty() {
        return Err(ConfigError::Validation("Server name must not be empty".into()).into());
    }

    let resilience = &config.resilience;
    if let Some(cb) = &resilience.circuit_breaker {
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "Circuit breaker thresholds must be greater than 0".into(),
            )
            .into());
        }
    }

    if let Some(retry) = &resilience.retry {
        if retry.max_attempts == 0 {
            return Err(
                ConfigError::Validation("Retry maxAttempts must be greater than 0".into()).into(),
            );
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "Retry backoffMultiplier must be at least 1".into(),
            )
            .into());
        }
    }

    if let Some(bulkhead) = &resilience.bulkhead {
        if bulkhead.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "Bulkhead maxConcurrent must be greater than 0".into(),
            )
            .into());
        }
    }

    Ok(())
}

/// Checks that the stand-alone binary can serve this configuration.
pub fn validate_serving(config: &Config) -> Result<()> {
    validate(config)?;
    match config.transport {
        TransportConfig::Stdio => Ok(()),
        TransportConfig::Channel => Err(ConfigError::Validation(
            "The channel transport is only available to embedded servers".into(),
        )
        .into()),
    }
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for manifest in &mut config.plugins.manifests {
        *manifest = substitute_env_vars(manifest)?;
    }
    Ok(config)
}

/// Expands `${VAR}` and `${VAR:-default}`. An unset variable without a
/// default is an error.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let (name, default) = match cap[1].split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (&cap[1], None),
        };
        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MCP_SERVER_TEST_PLUGIN_DIR", "/opt/plugins");

        let result =
            substitute_env_vars("${MCP_SERVER_TEST_PLUGIN_DIR}/audit/plugin.json").unwrap();
        assert_eq!(result, "/opt/plugins/audit/plugin.json");

        let result = substitute_env_vars("${MCP_SERVER_TEST_MISSING:-./plugins}/a.json").unwrap();
        assert_eq!(result, "./plugins/a.json");

        assert!(substitute_env_vars("${MCP_SERVER_TEST_MISSING}").is_err());

        std::env::remove_var("MCP_SERVER_TEST_PLUGIN_DIR");
    }

    #[tokio::test]
    async fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[server]
name = "demo"

[transport]
type = "channel"

[resilience.retry]
maxAttempts = 4

[resilience.timeout]
defaultTimeoutMs = 500

[plugins]
manifests = ["${{MCP_SERVER_TEST_UNSET:-plugins}}/echo.json"]
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.server.name, "demo");
        assert_eq!(config.transport, TransportConfig::Channel);
        assert_eq!(config.resilience.retry.as_ref().unwrap().max_attempts, 4);
        assert_eq!(config.resilience.timeout.as_ref().unwrap().default_timeout_ms, 500);
        assert!(config.resilience.bulkhead.is_none());
        assert_eq!(config.plugins.manifests, vec!["plugins/echo.json"]);
        assert_eq!(config.logging.level, "info");

        let err = validate_serving(&config).unwrap_err();
        assert!(err.to_string().contains("embedded servers"));
        let stdio = Config {
            transport: TransportConfig::Stdio,
            ..config
        };
        assert!(validate_serving(&stdio).is_ok());
    }

    #[tokio::test]
    async fn test_validation_and_format_errors() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"resilience": {{"bulkhead": {{"maxConcurrent": 0}}}}}}"#).unwrap();
        let err = load_from_path(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("maxConcurrent"));

        let err = load_from_path("config.ini").await.unwrap_err();
        assert!(err.to_string().contains("Unsupported config file format"));
    }
}
