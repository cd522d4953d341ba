use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcp_rust_server::commands;
use mcp_rust_server::config::{self, Config, LoggingConfig};
use mcp_rust_server::error::Result;
use mcp_rust_server::metrics::Metrics;
use mcp_rust_server::plugin::{Plugin, PluginLoader, PluginManager, StaticPluginLoader};
use mcp_rust_server::resilience;
use mcp_rust_server::server::Server;
use mcp_rust_server::tools::{handler_fn, Tool};
use mcp_rust_server::transport::StdioTransport;

#[derive(Parser, Debug)]
#[command(name = "mcp-rust-server")]
#[command(
    about = "Model Context Protocol server with middleware, resilience policies and plugins",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve over stdio (default)
    Run,
    /// Validate configuration and plugin manifests
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration first; logging settings live in it
    let config = match &args.config {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(&LoggingConfig::default(), args.debug)?;
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_tracing(&config.logging, args.debug)?;
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    let loader: Arc<dyn PluginLoader> = Arc::new(builtin_plugins());

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(&config, loader).await?,
        Command::Run => run(config, loader).await?,
    }
    Ok(())
}

/// Logs go to stderr; stdout belongs to the stdio transport.
fn init_tracing(logging: &LoggingConfig, debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::from_default_env().add_directive(format!("mcp_rust_server={level}").parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow::anyhow!(e.to_string()))
}

async fn run(config: Config, loader: Arc<dyn PluginLoader>) -> Result<()> {
    config::validate_serving(&config)?;
    info!("Starting {} v{}", config.server.name, config.server.version);

    let metrics = Arc::new(Metrics::new());
    let transport = Arc::new(StdioTransport::new());
    let server = Server::builder()
        .name(config.server.name.clone())
        .version(config.server.version.clone())
        .transport(transport.clone())
        .metrics(metrics.clone())
        .build();

    let installed = resilience::install(
        server.handler_chain(),
        &config.resilience,
        Some(metrics.clone()),
    );
    if !installed.is_empty() {
        info!("Resilience policies: {}", installed.join(", "));
    }

    let plugins = PluginManager::new(loader)
        .with_strict_deactivation(config.plugins.strict_deactivation)
        .with_metrics(metrics.clone());

    for path in &config.plugins.manifests {
        plugins.install_from_manifest(path).await?;
    }
    if config.plugins.activate.is_empty() {
        plugins.activate_all(&server).await?;
    } else {
        for name in &config.plugins.activate {
            plugins.activate(name, &server).await?;
        }
    }
    info!("{} handler(s) registered", server.list_handlers().len());

    server.start().await?;

    tokio::select! {
        _ = shutdown_signal() => {},
        _ = wait_for_disconnect(&transport) => {
            info!("Client disconnected");
        },
    }

    for record in plugins.list_plugins().into_iter().rev() {
        if let Err(e) = plugins.deactivate(&record.manifest.name).await {
            warn!(plugin = %record.manifest.name, error = %e, "Failed to deactivate plugin");
        }
    }
    server.stop().await?;

    info!("Server stopped");
    Ok(())
}

async fn wait_for_disconnect(transport: &StdioTransport) {
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        interval.tick().await;
        if !transport.is_running() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

/// Plugins compiled into the binary. A manifest still has to name them.
fn builtin_plugins() -> StaticPluginLoader {
    StaticPluginLoader::new().with("echo", |manifest| {
        Arc::new(EchoPlugin {
            version: manifest.version.clone(),
        }) as Arc<dyn Plugin>
    })
}

struct EchoPlugin {
    version: String,
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn initialize(&self, server: &Arc<Server>) -> Result<()> {
        let tool = Tool::new(
            "echo",
            "Returns the given text",
            handler_fn(|input, _ctx| async move { Ok(json!({ "text": input["text"].clone() })) }),
        )
        .with_schema(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }))?;
        server.register_handler(tool);
        Ok(())
    }
}
