use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bridge_engine::{
    HttpRelay, SessionConfig, SessionDeps, SessionRegistry, SidecarConnector,
};
use bridge_settings::BridgeSettings;
use bridge_store::{BackendClient, CredentialStore, HttpCredentialStore, MemoryCredentialStore};
use bridge_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "bridge", about = "Per-user messaging bridge session manager")]
struct Cli {
    /// Settings file (defaults to ~/.bridge/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the management API port.
    #[arg(long)]
    port: Option<u16>,

    /// Skip restoring previously linked sessions at startup.
    #[arg(long)]
    no_restore: bool,

    /// Keep credentials in memory instead of the backend.
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => bridge_settings::load_settings_from_path(path),
        None => bridge_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_filter = telemetry.filter_directive(),
        from_env = telemetry.from_env(),
        "starting bridge"
    );

    let registry = Arc::new(build_registry(&settings, cli.ephemeral)?);

    let restore_cancel = CancellationToken::new();
    let restore = if cli.no_restore {
        tracing::info!("session restore disabled");
        None
    } else {
        Some(bridge_engine::spawn_restore(
            registry.clone(),
            settings.sessions.restore_spacing(),
            restore_cancel.clone(),
        ))
    };

    let server_config = bridge_server::ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        api_key: settings.server.api_key.clone(),
        request_timeout: std::time::Duration::from_secs(settings.server.request_timeout_secs),
    };
    let server = bridge_server::start(server_config, registry.clone())
        .await
        .context("failed to start management API")?;
    tracing::info!(port = server.port(), "bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    restore_cancel.cancel();
    if let Some(task) = restore {
        let _ = task.await;
    }
    server.shutdown().await;
    registry.shutdown().await;

    tracing::info!("bridge stopped");
    Ok(())
}

fn build_registry(settings: &BridgeSettings, ephemeral: bool) -> anyhow::Result<SessionRegistry> {
    let backend = BackendClient::new(
        &settings.backend.base_url,
        settings.backend.api_key.clone(),
        settings.backend.timeout(),
    )
    .context("invalid backend settings")?;

    let store: Arc<dyn CredentialStore> = if ephemeral {
        tracing::warn!("ephemeral mode: credentials are lost on exit");
        Arc::new(MemoryCredentialStore::new())
    } else {
        Arc::new(HttpCredentialStore::new(backend.clone()))
    };

    let connector = SidecarConnector::new(
        &settings.sessions.sidecar_url,
        settings.backend.timeout(),
        settings.backend.timeout(),
    )
    .context("invalid sidecar url")?;

    let sessions = &settings.sessions;
    let deps = SessionDeps {
        connector: Arc::new(connector),
        store,
        relay: Arc::new(HttpRelay::new(backend)),
        config: SessionConfig {
            reconnect_delay: sessions.reconnect_delay(),
            key_flush_window: sessions.key_flush_window(),
            load_timeout: settings.backend.timeout(),
            event_buffer: sessions.event_buffer,
            command_buffer: sessions.command_buffer,
        },
    };
    Ok(SessionRegistry::new(deps))
}
