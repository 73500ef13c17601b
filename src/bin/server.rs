//! AnyTLS node binary

use anyhow::{Context, Result};
use anytls_node::config::{AuthMode, Invocation, NodeConfig, PanelConfig, USAGE};
use anytls_node::padding::PaddingFactory;
use anytls_node::panel::{CredentialDirectory, PanelClient, TrafficAccountant};
use anytls_node::server::{Admitter, Server, ServerIdentity};
use anytls_node::util::{Resolver, create_server_config, create_server_config_from_files};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_NAME: &str = "anytls-node";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let mut config = match NodeConfig::parse(std::env::args().skip(1))? {
        Invocation::Run(config) => config,
        Invocation::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Invocation::Version => {
            println!("{APP_NAME} {VERSION}");
            return Ok(());
        }
    };

    let padding = match &config.padding_scheme {
        Some(path) => {
            let scheme = std::fs::read(path)
                .with_context(|| format!("Failed to read padding scheme file: {}", path.display()))?;
            let factory =
                PaddingFactory::new(&scheme).context("Failed to parse padding scheme")?;
            info!("[Node] Loaded padding scheme from {}", path.display());
            Arc::new(factory)
        }
        None => Arc::new(PaddingFactory::default()),
    };

    let tls_config = match &config.tls_files {
        Some((cert, key)) => {
            info!("[Node] Loading TLS certificate from {}", cert.display());
            create_server_config_from_files(cert, key).with_context(|| {
                format!("Failed to load certificate/key: {}, {}", cert.display(), key.display())
            })?
        }
        None => {
            info!("[Node] No certificate provided, generating self-signed certificate");
            create_server_config().context("Failed to create TLS server config")?
        }
    };

    let resolver = if config.dns_servers.is_empty() {
        Resolver::system()
    } else {
        Resolver::with_servers(&config.dns_servers).context("Invalid --dns server")?
    };

    let mut accountant = None;
    let identity = match &mut config.auth {
        AuthMode::Password(password) => ServerIdentity::from_password(password),
        AuthMode::Panel(panel) => {
            let (identity, traffic) = start_panel(panel, &mut config.listen).await?;
            accountant = Some(traffic);
            identity
        }
    };

    let admitter = Admitter::new(
        tls_config,
        Arc::new(identity),
        padding,
        Arc::new(resolver),
    )
    .with_fallback(config.fallback);
    let server = Server::new(admitter);

    info!("[Node] {APP_NAME} v{VERSION}");
    let result = tokio::select! {
        result = server.listen(config.listen) => result.context("Server stopped"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("[Node] Shutting down");
            Ok(())
        }
    };

    if let Some(accountant) = accountant {
        if let Err(e) = accountant.flush().await {
            error!("[Node] Final traffic report failed: {}", e);
        }
    }
    result
}

async fn start_panel(
    panel: &mut PanelConfig,
    listen: &mut SocketAddr,
) -> Result<(ServerIdentity, Arc<TrafficAccountant>)> {
    let client = Arc::new(
        PanelClient::new(&panel.api_host, &panel.api_key, panel.node_id)
            .context("Failed to create panel client")?,
    );
    match client.node_info().await {
        Ok(node_info) => {
            info!(
                "[Node] Panel node config: port={}, pull={}s, push={}s",
                node_info.server_port,
                node_info.base_config.pull_interval,
                node_info.base_config.push_interval
            );
            panel.apply_node_info(&node_info, listen);
        }
        Err(e) => warn!("[Node] Failed to fetch node config, using defaults: {}", e),
    }

    let directory = Arc::new(CredentialDirectory::new(client.clone()));
    let accountant = Arc::new(TrafficAccountant::new(client));

    Arc::clone(&directory).spawn_refresh_loop(panel.pull_interval());
    Arc::clone(&accountant).spawn_flush_loop(panel.push_interval());
    info!(
        "[Node] Panel mode: node {} (pull every {:?}, push every {:?})",
        panel.node_id,
        panel.pull_interval(),
        panel.push_interval()
    );

    Ok((
        ServerIdentity::from_directory(directory, Arc::clone(&accountant)),
        accountant,
    ))
}

/// `RUST_LOG`, then `LOG_LEVEL`, then `info`
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
