//! Command-line configuration of the node

use crate::panel::NodeInfo;
use crate::server::Fallback;
use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8443";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

pub const USAGE: &str = "\
Usage: anytls-node [OPTIONS]
Options:
  -l, --listen ADDRESS           Listen address (default: 0.0.0.0:8443)
  -p, --password PASSWORD        Shared password (single-user mode)
      --cert FILE                Path to PEM encoded TLS certificate
      --key  FILE                Path to PEM encoded TLS private key
      --padding-scheme FILE      Path to padding scheme file
      --dns SERVER               Upstream DNS server, repeatable (default: system)
      --fallback ADDRESS         Relay unauthenticated connections to ADDRESS
      --panel-api-host URL       V2board panel base URL
      --panel-api-key KEY        Panel node token
      --panel-node-id ID         Panel node id
      --panel-pull-interval SECS User list refresh period (default: 60)
      --panel-push-interval SECS Traffic report period (default: 60)
  -V, --version                  Show version information
  -h, --help                     Show this help message";

/// What the binary was asked to do
#[derive(Debug)]
pub enum Invocation {
    Run(NodeConfig),
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelConfig {
    pub api_host: String,
    pub api_key: String,
    pub node_id: u64,
    pull_interval: Option<u64>,
    push_interval: Option<u64>,
    panel_pull_interval: Option<u64>,
    panel_push_interval: Option<u64>,
}

impl PanelConfig {
    /// Flag value, else what the panel announced, else the default
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(
            self.pull_interval
                .or(self.panel_pull_interval)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        )
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(
            self.push_interval
                .or(self.panel_push_interval)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        )
    }

    /// Fold the panel's node config in: a non-zero port overrides `listen`,
    /// non-zero intervals apply where no flag was given.
    pub fn apply_node_info(&mut self, info: &NodeInfo, listen: &mut SocketAddr) {
        if info.server_port != 0 {
            listen.set_port(info.server_port);
        }
        let base = &info.base_config;
        self.panel_pull_interval = (base.pull_interval > 0).then_some(base.pull_interval);
        self.panel_push_interval = (base.push_interval > 0).then_some(base.push_interval);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Password(String),
    Panel(PanelConfig),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub auth: AuthMode,
    pub padding_scheme: Option<PathBuf>,
    pub tls_files: Option<(PathBuf, PathBuf)>,
    pub dns_servers: Vec<String>,
    pub fallback: Fallback,
}

impl NodeConfig {
    /// Parse arguments (without the program name)
    pub fn parse<I>(args: I) -> Result<Invocation>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mut listen = DEFAULT_LISTEN.to_string();
        let mut password = None;
        let mut padding_scheme = None;
        let mut cert_path = None;
        let mut key_path = None;
        let mut dns_servers = Vec::new();
        let mut fallback = Fallback::Close;
        let mut api_host = None;
        let mut api_key = None;
        let mut node_id = None;
        let mut pull_interval = None;
        let mut push_interval = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-l" | "--listen" => {
                    listen = args.next().context("Expected listen address after -l")?;
                }
                "-p" | "--password" => {
                    password = Some(args.next().context("Expected password after -p")?);
                }
                "--padding-scheme" => {
                    padding_scheme = Some(PathBuf::from(
                        args.next()
                            .context("Expected padding scheme file after --padding-scheme")?,
                    ));
                }
                "--cert" => {
                    cert_path = Some(PathBuf::from(
                        args.next().context("Expected certificate path after --cert")?,
                    ));
                }
                "--key" => {
                    key_path = Some(PathBuf::from(
                        args.next().context("Expected private key path after --key")?,
                    ));
                }
                "--dns" => {
                    dns_servers.push(args.next().context("Expected DNS server after --dns")?);
                }
                "--fallback" => {
                    let value = args.next().context("Expected address after --fallback")?;
                    let addr = value
                        .parse::<SocketAddr>()
                        .with_context(|| format!("Invalid fallback address: {}", value))?;
                    fallback = Fallback::Relay(addr);
                }
                "--panel-api-host" => {
                    api_host = Some(args.next().context("Expected URL after --panel-api-host")?);
                }
                "--panel-api-key" => {
                    api_key = Some(args.next().context("Expected key after --panel-api-key")?);
                }
                "--panel-node-id" => {
                    let value = args.next().context("Expected id after --panel-node-id")?;
                    node_id = Some(parse_u64(&value, "--panel-node-id")?);
                }
                "--panel-pull-interval" => {
                    let value = args
                        .next()
                        .context("Expected seconds after --panel-pull-interval")?;
                    pull_interval = Some(parse_u64(&value, "--panel-pull-interval")?);
                }
                "--panel-push-interval" => {
                    let value = args
                        .next()
                        .context("Expected seconds after --panel-push-interval")?;
                    push_interval = Some(parse_u64(&value, "--panel-push-interval")?);
                }
                "-V" | "--version" => return Ok(Invocation::Version),
                "-h" | "--help" => return Ok(Invocation::Help),
                _ => bail!("Unknown argument: {}", arg),
            }
        }

        let listen = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", listen))?;

        let tls_files = match (cert_path, key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => bail!("Both --cert and --key must be provided together"),
        };

        let panel_requested = api_host.is_some() || api_key.is_some() || node_id.is_some();
        let auth = if panel_requested {
            if password.is_some() {
                bail!("--password cannot be combined with panel options");
            }
            AuthMode::Panel(PanelConfig {
                api_host: api_host.context("Panel mode requires --panel-api-host")?,
                api_key: api_key.context("Panel mode requires --panel-api-key")?,
                node_id: node_id.context("Panel mode requires --panel-node-id")?,
                pull_interval,
                push_interval,
                panel_pull_interval: None,
                panel_push_interval: None,
            })
        } else {
            AuthMode::Password(
                password.context("Password is required (use -p or panel options)")?,
            )
        };

        Ok(Invocation::Run(NodeConfig {
            listen,
            auth,
            padding_scheme,
            tls_files,
            dns_servers,
            fallback,
        }))
    }

}

fn parse_u64(value: &str, flag: &str) -> Result<u64> {
    let parsed = value
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("{} expects a positive integer: {}", flag, e))?;
    if parsed == 0 {
        bail!("{} expects a value greater than 0", flag);
    }
    Ok(parsed)
}
