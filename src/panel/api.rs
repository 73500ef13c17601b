//! V2board UniProxy HTTP client and the seams the node consumes it through.

use crate::util::{AnyTlsError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node type reported on every panel call
pub const NODE_TYPE: &str = "anytls";

/// Per-request timeout for panel calls
pub const PANEL_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const CONFIG_PATH: &str = "/api/v1/server/UniProxy/config";
const USER_PATH: &str = "/api/v1/server/UniProxy/user";
const PUSH_PATH: &str = "/api/v1/server/UniProxy/push";

/// Panel-assigned user id
pub type UserId = u64;

/// Id of static-secret connections; never accepted from the panel
pub const RESERVED_USER_ID: UserId = 0;

/// A user as listed by the panel. `uuid` is the client's secret.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PanelUser {
    pub id: UserId,
    pub uuid: String,
    #[serde(default)]
    pub speed_limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    #[serde(default)]
    users: Vec<PanelUser>,
}

/// Polling periods in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub push_interval: u64,
    #[serde(default)]
    pub pull_interval: u64,
}

/// Node settings served by the panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub base_config: BaseConfig,
}

/// Bytes moved by one user since the last successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub user_id: UserId,
    /// client -> destination
    pub u: u64,
    /// destination -> client
    pub d: u64,
}

/// Where the credential directory gets its users from
pub trait DirectorySource: Send + Sync {
    fn fetch_users(&self) -> BoxFuture<'_, Result<Vec<PanelUser>>>;
}

/// Where the accountant delivers flushed traffic
pub trait ReportingSink: Send + Sync {
    fn submit(&self, records: Vec<TrafficRecord>) -> BoxFuture<'_, Result<()>>;
}

/// HTTP client for one node on a V2board panel
#[derive(Debug, Clone)]
pub struct PanelClient {
    http: reqwest::Client,
    api_host: String,
    api_key: String,
    node_id: u64,
}

impl PanelClient {
    pub fn new(api_host: impl Into<String>, api_key: impl Into<String>, node_id: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PANEL_HTTP_TIMEOUT)
            .build()
            .map_err(|e| AnyTlsError::Config(format!("failed to build panel HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_host: api_host.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            node_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_host, path)
    }

    fn auth_query(&self) -> [(&'static str, String); 3] {
        [
            ("token", self.api_key.clone()),
            ("node_id", self.node_id.to_string()),
            ("node_type", NODE_TYPE.to_string()),
        ]
    }

    /// GET the node's configuration
    pub async fn node_info(&self) -> Result<NodeInfo> {
        let response = self
            .http
            .get(self.url(CONFIG_PATH))
            .query(&self.auth_query()[..])
            .send()
            .await
            .map_err(|e| AnyTlsError::DirectorySource(format!("node config request failed: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AnyTlsError::DirectorySource(format!(
                "node config API returned status {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AnyTlsError::DirectorySource(format!("reading node config failed: {}", e)))?;
        serde_json::from_str(&body).map_err(|e| {
            AnyTlsError::DirectorySource(format!("invalid node config JSON: {} (body: {})", e, body))
        })
    }

    /// GET the users allowed on this node
    pub async fn users(&self) -> Result<Vec<PanelUser>> {
        let response = self
            .http
            .get(self.url(USER_PATH))
            .query(&self.auth_query()[..])
            .send()
            .await
            .map_err(|e| AnyTlsError::DirectorySource(format!("user list request failed: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AnyTlsError::DirectorySource(format!(
                "user list API returned status {}",
                status.as_u16()
            )));
        }

        let list: UserListResponse = response
            .json()
            .await
            .map_err(|e| AnyTlsError::DirectorySource(format!("invalid user list JSON: {}", e)))?;
        Ok(list.users)
    }

    /// POST traffic records. An empty batch is not sent.
    pub async fn push_traffic(&self, records: &[TrafficRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .http
            .post(self.url(PUSH_PATH))
            .query(&self.auth_query()[..])
            .json(records)
            .send()
            .await
            .map_err(|e| AnyTlsError::ReportingSink(format!("traffic push failed: {}", e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AnyTlsError::ReportingSink(format!(
                "traffic push API returned status {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(())
    }
}

impl DirectorySource for PanelClient {
    fn fetch_users(&self) -> BoxFuture<'_, Result<Vec<PanelUser>>> {
        Box::pin(self.users())
    }
}

impl ReportingSink for PanelClient {
    fn submit(&self, records: Vec<TrafficRecord>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.push_traffic(&records).await })
    }
}
