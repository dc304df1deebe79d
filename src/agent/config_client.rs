//! Client for the controller's named-configuration HTTP API.

use super::catalog::ServiceCatalogEntry;
use super::store::AgentIdentity;
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONFIG_NAME: &str = "default";
const SYNC_SOURCE: &str = "client_sync";

/// External config collaborator used by the orchestrator and handler.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Record the API base learned from DISCOVER. Returns true when it changed.
    async fn set_api_base(&self, base: String) -> bool;

    async fn api_base(&self) -> Option<String>;

    /// Download config `name` for `entry` into its `config_file`.
    async fn fetch(&self, entry: &ServiceCatalogEntry, name: &str) -> Result<()>;

    /// Upload `entry`'s local config file.
    async fn push(&self, entry: &ServiceCatalogEntry, identity: &AgentIdentity) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct StoredConfig {
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ConfigUpload<'a> {
    name: &'a str,
    data: &'a Value,
    serial: &'a str,
    host: &'a str,
    source: &'a str,
    overwrite: bool,
}

pub struct HttpConfigClient {
    http: reqwest::Client,
    base: RwLock<Option<String>>,
}

impl HttpConfigClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FleetError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base: RwLock::new(None),
        })
    }

    async fn require_base(&self) -> Result<String> {
        self.base
            .read()
            .await
            .clone()
            .ok_or_else(|| FleetError::Config("no config API known yet".into()))
    }
}

#[async_trait]
impl ConfigSource for HttpConfigClient {
    async fn set_api_base(&self, base: String) -> bool {
        let mut current = self.base.write().await;
        if current.as_deref() == Some(base.as_str()) {
            return false;
        }
        info!("Config API at {}", base);
        *current = Some(base);
        true
    }

    async fn api_base(&self) -> Option<String> {
        self.base.read().await.clone()
    }

    async fn fetch(&self, entry: &ServiceCatalogEntry, name: &str) -> Result<()> {
        let target = entry.config_file.as_ref().ok_or_else(|| {
            FleetError::Config(format!("service '{}' does not take named configs", entry.id))
        })?;
        let url = config_url(&self.require_base().await?, &[entry.id.as_str(), name])?;

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FleetError::Config(format!("config '{name}' unavailable: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(
                service = %entry.id,
                "Config '{}' not found on server, keeping local file",
                name
            );
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(FleetError::Config(format!(
                "config '{name}' unavailable ({})",
                response.status()
            )));
        }

        let stored: StoredConfig = response
            .json()
            .await
            .map_err(|e| FleetError::Config(format!("config '{name}' malformed: {e}")))?;
        let data = with_config_name(stored.data, name)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, serde_json::to_vec_pretty(&data)?).await?;
        info!(service = %entry.id, "Config '{}' written to {}", name, target.display());
        Ok(())
    }

    async fn push(&self, entry: &ServiceCatalogEntry, identity: &AgentIdentity) -> Result<()> {
        let Some(ref path) = entry.config_file else {
            return Ok(());
        };
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return Ok(());
        };
        let data: Value = serde_json::from_str(&content)?;
        let name = data
            .get("config_name")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CONFIG_NAME)
            .to_string();

        let url = config_url(&self.require_base().await?, &[entry.id.as_str()])?;
        let body = ConfigUpload {
            name: &name,
            data: &data,
            serial: &identity.serial,
            host: &identity.host,
            source: SYNC_SOURCE,
            overwrite: true,
        };

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::Config(format!("config upload failed: {e}")))?;
        if !response.status().is_success() {
            return Err(FleetError::Config(format!(
                "config upload rejected ({})",
                response.status()
            )));
        }
        info!(service = %entry.id, "Local config '{}' synced to server", name);
        Ok(())
    }
}

/// `{base}/api/configs/{segments}` with each segment percent-encoded, so
/// a name cannot escape its path component.
fn config_url(base: &str, segments: &[&str]) -> Result<reqwest::Url> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| FleetError::Config(format!("bad config API address '{base}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| FleetError::Config(format!("config API address '{base}' cannot take a path")))?
        .pop_if_empty()
        .extend(["api", "configs"])
        .extend(segments);
    Ok(url)
}

/// Stored blobs must be objects; the requested name is stamped in when absent.
fn with_config_name(data: Option<Value>, name: &str) -> Result<Value> {
    let Some(Value::Object(mut map)) = data else {
        return Err(FleetError::Config(format!("config '{name}' has no data object")));
    };
    map.entry("config_name")
        .or_insert_with(|| Value::String(name.to_string()));
    Ok(Value::Object(map))
}
