//! HTTP client for the control REST API.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CliError, Result};

/// A loaded plugin as listed by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSummary {
    pub name: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub signed: bool,
    pub status: String,
}

/// A running instance, present with `--details`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSummary {
    pub id: u32,
    pub name: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub hit_count: u64,
    #[serde(default)]
    pub last_hit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginList {
    pub loaded: Vec<PluginSummary>,
    #[serde(default)]
    pub available: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub state: String,
    pub hit_count: u64,
    pub miss_count: u64,
    pub fail_count: u64,
    #[serde(default)]
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricSummary {
    pub namespace: String,
    pub version: u32,
    pub data_type: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub subscriptions: u64,
}

/// Thin typed wrapper over the REST endpoints.
pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Decode a response, turning API error bodies into [`CliError::Api`].
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        tracing::debug!(%status, "control plane returned an error");
        let message = match response.json::<Value>().await {
            Ok(body) => body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            Err(_) => format!("request failed with status {status}"),
        };
        Err(CliError::Api(message))
    }

    pub async fn load_plugin(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        signature: Option<(String, Vec<u8>)>,
    ) -> Result<PluginSummary> {
        let mut form = reqwest::multipart::Form::new().part(
            "plugin",
            reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string()),
        );
        if let Some((sig_name, sig_bytes)) = signature {
            form = form.part(
                "signature",
                reqwest::multipart::Part::bytes(sig_bytes).file_name(sig_name),
            );
        }
        let response = self
            .http
            .post(self.url("/v1/plugins"))
            .multipart(form)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn unload_plugin(
        &self,
        plugin_type: &str,
        name: &str,
        version: u32,
    ) -> Result<PluginSummary> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/plugins/{plugin_type}/{name}/{version}")))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn list_plugins(&self, details: bool) -> Result<PluginList> {
        let mut url = self.url("/v1/plugins");
        if details {
            url.push_str("?details=1");
        }
        Self::decode(self.http.get(url).send().await?).await
    }

    pub async fn list_metrics(&self) -> Result<Vec<MetricSummary>> {
        Self::decode(self.http.get(self.url("/v1/metrics")).send().await?).await
    }

    pub async fn get_metrics(&self, namespace: &str, ver: u32) -> Result<Vec<MetricSummary>> {
        let path = format!("/v1/metrics{namespace}?ver={ver}");
        Self::decode(self.http.get(self.url(&path)).send().await?).await
    }

    pub async fn create_task(&self, manifest: &Value) -> Result<TaskSummary> {
        let response = self
            .http
            .post(self.url("/v1/tasks"))
            .json(manifest)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        Self::decode(self.http.get(self.url("/v1/tasks")).send().await?).await
    }

    pub async fn task_action(&self, id: &str, action: &str) -> Result<TaskSummary> {
        let response = self
            .http
            .put(self.url(&format!("/v1/tasks/{id}/{action}")))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn remove_task(&self, id: &str) -> Result<TaskSummary> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/tasks/{id}")))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn export_task(&self, id: &str) -> Result<Value> {
        Self::decode(
            self.http
                .get(self.url(&format!("/v1/tasks/{id}/export")))
                .send()
                .await?,
        )
        .await
    }

    /// Open the watch stream; returns the raw byte stream of JSON
    /// lines.
    pub async fn watch_task(&self, id: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(self.url(&format!("/v1/tasks/{id}/watch")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Self::decode::<Value>(response).await.map(|_| unreachable!());
        }
        Ok(response)
    }
}

/// Serializable task manifest assembled by `task create`.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEnvelope {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub schedule: Value,
    pub workflow: Value,
    pub start: bool,
}
