// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin HTTP client for the pod marketplace API.

use coral_error::CoralError;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

fn transport_err(what: &str) -> impl FnOnce(reqwest::Error) -> CoralError + '_ {
    move |e| CoralError::executor(format!("pod API {what} failed")).with_source(e)
}

/// One rentable machine offer in the marketplace.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    /// Marketplace cloud identifier.
    pub cloud_id: String,
    /// GPU model offered.
    pub gpu_type: String,
    /// Number of GPUs offered.
    #[serde(default)]
    pub gpu_count: u32,
    /// Availability status (`"Available"` is launchable).
    #[serde(default)]
    pub status: String,
    /// Data center the offer lives in.
    #[serde(default)]
    pub data_center_id: Option<String>,
    /// Country code of the offer.
    #[serde(default)]
    pub country: Option<String>,
    /// Socket/interconnect hint.
    #[serde(default)]
    pub socket: Option<String>,
    /// Concrete provider behind the marketplace entry.
    #[serde(default)]
    pub provider_type: Option<String>,
}

/// Client for the pod marketplace API.
#[derive(Debug, Clone)]
pub struct PodClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    team_id: Option<String>,
}

impl PodClient {
    /// Create a client against `base` with bearer-token auth.
    #[must_use]
    pub fn new(base: &str, api_key: &str, team_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            team_id,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{path}", self.base))
            .bearer_auth(&self.api_key);
        if let Some(team) = &self.team_id {
            req = req.header("X-Team-ID", team);
        }
        req
    }

    async fn json(
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Value, CoralError> {
        let response = req
            .send()
            .await
            .map_err(transport_err(what))?
            .error_for_status()
            .map_err(transport_err(what))?;
        response.json().await.map_err(transport_err(what))
    }

    /// List offers matching a GPU demand.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn availability(
        &self,
        gpu_type: &str,
        gpu_count: u32,
        regions: &[String],
        provider: Option<&str>,
    ) -> Result<Vec<Offer>, CoralError> {
        let mut query: Vec<(String, String)> = vec![
            ("gpu_type".into(), gpu_type.to_string()),
            ("gpu_count".into(), gpu_count.to_string()),
        ];
        for region in regions {
            query.push(("regions".into(), region.clone()));
        }
        if let Some(provider) = provider {
            query.push(("provider".into(), provider.to_string()));
        }
        let value = Self::json(
            self.request(reqwest::Method::GET, "/availability")
                .query(&query)
                .timeout(METADATA_TIMEOUT),
            "availability",
        )
        .await?;
        serde_json::from_value(value["data"].clone())
            .map_err(|e| CoralError::executor("malformed availability response").with_source(e))
    }

    /// Create a pod; returns the pod id.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a response without a pod id.
    pub async fn create_pod(&self, payload: &Value) -> Result<String, CoralError> {
        debug!("creating pod");
        let value = Self::json(
            self.request(reqwest::Method::POST, "/pods")
                .json(payload)
                .timeout(OPERATION_TIMEOUT),
            "create_pod",
        )
        .await?;
        value["data"]["podId"]
            .as_str()
            .or_else(|| value["data"]["pod_id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CoralError::executor(format!("unexpected pod creation response: {value}"))
            })
    }

    /// Current status string for a pod.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn pod_status(&self, pod_id: &str) -> Result<String, CoralError> {
        let value = Self::json(
            self.request(reqwest::Method::GET, &format!("/pods/{pod_id}/status"))
                .timeout(METADATA_TIMEOUT),
            "pod_status",
        )
        .await?;
        Ok(value["data"]["status"]
            .as_str()
            .or_else(|| value["data"]["state"].as_str())
            .unwrap_or("")
            .to_string())
    }

    /// Delete a pod.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn delete_pod(&self, pod_id: &str) -> Result<(), CoralError> {
        debug!(pod_id, "deleting pod");
        self.request(reqwest::Method::DELETE, &format!("/pods/{pod_id}"))
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("delete_pod"))?
            .error_for_status()
            .map_err(transport_err("delete_pod"))?;
        Ok(())
    }

    /// Fetch pod log lines starting at `cursor`.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn pod_logs(
        &self,
        pod_id: &str,
        cursor: usize,
    ) -> Result<Vec<String>, CoralError> {
        let value = Self::json(
            self.request(reqwest::Method::GET, &format!("/pods/{pod_id}/logs"))
                .query(&[("offset", cursor.to_string())])
                .timeout(METADATA_TIMEOUT),
            "pod_logs",
        )
        .await?;
        Ok(value["data"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Run a command on the pod host over the authenticated shell channel
    /// and return its output lines.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn exec(
        &self,
        pod_id: &str,
        env_vars: &[Value],
        command: &str,
    ) -> Result<Vec<String>, CoralError> {
        debug!(pod_id, command, "executing on pod host");
        let value = Self::json(
            self.request(reqwest::Method::POST, &format!("/pods/{pod_id}/exec"))
                .json(&serde_json::json!({
                    "envVars": env_vars,
                    "command": command,
                }))
                .timeout(Duration::from_secs(600)),
            "exec",
        )
        .await?;
        Ok(value["data"]["output"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Pre-flight check that the registry image is pullable with the
    /// stored credentials.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn check_docker_image(
        &self,
        image_uri: &str,
        credentials_id: &str,
    ) -> Result<(), CoralError> {
        Self::json(
            self.request(reqwest::Method::POST, "/images/check")
                .json(&serde_json::json!({
                    "image": image_uri,
                    "credentialsId": credentials_id,
                }))
                .timeout(OPERATION_TIMEOUT),
            "check_docker_image",
        )
        .await
        .map(|_| ())
    }

    /// Find an existing launch template for an image URI.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn find_template(&self, image_uri: &str) -> Result<Option<String>, CoralError> {
        let value = Self::json(
            self.request(reqwest::Method::GET, "/templates")
                .query(&[("image", image_uri)])
                .timeout(METADATA_TIMEOUT),
            "find_template",
        )
        .await?;
        Ok(value["data"]
            .as_array()
            .and_then(|t| t.first())
            .and_then(|t| t["id"].as_str())
            .map(str::to_string))
    }

    /// Create a launch template for an image URI; returns its id.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a response without a template id.
    pub async fn create_template(
        &self,
        image_uri: &str,
        credentials_id: Option<&str>,
    ) -> Result<String, CoralError> {
        let value = Self::json(
            self.request(reqwest::Method::POST, "/templates")
                .json(&serde_json::json!({
                    "image": image_uri,
                    "credentialsId": credentials_id,
                }))
                .timeout(OPERATION_TIMEOUT),
            "create_template",
        )
        .await?;
        value["data"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                CoralError::builder(format!("unexpected template response: {value}"))
            })
    }
}
