// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thin HTTP clients for the batch service and its object store.

use coral_error::CoralError;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Timeout for metadata calls (job state, existence checks).
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for mutating operations (create/delete).
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for payload transfers (bundles, results).
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

fn transport_err(what: &str) -> impl FnOnce(reqwest::Error) -> CoralError + '_ {
    move |e| CoralError::executor(format!("batch API {what} failed")).with_source(e)
}

/// Client for the batch job API.
#[derive(Debug, Clone)]
pub struct BatchClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl BatchClient {
    /// Create a client against `base` (e.g. `https://batch.example.com/v1`).
    #[must_use]
    pub fn new(base: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Create a job under the given parent.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn create_job(
        &self,
        parent: &str,
        job_id: &str,
        payload: &Value,
    ) -> Result<Value, CoralError> {
        debug!(parent, job_id, "creating batch job");
        let response = self
            .request(reqwest::Method::POST, &format!("/{parent}/jobs"))
            .query(&[("job_id", job_id)])
            .json(payload)
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("create_job"))?
            .error_for_status()
            .map_err(transport_err("create_job"))?;
        response.json().await.map_err(transport_err("create_job"))
    }

    /// Fetch a job's current description.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn get_job(&self, name: &str) -> Result<Value, CoralError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{name}"))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("get_job"))?
            .error_for_status()
            .map_err(transport_err("get_job"))?;
        response.json().await.map_err(transport_err("get_job"))
    }

    /// Delete a job.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn delete_job(&self, name: &str) -> Result<(), CoralError> {
        debug!(name, "deleting batch job");
        self.request(reqwest::Method::DELETE, &format!("/{name}"))
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("delete_job"))?
            .error_for_status()
            .map_err(transport_err("delete_job"))?;
        Ok(())
    }

    /// Look up the digest of a registry image by tag. `None` when absent.
    ///
    /// # Errors
    ///
    /// Propagates transport failures other than 404.
    pub async fn get_image_digest(
        &self,
        parent: &str,
        tag: &str,
    ) -> Result<Option<String>, CoralError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{parent}/images/{tag}"))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("get_image_digest"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = response
            .error_for_status()
            .map_err(transport_err("get_image_digest"))?
            .json()
            .await
            .map_err(transport_err("get_image_digest"))?;
        Ok(value["digest"].as_str().map(str::to_string))
    }

    /// Fetch log entries matching a label, starting after `cursor`.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn list_log_entries(
        &self,
        project: &str,
        label: (&str, &str),
        cursor: usize,
    ) -> Result<Vec<String>, CoralError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/projects/{project}/logs"))
            .query(&[
                ("label_key", label.0),
                ("label_value", label.1),
                ("offset", &cursor.to_string()),
            ])
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(transport_err("list_log_entries"))?
            .error_for_status()
            .map_err(transport_err("list_log_entries"))?;
        let value: Value = response
            .json()
            .await
            .map_err(transport_err("list_log_entries"))?;
        Ok(value["entries"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Client for the object store behind the batch backend.
#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl StorageClient {
    /// Create a client against `base` (e.g. `https://storage.example.com`).
    #[must_use]
    pub fn new(base: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Absolute object URI for a bucket key.
    #[must_use]
    pub fn object_uri(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.base)
    }

    fn request(&self, method: reqwest::Method, uri: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, uri);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Whether an object already exists.
    ///
    /// # Errors
    ///
    /// Propagates transport failures other than 404.
    pub async fn exists(&self, uri: &str) -> Result<bool, CoralError> {
        let response = self
            .request(reqwest::Method::HEAD, uri)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoralError::artifact("object existence check failed").with_source(e))?;
        Ok(response.status().is_success())
    }

    /// Upload raw bytes to an object URI.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn put(&self, uri: &str, payload: Vec<u8>) -> Result<(), CoralError> {
        debug!(uri, bytes = payload.len(), "uploading object");
        self.request(reqwest::Method::PUT, uri)
            .body(payload)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoralError::artifact("object upload failed").with_source(e))?
            .error_for_status()
            .map_err(|e| CoralError::artifact("object upload failed").with_source(e))?;
        Ok(())
    }

    /// Download an object's bytes.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn get(&self, uri: &str) -> Result<Vec<u8>, CoralError> {
        let response = self
            .request(reqwest::Method::GET, uri)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoralError::artifact("object download failed").with_source(e))?
            .error_for_status()
            .map_err(|e| CoralError::artifact("object download failed").with_source(e))?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| CoralError::artifact("object download failed").with_source(e))
    }

    /// Ask the store to sign `uri` for `ttl`.
    ///
    /// # Errors
    ///
    /// Propagates transport failures and non-success statuses.
    pub async fn sign(
        &self,
        uri: &str,
        ttl: Duration,
        method: &str,
    ) -> Result<String, CoralError> {
        let response = self
            .request(reqwest::Method::POST, &format!("{}/sign", self.base))
            .json(&serde_json::json!({
                "uri": uri,
                "ttl_seconds": ttl.as_secs(),
                "method": method,
            }))
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoralError::artifact("signing failed").with_source(e))?
            .error_for_status()
            .map_err(|e| CoralError::artifact("signing failed").with_source(e))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| CoralError::artifact("signing failed").with_source(e))?;
        value["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CoralError::artifact("signing response carried no url"))
    }
}
