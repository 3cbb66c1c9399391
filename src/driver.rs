//! Minimal HTTP client for the job surface, as used by drivers and the CLI.

use reqwest::StatusCode;
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::jobs::LogPage;

#[derive(Debug, Clone)]
pub struct DriverClient {
    base_url: String,
    http: reqwest::Client,
}

impl DriverClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Submit a job description. Returns the created record.
    pub async fn submit(&self, description: &Value) -> Result<Value> {
        let response = self.http.post(self.url("/jobs")).json(description).send().await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED | StatusCode::OK => Ok(response.json().await?),
            status => Err(rejection(status, response).await),
        }
    }

    /// Read a job; this also counts as a heartbeat.
    pub async fn status(&self, id: u64) -> Result<Value> {
        let response = self.http.get(self.url(&format!("/jobs/{}", id))).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(FleetError::JobNotFound(id)),
            status => Err(rejection(status, response).await),
        }
    }

    pub async fn touch(&self, id: u64) -> Result<()> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}/touch", id)))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(FleetError::JobNotFound(id)),
            status => Err(rejection(status, response).await),
        }
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", id)))
            .send()
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(FleetError::JobNotFound(id)),
            status => Err(rejection(status, response).await),
        }
    }

    pub async fn list(&self) -> Result<Vec<Value>> {
        let response = self.http.get(self.url("/jobs")).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => Err(rejection(status, response).await),
        }
    }

    pub async fn output(&self, id: u64, skip: u64) -> Result<LogPage> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}/output", id)))
            .query(&[("skip", skip)])
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(FleetError::JobNotFound(id)),
            status => Err(rejection(status, response).await),
        }
    }
}

async fn rejection(status: StatusCode, response: reqwest::Response) -> FleetError {
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    if status == StatusCode::BAD_REQUEST {
        FleetError::InvalidJob(message)
    } else {
        FleetError::Internal(format!("agent answered {}: {}", status, message))
    }
}
