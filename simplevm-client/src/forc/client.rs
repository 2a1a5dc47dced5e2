//! HTTP client for the Forc research environment deployer.
//!
//! Every request carries the `X-API-KEY` header; the key comes from the
//! `FORC_API_KEY` environment variable.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tracing::info;

use crate::config::ForcSettings;
use crate::error::{ClientError, Result};
use crate::proto;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ForcClient {
    http: reqwest::Client,
    backend_url: String,
    access_url: String,
    api_key: Option<String>,
}

fn parse_backend(data: &Value) -> proto::Backend {
    proto::Backend {
        id: data["id"].as_i64().unwrap_or_default(),
        owner: data["owner"].as_str().unwrap_or_default().to_string(),
        location_url: data["location_url"].as_str().unwrap_or_default().to_string(),
        template: data["template"].as_str().unwrap_or_default().to_string(),
        template_version: data["template_version"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_backends(data: &Value) -> Vec<proto::Backend> {
    data.as_array()
        .map(|list| list.iter().map(parse_backend).collect())
        .unwrap_or_default()
}

impl ForcClient {
    pub fn new(settings: &ForcSettings, verify_tls: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        let api_key = std::env::var("FORC_API_KEY").ok();
        Ok(Self {
            http,
            backend_url: settings.forc_backend_url.trim_end_matches('/').to_string(),
            access_url: settings.forc_access_url.clone(),
            api_key,
        })
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn access_url(&self) -> &str {
        &self.access_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}/{path}", self.backend_url));
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key);
        }
        req
    }

    /// Does the Forc catalog serve this template version?
    pub async fn template_exists(&self, template: &str, version: &str) -> Result<bool> {
        let resp = self
            .request(reqwest::Method::GET, &format!("templates/{template}/{version}"))
            .send()
            .await?;
        Ok(resp.status() == StatusCode::OK)
    }

    pub async fn create_backend(
        &self,
        owner: &str,
        user_key_url: &str,
        template: &str,
        template_version: &str,
        upstream_url: &str,
    ) -> Result<proto::Backend> {
        info!(owner = %owner, template = %template, "Create backend");
        let resp = self
            .request(reqwest::Method::POST, "backends")
            .json(&json!({
                "owner": owner,
                "user_key_url": user_key_url,
                "template": template,
                "template_version": template_version,
                "upstream_url": upstream_url,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Internal(format!(
                "backend creation failed: {status} {body}"
            )));
        }
        let data: Value = resp.json().await?;
        info!(backend = ?data, "Backend created");
        Ok(parse_backend(&data))
    }

    pub async fn get_backends(&self) -> Result<Vec<proto::Backend>> {
        let resp = self.request(reqwest::Method::GET, "backends").send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Internal("Forc rejected the API key".into()));
        }
        let data: Value = resp.json().await?;
        Ok(parse_backends(&data))
    }

    pub async fn get_backend_by_id(&self, id: i64) -> Result<proto::Backend> {
        let resp = self
            .request(reqwest::Method::GET, &format!("backends/{id}"))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::BackendNotFound(id.to_string()));
        }
        let data: Value = resp.json().await?;
        Ok(parse_backend(&data))
    }

    pub async fn get_backends_by_owner(&self, owner: &str) -> Result<Vec<proto::Backend>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("backends/byOwner/{owner}"))
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Internal("Forc rejected the API key".into()));
        }
        let data: Value = resp.json().await?;
        Ok(parse_backends(&data))
    }

    pub async fn get_backends_by_template(&self, template: &str) -> Result<Vec<proto::Backend>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("backends/byTemplate/{template}"),
            )
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Internal("Forc rejected the API key".into()));
        }
        let data: Value = resp.json().await?;
        Ok(parse_backends(&data))
    }

    pub async fn delete_backend(&self, id: i64) -> Result<()> {
        info!(backend_id = id, "Delete backend");
        let resp = self
            .request(reqwest::Method::DELETE, &format!("backends/{id}"))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR => {
                let body = resp.text().await.unwrap_or_default();
                Err(ClientError::BackendNotFound(format!("{id}: {body}")))
            }
            _ => Ok(()),
        }
    }

    pub async fn add_user_to_backend(
        &self,
        backend_id: i64,
        user: &str,
    ) -> Result<std::collections::HashMap<String, String>> {
        info!(backend_id = backend_id, user = %user, "Add user to backend");
        let resp = self
            .request(reqwest::Method::POST, &format!("users/{backend_id}"))
            .json(&json!({"user": user}))
            .send()
            .await?;
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::BackendNotFound(format!("{backend_id}: {e}")))?;
        Ok(string_map(&data))
    }

    pub async fn delete_user_from_backend(
        &self,
        backend_id: i64,
        user: &str,
    ) -> Result<std::collections::HashMap<String, String>> {
        info!(backend_id = backend_id, user = %user, "Delete user from backend");
        let resp = self
            .request(reqwest::Method::DELETE, &format!("users/{backend_id}"))
            .json(&json!({"user": user}))
            .send()
            .await?;
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::BackendNotFound(format!("{backend_id}: {e}")))?;
        Ok(string_map(&data))
    }

    pub async fn get_users_from_backend(&self, backend_id: i64) -> Result<Vec<String>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("users/{backend_id}"))
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Ok(vec!["Error: 401".to_string()]);
        }
        let data: Value = resp.json().await?;
        Ok(match data {
            Value::Array(users) => users
                .into_iter()
                .filter_map(|u| u.as_str().map(str::to_string))
                .collect(),
            Value::String(user) => vec![user],
            other => vec![other.to_string()],
        })
    }
}

fn string_map(data: &Value) -> std::collections::HashMap<String, String> {
    data.as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}
