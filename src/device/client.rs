use crate::config::DeviceEndpoint;
use crate::context::cancellable;
use crate::device::history::{PageSource, RawPage};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::RequestBuilder;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// HTTP client for one metering device.
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    name: String,
    shutdown: CancellationToken,
}

impl DeviceClient {
    pub fn new(
        endpoint: &DeviceEndpoint,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Transport(format!("failed to build HTTP client: {}", e)))?;
        let base_url = base_url(&endpoint.host);
        debug!(device = %endpoint.device_name(), url = %base_url, "initialized device client");
        Ok(Self {
            http,
            base_url,
            credentials: endpoint
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            name: endpoint.device_name().to_string(),
            shutdown,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    /// Probe the status endpoint. Any failure counts as unreachable.
    pub async fn test_connection(&self) -> bool {
        let req = self
            .authorize(self.http.post(format!("{}/rpc/Shelly.GetStatus", self.base_url)))
            .json(&serde_json::json!({ "id": 1, "method": "Shelly.GetStatus" }));
        let probe = async {
            req.send()
                .await
                .map_err(|e| AppError::Transport(e.to_string()))
        };
        match cancellable(&self.shutdown, probe).await {
            Ok(resp) => {
                debug!(device = %self.name, status = %resp.status(), "status probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                debug!(device = %self.name, error = %e, "status probe failed");
                false
            }
        }
    }

    async fn request_page(&self, from: i64, to: Option<i64>) -> Result<RawPage> {
        let mut query = vec![("id", "0".to_string()), ("ts", from.to_string())];
        if let Some(to) = to {
            query.push(("end_ts", to.to_string()));
        }
        debug!(device = %self.name, from, ?to, "requesting history page");

        let resp = self
            .authorize(self.http.get(format!("{}/rpc/EMData.GetData", self.base_url)))
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AppError::DeviceStatus {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| AppError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PageSource for DeviceClient {
    async fn fetch_page(&self, from: i64, to: Option<i64>) -> Result<RawPage> {
        cancellable(&self.shutdown, self.request_page(from, to)).await
    }
}

fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}
