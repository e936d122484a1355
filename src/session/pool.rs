//! HTTP client for the compute pool manager.

use std::time::Duration;

use super::{ComputePool, PoolRegistration};
use crate::error::RegistrationError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Talks to a pool manager exposing `POST {base}/register` and
/// `POST {base}/unregister`.
#[derive(Debug, Clone)]
pub struct HttpComputePool {
    client: reqwest::Client,
    base_url: String,
}

impl HttpComputePool {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Pool: falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, action: &str) -> String {
        format!("{}/{}", self.base_url, action)
    }

    async fn post(&self, action: &str) -> Result<reqwest::Response, RegistrationError> {
        let response = self
            .client
            .post(self.url(action))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Pool: {} returned {}: {}", action, status, body);
            return Err(RegistrationError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

impl ComputePool for HttpComputePool {
    async fn register(&self) -> Result<PoolRegistration, RegistrationError> {
        let response = self.post("register").await?;
        response
            .json::<PoolRegistration>()
            .await
            .map_err(|e| RegistrationError::InvalidResponse(e.to_string()))
    }

    async fn unregister(&self) -> Result<(), RegistrationError> {
        self.post("unregister").await.map(|_| ())
    }
}
