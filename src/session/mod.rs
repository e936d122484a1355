//! Session registration
//!
//! Before streaming, the client reserves a realtime endpoint from the
//! compute pool (or uses a local AI) and gets back the WebSocket URL to
//! connect to. Failures are reported as `success: false` outcomes and
//! never reach the audio pipeline.

mod pool;

use std::future::Future;

use serde::{Deserialize, Serialize};

pub use pool::HttpComputePool;

use crate::error::RegistrationError;
use crate::settings::SessionSettings;

/// The pool manager's answer to a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRegistration {
    pub status: String,
    #[serde(default)]
    pub pod_id: Option<String>,
}

/// Remote pool of realtime endpoints.
pub trait ComputePool: Send + Sync {
    fn register(&self) -> impl Future<Output = Result<PoolRegistration, RegistrationError>> + Send;

    fn unregister(&self) -> impl Future<Output = Result<(), RegistrationError>> + Send;
}

/// Result of `SessionBroker::register` / `unregister`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

impl RegistrationOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            endpoint_id: None,
            websocket_url: None,
        }
    }
}

/// `wss://{id}-{port}.{proxy_host}/v1/realtime`
pub fn endpoint_url(endpoint_id: &str, port: u16, proxy_host: &str) -> String {
    format!("wss://{}-{}.{}/v1/realtime", endpoint_id, port, proxy_host)
}

pub struct SessionBroker<P> {
    pool: P,
    settings: SessionSettings,
}

impl<P: ComputePool> SessionBroker<P> {
    pub fn new(pool: P, settings: SessionSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Reserve an endpoint and resolve its WebSocket URL.
    pub async fn register(&self) -> RegistrationOutcome {
        if self.settings.local_ai {
            log::info!("Session: using local AI at {}", self.settings.local_url);
            return RegistrationOutcome {
                success: true,
                message: "Using local AI.".to_string(),
                endpoint_id: None,
                websocket_url: Some(self.settings.local_url.clone()),
            };
        }

        let registration = match self.pool.register().await {
            Ok(registration) => registration,
            Err(e) => {
                log::warn!("Session: registration failed: {}", e);
                return RegistrationOutcome::failed("Connection failed.");
            }
        };

        match registration.pod_id {
            Some(id) if registration.status == "success" && !id.is_empty() => {
                let url = endpoint_url(&id, self.settings.endpoint_port, &self.settings.proxy_host);
                log::info!("Session: registered endpoint {}", id);
                RegistrationOutcome {
                    success: true,
                    message: "Connection registered.".to_string(),
                    endpoint_id: Some(id),
                    websocket_url: Some(url),
                }
            }
            _ => {
                log::warn!(
                    "Session: pool refused registration (status {:?})",
                    registration.status
                );
                RegistrationOutcome::failed("Connection failed.")
            }
        }
    }

    /// Release the endpoint. A no-op for local AI.
    pub async fn unregister(&self) -> RegistrationOutcome {
        if self.settings.local_ai {
            return RegistrationOutcome {
                success: true,
                message: "Local AI connection; no unregister needed.".to_string(),
                endpoint_id: None,
                websocket_url: None,
            };
        }

        // Release is fire-and-forget from the client's point of view
        if let Err(e) = self.pool.unregister().await {
            log::warn!("Session: unregister failed: {}", e);
        }
        RegistrationOutcome {
            success: true,
            message: "Connection unregistered.".to_string(),
            endpoint_id: None,
            websocket_url: None,
        }
    }
}
