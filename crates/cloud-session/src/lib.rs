//! Authenticated access to the vendor cloud's device status API.

mod model;
mod single_flight;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use model::{parse_devices, parse_token, Envelope, StatusOutcome};
use single_flight::SingleFlight;

pub use model::{CloudDevice, CloudToken, StatusSnapshot};

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub login_path: String,
    pub status_path: String,
    pub mailbox: String,
    /// Already hashed the way the vendor app sends it.
    pub password_hash: String,
    /// Snapshots younger than this are served from cache.
    pub freshness_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eu.hamedata.com".to_string(),
            login_path: "/app/Solar/v2_get_device.php".to_string(),
            status_path: "/ems/api/v1/getDeviceList".to_string(),
            mailbox: String::new(),
            password_hash: String::new(),
            freshness_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("cloud authentication failed: {0}")]
    Auth(String),
    #[error("cloud responded with HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("cloud rejected the request (code {code:?}): {message}")]
    Api { code: Option<i64>, message: String },
    #[error("malformed cloud response: {0}")]
    Malformed(String),
    #[error("cloud request failed: {0}")]
    Http(String),
    #[error("cloud client setup failed: {0}")]
    Client(String),
}

impl CloudError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

#[derive(Clone)]
pub struct CloudSession {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: CloudConfig,
    token: Mutex<Option<CloudToken>>,
    snapshot: Mutex<Option<Arc<StatusSnapshot>>>,
    login: SingleFlight<CloudToken>,
    fetch: SingleFlight<Arc<StatusSnapshot>>,
}

impl CloudSession {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| CloudError::Client(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                token: Mutex::new(None),
                snapshot: Mutex::new(None),
                login: SingleFlight::new(),
                fetch: SingleFlight::new(),
            }),
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.inner.config
    }

    /// Logs in; concurrent callers share one request.
    pub async fn login(&self) -> Result<CloudToken, CloudError> {
        Inner::login(&self.inner).await
    }

    /// Latest device list, from cache while it is fresh.
    pub async fn fetch_status(&self) -> Result<Arc<StatusSnapshot>, CloudError> {
        if let Some(snapshot) = self.cached() {
            debug!("serving cached cloud status");
            return Ok(snapshot);
        }
        let inner = self.inner.clone();
        self.inner
            .fetch
            .run(move || async move { inner.refresh_status().await })
            .await
    }

    /// Fresh cached snapshot, if any.
    pub fn cached(&self) -> Option<Arc<StatusSnapshot>> {
        let freshness = Duration::from_millis(self.inner.config.freshness_ms);
        self.inner
            .snapshot()
            .as_ref()
            .filter(|snapshot| snapshot.is_fresh(freshness))
            .cloned()
    }

    pub fn has_token(&self) -> bool {
        self.inner.token().is_some()
    }

    /// Drops the cached token and snapshot.
    pub fn invalidate(&self) {
        *self.inner.token() = None;
        *self.inner.snapshot() = None;
        info!("cloud session invalidated");
    }
}

impl Inner {
    fn token(&self) -> MutexGuard<'_, Option<CloudToken>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> MutexGuard<'_, Option<Arc<StatusSnapshot>>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn login(self: &Arc<Self>) -> Result<CloudToken, CloudError> {
        let inner = self.clone();
        self.login
            .run(move || async move {
                let token = inner.request_token().await?;
                *inner.token() = Some(token.clone());
                Ok(token)
            })
            .await
    }

    async fn request_token(&self) -> Result<CloudToken, CloudError> {
        let url = self.url(&self.config.login_path);
        debug!(url = %url, "cloud login");
        let response = self
            .client
            .post(&url)
            .form(&[
                ("mailbox", self.config.mailbox.as_str()),
                ("pwd", self.config.password_hash.as_str()),
            ])
            .send()
            .await
            .map_err(|err| CloudError::Http(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CloudError::Http(err.to_string()))?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::Auth(upstream_message(&body, status)));
        }
        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
                message: upstream_message(&body, status),
            });
        }

        let token = parse_token(&body)?;
        info!("cloud login succeeded");
        Ok(token)
    }

    async fn current_token(self: &Arc<Self>) -> Result<CloudToken, CloudError> {
        let cached = self.token().clone().filter(|token| !token.is_expired());
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    async fn refresh_status(self: Arc<Self>) -> Result<Arc<StatusSnapshot>, CloudError> {
        let token = self.current_token().await?;
        let devices = match self.query_status(&token).await? {
            StatusOutcome::Fetched(devices) => devices,
            StatusOutcome::TokenRejected(message) => {
                warn!(message = %message, "cloud token rejected, logging in again");
                *self.token() = None;
                let token = self.login().await?;
                match self.query_status(&token).await? {
                    StatusOutcome::Fetched(devices) => devices,
                    StatusOutcome::TokenRejected(message) => return Err(CloudError::Auth(message)),
                }
            }
        };

        let snapshot = Arc::new(StatusSnapshot {
            fetched_at: std::time::Instant::now(),
            devices,
        });
        info!(devices = snapshot.devices.len(), "cloud status refreshed");
        *self.snapshot() = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn query_status(&self, token: &CloudToken) -> Result<StatusOutcome, CloudError> {
        let url = self.url(&self.config.status_path);
        let response = self
            .client
            .get(&url)
            .query(&[("token", token.token.as_str())])
            .send()
            .await
            .map_err(|err| CloudError::Http(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CloudError::Http(err.to_string()))?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(StatusOutcome::TokenRejected(upstream_message(&body, status)));
        }
        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
                message: upstream_message(&body, status),
            });
        }

        let envelope = Envelope::parse(&body)?;
        if envelope.is_token_rejection() {
            return Ok(StatusOutcome::TokenRejected(envelope.message()));
        }
        if !envelope.is_success() {
            return Err(CloudError::Api {
                code: envelope.code(),
                message: envelope.message(),
            });
        }
        parse_devices(envelope.data).map(StatusOutcome::Fetched)
    }
}

/// `msg` from a JSON error body, the raw body, or the status reason.
fn upstream_message(body: &str, status: StatusCode) -> String {
    if let Ok(envelope) = Envelope::parse(body) {
        if let Some(msg) = envelope.msg.filter(|msg| !msg.is_empty()) {
            return msg;
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    } else {
        body.to_string()
    }
}
