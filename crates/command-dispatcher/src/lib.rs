//! Mode changes with bounded retries.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use correlator::{Correlator, RequestError};
use protocol::{is_negative_ack, ModeConfig, ValidationError, WeekdaySet, ES_SET_MODE};
use types::Endpoint;

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    /// Per-attempt reply deadline.
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            request_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid mode configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("{device} rejected {mode} mode")]
    Rejected { device: String, mode: &'static str },
    #[error("{mode} mode on {device} failed after {attempts} attempts: {source}")]
    Exhausted {
        device: String,
        mode: &'static str,
        attempts: u32,
        #[source]
        source: RequestError,
    },
}

impl CommandError {
    /// The device never answered or the socket was unusable.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            CommandError::Exhausted {
                source: RequestError::Timeout { .. } | RequestError::Transport(_),
                ..
            }
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandError::Rejected { .. })
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    correlator: Correlator,
    config: DispatcherConfig,
}

impl CommandDispatcher {
    pub fn new(correlator: Correlator, config: DispatcherConfig) -> Self {
        Self { correlator, config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Sends `ES.SetMode` until the device acknowledges it, rejects it, or the
    /// attempt ceiling is reached. Returns the acknowledging result object.
    pub async fn set_configuration(
        &self,
        device: &Endpoint,
        config: &ModeConfig,
    ) -> Result<Value, CommandError> {
        let mode = config.mode_name();
        let params = config.to_params();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .correlator
                .request(ES_SET_MODE, params.clone(), Some(device), timeout)
                .await
            {
                Ok(result) if is_negative_ack(&result) => {
                    warn!(device = %device.source_tag, mode, attempt, "mode change rejected");
                    return Err(CommandError::Rejected {
                        device: device.source_tag.clone(),
                        mode,
                    });
                }
                Ok(result) => {
                    info!(device = %device.source_tag, mode, attempt, "mode change applied");
                    return Ok(result);
                }
                Err(err) if attempt < max_attempts => {
                    warn!(device = %device.source_tag, mode, attempt, error = %err, "mode change attempt failed, retrying");
                }
                Err(err) => {
                    warn!(device = %device.source_tag, mode, attempts = attempt, error = %err, "mode change gave up");
                    return Err(CommandError::Exhausted {
                        device: device.source_tag.clone(),
                        mode,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    pub async fn set_auto(&self, device: &Endpoint) -> Result<Value, CommandError> {
        self.set_configuration(device, &ModeConfig::Auto).await
    }

    pub async fn set_ai(&self, device: &Endpoint) -> Result<Value, CommandError> {
        self.set_configuration(device, &ModeConfig::Ai).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn set_manual(
        &self,
        device: &Endpoint,
        time_slot: u8,
        start: &str,
        end: &str,
        weekdays: WeekdaySet,
        power_w: f64,
        enable: bool,
    ) -> Result<Value, CommandError> {
        let config = ModeConfig::manual(time_slot, start, end, weekdays, power_w, enable)?;
        self.set_configuration(device, &config).await
    }

    pub async fn set_passive(
        &self,
        device: &Endpoint,
        power_w: f64,
        cooldown_secs: f64,
    ) -> Result<Value, CommandError> {
        let config = ModeConfig::passive(power_w, cooldown_secs)?;
        self.set_configuration(device, &config).await
    }
}
