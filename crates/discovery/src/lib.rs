use std::collections::HashSet;
use std::net::SocketAddr;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use protocol::telemetry::{firmware_version, QueryKind};
use protocol::{encode_request, ProtocolError, ReplyBody};
use types::DeviceIdentity;
use udp_transport::{HandlerId, Transport, TransportError};

/// Longest listening window a discovery run will honour.
pub const MAX_WINDOW_MS: u64 = 10 * 60 * 1_000;

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub broadcast_interval_ms: u64,
    /// Total listening time.
    pub window_ms: u64,
    /// Broadcast port; the transport's device port when unset.
    pub port: Option<u16>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 2_000,
            window_ms: 9_000,
            port: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery needs a bound socket: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Broadcasts the identification query for the configured window and returns
/// every distinct device that answered, in the order they answered.
pub async fn discover_devices(
    transport: &Transport,
    config: &DiscoveryConfig,
) -> Result<Vec<DeviceIdentity>, DiscoveryError> {
    transport.connect()?;

    let kind = QueryKind::Device;
    let payload = encode_request(kind.poll_id(), kind.method(), &kind.params())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _listener = Listener {
        transport,
        id: transport.on(move |frame, remote| {
            if let ReplyBody::Result(result) = &frame.body {
                if let Some(identity) = identity_from_reply(&frame.src, result, remote) {
                    let _ = tx.send(identity);
                }
            }
        }),
    };

    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.window_ms.min(MAX_WINDOW_MS));
    let period = Duration::from_millis(config.broadcast_interval_ms.max(1));
    let mut broadcasts = interval_at(started, period);
    broadcasts.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seen = HashSet::new();
    let mut devices = Vec::new();
    info!(window_ms = config.window_ms, "device discovery started");

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            _ = broadcasts.tick() => {
                if let Err(err) = transport.broadcast(&payload, config.port).await {
                    warn!(error = %err, "discovery broadcast failed");
                }
            }
            Some(identity) = rx.recv() => {
                if seen.insert(identity.source_tag.clone()) {
                    info!(
                        device = %identity.source_tag,
                        ip = %identity.ip,
                        model = %identity.model,
                        "device discovered"
                    );
                    devices.push(identity);
                } else {
                    debug!(device = %identity.source_tag, "duplicate discovery reply ignored");
                }
            }
        }
    }

    info!(count = devices.len(), "device discovery finished");
    Ok(devices)
}

/// Builds an identity from an identification reply; anything without a model
/// string is some other kind of reply.
pub fn identity_from_reply(src: &str, result: &Value, remote: SocketAddr) -> Option<DeviceIdentity> {
    let model = result.get("device")?.as_str()?;
    let text = |field: &str| {
        result
            .get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    Some(DeviceIdentity {
        source_tag: src.to_string(),
        ip: remote.ip(),
        port: remote.port(),
        model: model.to_string(),
        firmware: firmware_version(result),
        ble_mac: text("ble_mac"),
        wifi_mac: text("wifi_mac"),
    })
}

struct Listener<'a> {
    transport: &'a Transport,
    id: HandlerId,
}

impl Drop for Listener<'_> {
    fn drop(&mut self) {
        self.transport.off(self.id);
    }
}
