use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use protocol::telemetry::{firmware_version, normalize, QueryKind, ReadingValue, ScaleTable};
use protocol::ReplyBody;
use udp_transport::{EndpointTable, HandlerId, Transport};

/// Latest known state of one device.
#[derive(Debug, Clone)]
pub struct DeviceTelemetry {
    pub readings: BTreeMap<String, ReadingValue>,
    pub firmware: Option<u32>,
    pub last_seen: Instant,
}

impl DeviceTelemetry {
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.readings.get(field)? {
            ReadingValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// Keeps only the newest readings per device, fed by poll replies.
#[derive(Clone, Default)]
pub struct TelemetryStore {
    devices: Arc<RwLock<HashMap<String, DeviceTelemetry>>>,
    scale: Arc<ScaleTable>,
}

impl TelemetryStore {
    pub fn new(scale: ScaleTable) -> Self {
        Self {
            devices: Arc::default(),
            scale: Arc::new(scale),
        }
    }

    /// Routes poll replies (identified by their reserved identifiers) into the store.
    /// Replies from source tags missing from `known` are dropped.
    pub fn attach(&self, transport: &Transport, known: &EndpointTable) -> HandlerId {
        let store = self.clone();
        let known = known.clone();
        transport.on(move |frame, _| {
            let Some(kind) = frame.id.and_then(QueryKind::from_poll_id) else {
                return;
            };
            if known.get(&frame.src).is_none() {
                debug!(src = %frame.src, "poll reply from untracked device ignored");
                return;
            }
            if let ReplyBody::Result(result) = &frame.body {
                store.record(&frame.src, kind, result);
            }
        })
    }

    pub fn record(&self, device: &str, kind: QueryKind, result: &Value) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let entry = devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceTelemetry {
                readings: BTreeMap::new(),
                firmware: None,
                last_seen: Instant::now(),
            });
        if kind == QueryKind::Device {
            entry.firmware = firmware_version(result).or(entry.firmware);
        }

        let readings = normalize(kind, result, &self.scale, entry.firmware);
        debug!(device, method = kind.method(), readings = readings.len(), "poll reply recorded");
        for reading in readings {
            entry.readings.insert(reading.field, reading.value);
        }
        entry.last_seen = Instant::now();
        metrics::counter!("telemetry_replies_total").increment(1);
    }

    pub fn latest(&self, device: &str) -> Option<DeviceTelemetry> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        devices.sort();
        devices
    }
}
