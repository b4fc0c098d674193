//! Poll reply attribution and normalization.
//!
//! Per-firmware scaling is data, not code: a [`ScaleTable`] is built from
//! rules loaded at startup, and every numeric field runs through it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::methods::{
    discovery_params, query_params, BAT_GET_STATUS, EM_GET_STATUS, ES_GET_MODE, ES_GET_STATUS,
    GET_DEVICE, POLL_ID_BASE, WIFI_GET_STATUS,
};

/// Read-only queries the poller knows how to send and attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Device,
    EsStatus,
    BatStatus,
    EsMode,
    EmStatus,
    WifiStatus,
}

impl QueryKind {
    pub const ALL: [QueryKind; 6] = [
        QueryKind::Device,
        QueryKind::EsStatus,
        QueryKind::BatStatus,
        QueryKind::EsMode,
        QueryKind::EmStatus,
        QueryKind::WifiStatus,
    ];

    pub fn method(self) -> &'static str {
        match self {
            QueryKind::Device => GET_DEVICE,
            QueryKind::EsStatus => ES_GET_STATUS,
            QueryKind::BatStatus => BAT_GET_STATUS,
            QueryKind::EsMode => ES_GET_MODE,
            QueryKind::EmStatus => EM_GET_STATUS,
            QueryKind::WifiStatus => WIFI_GET_STATUS,
        }
    }

    pub fn params(self) -> Value {
        match self {
            QueryKind::Device => discovery_params(),
            _ => query_params(),
        }
    }

    /// Identifier carried by poll frames of this kind.
    pub fn poll_id(self) -> u64 {
        POLL_ID_BASE + self as u64
    }

    pub fn from_poll_id(id: u64) -> Option<Self> {
        let offset = id.checked_sub(POLL_ID_BASE)?;
        Self::ALL.get(usize::try_from(offset).ok()?).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMode {
    Auto,
    Ai,
    Manual,
    Passive,
    Unknown(String),
}

impl DeviceMode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "auto" => DeviceMode::Auto,
            "ai" => DeviceMode::Ai,
            "manual" => DeviceMode::Manual,
            "passive" => DeviceMode::Passive,
            _ => DeviceMode::Unknown(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
    Number(f64),
    Mode(DeviceMode),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub field: String,
    pub value: ReadingValue,
}

/// One scaling rule: `factor` applies to `field` from firmware `min_firmware` onwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRule {
    pub field: String,
    #[serde(default)]
    pub min_firmware: u32,
    pub factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScaleTable {
    rules: HashMap<String, Vec<ScaleRule>>,
}

impl ScaleTable {
    pub fn from_rules(rules: impl IntoIterator<Item = ScaleRule>) -> Self {
        let mut table = Self::default();
        for rule in rules {
            table.rules.entry(rule.field.clone()).or_default().push(rule);
        }
        for rules in table.rules.values_mut() {
            rules.sort_by_key(|rule| rule.min_firmware);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Factor of the newest rule not newer than `firmware`; 1.0 when none matches.
    /// Unknown firmware only matches rules without a lower bound.
    pub fn factor(&self, field: &str, firmware: Option<u32>) -> f64 {
        let Some(rules) = self.rules.get(field) else {
            return 1.0;
        };
        let firmware = firmware.unwrap_or(0);
        rules
            .iter()
            .rev()
            .find(|rule| rule.min_firmware <= firmware)
            .map(|rule| rule.factor)
            .unwrap_or(1.0)
    }
}

/// Firmware version reported by `Marstek.GetDevice` (`ver`).
pub fn firmware_version(result: &Value) -> Option<u32> {
    match result.get("ver")? {
        Value::Number(number) => number.as_u64().and_then(|ver| u32::try_from(ver).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Turns a poll `result` into readings. Non-object results yield nothing.
pub fn normalize(
    kind: QueryKind,
    result: &Value,
    table: &ScaleTable,
    firmware: Option<u32>,
) -> Vec<Reading> {
    let Some(object) = result.as_object() else {
        debug!(method = kind.method(), "non-object poll result ignored");
        return Vec::new();
    };

    let mut readings = Vec::with_capacity(object.len());
    for (field, value) in object {
        if field == "id" {
            continue;
        }
        let value = match value {
            Value::Number(number) => match number.as_f64() {
                Some(raw) => ReadingValue::Number(raw * table.factor(field, firmware)),
                None => continue,
            },
            Value::String(text) if field == "mode" => ReadingValue::Mode(DeviceMode::parse(text)),
            Value::String(text) => ReadingValue::Text(text.clone()),
            Value::Bool(flag) => ReadingValue::Number(if *flag { 1.0 } else { 0.0 }),
            _ => continue,
        };
        readings.push(Reading {
            field: field.clone(),
            value,
        });
    }
    readings
}
