use serde_json::{json, Value};

/// UDP port the devices listen on, and the local port replies come back to.
pub const DEFAULT_DEVICE_PORT: u16 = 30_000;

pub const GET_DEVICE: &str = "Marstek.GetDevice";
pub const ES_GET_STATUS: &str = "ES.GetStatus";
pub const BAT_GET_STATUS: &str = "Bat.GetStatus";
pub const ES_GET_MODE: &str = "ES.GetMode";
pub const EM_GET_STATUS: &str = "EM.GetStatus";
pub const WIFI_GET_STATUS: &str = "Wifi.GetStatus";
pub const ES_SET_MODE: &str = "ES.SetMode";

/// Correlated request identifiers stay strictly below this value.
pub const CORRELATION_ID_CEILING: u64 = 65_535;

/// Poll frames use `POLL_ID_BASE + n`, a range correlated requests never reach.
pub const POLL_ID_BASE: u64 = 70_000;

/// Params for the read-only status queries.
pub fn query_params() -> Value {
    json!({ "id": 0 })
}

/// Params for the identification query used by discovery and address refresh.
pub fn discovery_params() -> Value {
    json!({ "ble_mac": "0" })
}
