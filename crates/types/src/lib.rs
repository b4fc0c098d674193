use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A logical battery unit: its stable source tag plus the address it was last heard from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub source_tag: String,
    pub ip: Option<IpAddr>,
    /// Overrides the transport's default device port when set.
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            ip: None,
            port: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Resolves the unicast destination, falling back to `default_port`.
    pub fn socket_addr(&self, default_port: u16) -> Option<SocketAddr> {
        self.ip
            .map(|ip| SocketAddr::new(ip, self.port.unwrap_or(default_port)))
    }
}

/// A device taking part in periodic polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTarget {
    pub device_id: String,
    /// Preferred polling interval in seconds, if the device declares one.
    pub interval_secs: Option<f64>,
    /// Receive the shared subnet broadcast instead of a directly addressed query.
    pub broadcast: bool,
}

impl PollTarget {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            interval_secs: None,
            broadcast: false,
        }
    }

    pub fn with_interval_secs(mut self, secs: f64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }
}

/// Read access to the last-known network address of each device.
pub trait AddressBook: Send + Sync {
    fn address_of(&self, device_id: &str) -> Option<SocketAddr>;
}

/// What a device reports about itself when it answers the identification broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub source_tag: String,
    pub ip: IpAddr,
    pub port: u16,
    pub model: String,
    pub firmware: Option<u32>,
    pub ble_mac: Option<String>,
    pub wifi_mac: Option<String>,
}

impl DeviceIdentity {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.source_tag.clone())
            .with_ip(self.ip)
            .with_port(self.port)
    }
}
