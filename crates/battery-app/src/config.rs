use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use cloud_session::CloudConfig;
use command_dispatcher::DispatcherConfig;
use discovery::DiscoveryConfig;
use poll_scheduler::SchedulerConfig;
use protocol::telemetry::ScaleRule;
use types::{Endpoint, PollTarget};
use udp_transport::TransportConfig;

const DEFAULT_CLOUD_POLL_INTERVAL_MS: u64 = 60_000;

/// A battery listed in the config file instead of being discovered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceEntry {
    pub source_tag: String,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub poll_interval_secs: Option<f64>,
    #[serde(default)]
    pub broadcast: bool,
}

impl DeviceEntry {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            source_tag: self.source_tag.clone(),
            ip: self.ip,
            port: self.port,
        }
    }

    pub fn poll_target(&self) -> PollTarget {
        PollTarget {
            device_id: self.source_tag.clone(),
            interval_secs: self.poll_interval_secs,
            broadcast: self.broadcast,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatteryConfig {
    pub transport: TransportConfig,
    pub poller: SchedulerConfig,
    pub commands: DispatcherConfig,
    pub discovery: DiscoveryConfig,
    pub cloud: Option<CloudConfig>,
    pub cloud_poll_interval_ms: u64,
    pub metrics_listen: Option<SocketAddr>,
    pub devices: Vec<DeviceEntry>,
    pub scaling: Vec<ScaleRule>,
}

impl BatteryConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.device_port == 0 {
            anyhow::bail!("transport.device_port must be between 1 and 65535");
        }
        if self.transport.recv_buffer_size < 512 {
            anyhow::bail!("transport.recv_buffer_size must be >= 512");
        }
        if self.poller.floor.is_zero() {
            anyhow::bail!("poller.floor_ms must be >= 1");
        }
        if self.poller.default_interval.is_zero() {
            anyhow::bail!("poller.default_interval_ms must be >= 1");
        }
        if self.commands.max_attempts == 0 {
            anyhow::bail!("commands.max_attempts must be >= 1");
        }
        if self.commands.request_timeout_ms == 0 {
            anyhow::bail!("commands.request_timeout_ms must be >= 1");
        }
        if self.discovery.window_ms == 0 || self.discovery.window_ms > discovery::MAX_WINDOW_MS {
            anyhow::bail!(
                "discovery.window_ms must be between 1 and {}",
                discovery::MAX_WINDOW_MS
            );
        }
        if self.discovery.broadcast_interval_ms == 0
            || self.discovery.broadcast_interval_ms > self.discovery.window_ms
        {
            anyhow::bail!("discovery.broadcast_interval_ms must be between 1 and discovery.window_ms");
        }
        if let Some(cloud) = &self.cloud {
            validate_cloud(cloud)?;
            if self.cloud_poll_interval_ms == 0 {
                anyhow::bail!("cloud.poll_interval_ms must be >= 1");
            }
        }

        let mut tags = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.source_tag.trim().is_empty() {
                anyhow::bail!("devices[{index}].source_tag must be non-empty");
            }
            if !tags.insert(device.source_tag.as_str()) {
                anyhow::bail!("devices[{index}].source_tag '{}' is listed twice", device.source_tag);
            }
            if device.port == Some(0) {
                anyhow::bail!("devices[{index}].port must be between 1 and 65535");
            }
            if let Some(secs) = device.poll_interval_secs {
                if !secs.is_finite() || secs <= 0.0 {
                    anyhow::bail!("devices[{index}].poll_interval_secs must be a positive number");
                }
            }
        }

        for (index, rule) in self.scaling.iter().enumerate() {
            if rule.field.trim().is_empty() {
                anyhow::bail!("scaling[{index}].field must be non-empty");
            }
            if !rule.factor.is_finite() || rule.factor == 0.0 {
                anyhow::bail!("scaling[{index}].factor must be a finite, non-zero number");
            }
        }

        Ok(())
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            poller: SchedulerConfig::default(),
            commands: DispatcherConfig::default(),
            discovery: DiscoveryConfig::default(),
            cloud: None,
            cloud_poll_interval_ms: DEFAULT_CLOUD_POLL_INTERVAL_MS,
            metrics_listen: None,
            devices: Vec::new(),
            scaling: Vec::new(),
        }
    }
}

fn validate_cloud(cloud: &CloudConfig) -> Result<()> {
    if !(cloud.base_url.starts_with("http://") || cloud.base_url.starts_with("https://")) {
        anyhow::bail!("cloud.base_url must start with http:// or https://");
    }
    if !cloud.login_path.starts_with('/') || !cloud.status_path.starts_with('/') {
        anyhow::bail!("cloud.login_path and cloud.status_path must start with '/'");
    }
    if cloud.mailbox.trim().is_empty() {
        anyhow::bail!("cloud.mailbox must be non-empty");
    }
    if cloud.password_hash.trim().is_empty() {
        anyhow::bail!("cloud.password_hash must be non-empty");
    }
    if cloud.request_timeout_ms == 0 {
        anyhow::bail!("cloud.request_timeout_ms must be >= 1");
    }
    Ok(())
}

fn apply_env_overrides(config: &mut BatteryConfig) -> Result<()> {
    if let Some(port) = parse_env_u16("BATTERY_BIND_PORT") {
        config.transport.bind_port = port;
    }

    if let Some(port) = parse_env_u16("BATTERY_DEVICE_PORT") {
        config.transport.device_port = port;
    }

    if let Ok(value) = env::var("BATTERY_BROADCAST_ADDRESS") {
        let address = value
            .parse::<Ipv4Addr>()
            .with_context(|| format!("BATTERY_BROADCAST_ADDRESS is not an IPv4 address: {value}"))?;
        config.transport.broadcast_address = Some(address);
    }

    if let Some(floor_ms) = parse_env_u64("BATTERY_POLL_FLOOR_MS") {
        config.poller.floor = Duration::from_millis(floor_ms);
    }

    if let Some(interval_ms) = parse_env_u64("BATTERY_POLL_INTERVAL_MS") {
        config.poller.default_interval = Duration::from_millis(interval_ms);
    }

    if let Some(jitter_ms) = parse_env_u64("BATTERY_JITTER_MS") {
        config.poller.jitter_ms = jitter_ms;
    }

    if let Some(attempts) = parse_env_u32("BATTERY_COMMAND_ATTEMPTS") {
        config.commands.max_attempts = attempts;
    }

    if let Some(timeout_ms) = parse_env_u64("BATTERY_COMMAND_TIMEOUT_MS") {
        config.commands.request_timeout_ms = timeout_ms;
    }

    if let Some(window_ms) = parse_env_u64("BATTERY_DISCOVERY_WINDOW_MS") {
        config.discovery.window_ms = window_ms;
    }

    if let Ok(value) = env::var("BATTERY_DEVICES") {
        config.devices = parse_devices(&value)?;
    }

    if let Ok(value) = env::var("BATTERY_METRICS_LISTEN") {
        let listen = value
            .parse::<SocketAddr>()
            .with_context(|| format!("BATTERY_METRICS_LISTEN is not a socket address: {value}"))?;
        config.metrics_listen = Some(listen);
    }

    if let Ok(mailbox) = env::var("BATTERY_CLOUD_MAILBOX") {
        config.cloud.get_or_insert_with(CloudConfig::default).mailbox = mailbox;
    }
    if let Some(cloud) = config.cloud.as_mut() {
        if let Ok(hash) = env::var("BATTERY_CLOUD_PASSWORD_HASH") {
            cloud.password_hash = hash;
        }
        if let Ok(base_url) = env::var("BATTERY_CLOUD_BASE_URL") {
            cloud.base_url = base_url;
        }
    }

    config.cloud_poll_interval_ms =
        parse_env_u64("BATTERY_CLOUD_POLL_INTERVAL_MS").unwrap_or(config.cloud_poll_interval_ms);

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    transport: Option<TransportConfig>,
    poller: Option<FilePollerConfig>,
    commands: Option<DispatcherConfig>,
    discovery: Option<DiscoveryConfig>,
    cloud: Option<FileCloudConfig>,
    metrics: Option<FileMetricsConfig>,
    devices: Option<Vec<DeviceEntry>>,
    scaling: Option<Vec<ScaleRule>>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    floor_ms: Option<u64>,
    default_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
    inter_send_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileCloudConfig {
    poll_interval_ms: Option<u64>,
    #[serde(flatten)]
    session: CloudConfig,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<SocketAddr>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("BATTERY_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content =
        fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BatteryConfig, file: FileConfig) {
    if let Some(transport) = file.transport {
        config.transport = transport;
    }

    if let Some(poller) = file.poller {
        if let Some(floor_ms) = poller.floor_ms {
            config.poller.floor = Duration::from_millis(floor_ms);
        }
        if let Some(interval_ms) = poller.default_interval_ms {
            config.poller.default_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = poller.jitter_ms {
            config.poller.jitter_ms = jitter_ms;
        }
        if let Some(delay_ms) = poller.inter_send_delay_ms {
            config.poller.inter_send_delay = Duration::from_millis(delay_ms);
        }
    }

    if let Some(commands) = file.commands {
        config.commands = commands;
    }

    if let Some(discovery) = file.discovery {
        config.discovery = discovery;
    }

    if let Some(cloud) = file.cloud {
        if let Some(interval_ms) = cloud.poll_interval_ms {
            config.cloud_poll_interval_ms = interval_ms;
        }
        config.cloud = Some(cloud.session);
    }

    if let Some(metrics) = file.metrics {
        config.metrics_listen = metrics.listen;
    }

    if let Some(devices) = file.devices {
        config.devices = devices;
    }

    if let Some(scaling) = file.scaling {
        config.scaling = scaling;
    }
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// `tag@ip[:port]` entries separated by commas; a bare `tag` has no known address yet.
pub fn parse_devices(value: &str) -> Result<Vec<DeviceEntry>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (tag, address) = match entry.split_once('@') {
                Some((tag, address)) => (tag.trim(), Some(address.trim())),
                None => (entry, None),
            };
            let (ip, port) = match address {
                None => (None, None),
                Some(address) => match address.parse::<SocketAddr>() {
                    Ok(addr) => (Some(addr.ip()), Some(addr.port())),
                    Err(_) => {
                        let ip = address
                            .parse::<IpAddr>()
                            .with_context(|| format!("invalid device address in '{entry}'"))?;
                        (Some(ip), None)
                    }
                },
            };
            Ok(DeviceEntry {
                source_tag: tag.to_string(),
                ip,
                port,
                poll_interval_secs: None,
                broadcast: false,
            })
        })
        .collect()
}
