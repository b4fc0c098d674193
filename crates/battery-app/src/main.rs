use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use battery_app::cli::{parse_args, Command};
use battery_app::{BatteryConfig, TelemetryStore};
use cloud_session::CloudSession;
use command_dispatcher::CommandDispatcher;
use correlator::Correlator;
use discovery::discover_devices;
use poll_scheduler::PollScheduler;
use protocol::telemetry::ScaleTable;
use protocol::ModeConfig;
use types::{Endpoint, PollTarget};
use udp_transport::{EndpointTable, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args(env::args().skip(1)).context("invalid arguments")?;
    let config = BatteryConfig::load_with_path(args.config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    if let Some(listen) = config.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("metrics exporter init failed")?;
        info!(%listen, "prometheus exporter listening");
    }

    let transport = Transport::new(config.transport.clone());
    transport.connect().context("udp transport bind failed")?;

    let endpoints = EndpointTable::new(config.transport.device_port);
    for device in &config.devices {
        endpoints.insert(device.endpoint());
    }
    endpoints.attach(&transport);

    let outcome = match args.command {
        Command::Discover => print_discovered(&config, &transport).await,
        Command::SetMode { device, mode } => {
            apply_mode(&config, &transport, &endpoints, &device, &mode).await
        }
        Command::Run => run_daemon(&config, &transport, &endpoints).await,
    };

    transport.destroy();
    outcome
}

async fn print_discovered(config: &BatteryConfig, transport: &Transport) -> Result<()> {
    let devices = discover_devices(transport, &config.discovery)
        .await
        .context("device discovery failed")?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn apply_mode(
    config: &BatteryConfig,
    transport: &Transport,
    endpoints: &EndpointTable,
    device: &str,
    mode: &ModeConfig,
) -> Result<()> {
    let endpoint = match endpoints.get(device).filter(|endpoint| endpoint.ip.is_some()) {
        Some(endpoint) => endpoint,
        None => find_device(config, transport, device).await?,
    };

    let dispatcher = CommandDispatcher::new(Correlator::new(transport.clone()), config.commands.clone());
    match dispatcher.set_configuration(&endpoint, mode).await {
        Ok(_) => {
            info!(device, mode = mode.mode_name(), "mode applied");
            Ok(())
        }
        Err(err) if err.is_offline() => {
            Err(anyhow::Error::new(err).context(format!("{device} did not answer")))
        }
        Err(err) => Err(anyhow::Error::new(err).context(format!("mode change on {device} failed"))),
    }
}

async fn find_device(config: &BatteryConfig, transport: &Transport, device: &str) -> Result<Endpoint> {
    info!(device, "address unknown, running discovery");
    let devices = discover_devices(transport, &config.discovery)
        .await
        .context("device discovery failed")?;
    devices
        .into_iter()
        .find(|identity| identity.source_tag == device)
        .map(|identity| identity.endpoint())
        .with_context(|| format!("device {device} was not found on the network"))
}

async fn run_daemon(config: &BatteryConfig, transport: &Transport, endpoints: &EndpointTable) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telemetry = TelemetryStore::new(ScaleTable::from_rules(config.scaling.clone()));
    telemetry.attach(transport, endpoints);

    let mut targets: Vec<PollTarget> = config.devices.iter().map(|device| device.poll_target()).collect();
    if targets.is_empty() {
        let devices = discover_devices(transport, &config.discovery)
            .await
            .context("device discovery failed")?;
        for identity in devices {
            endpoints.insert(identity.endpoint());
            targets.push(PollTarget::new(identity.source_tag));
        }
    }
    if targets.is_empty() {
        warn!("no devices configured or discovered");
    }

    let scheduler = PollScheduler::new(
        transport.clone(),
        Arc::new(endpoints.clone()),
        config.poller.clone(),
    );
    for target in targets {
        scheduler.start(target);
    }
    if !scheduler.tracked().is_empty() {
        info!(
            devices = scheduler.tracked().len(),
            interval_ms = scheduler.effective_interval().as_millis() as u64,
            "polling started"
        );
    }

    let cloud_handle = match &config.cloud {
        Some(cloud_config) => {
            let session = CloudSession::new(cloud_config.clone()).context("cloud client init failed")?;
            Some(tokio::spawn(cloud_task(
                session,
                Duration::from_millis(config.cloud_poll_interval_ms),
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal failed")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    scheduler.shutdown();
    for device in telemetry.devices() {
        if let Some(latest) = telemetry.latest(&device) {
            info!(device = %device, readings = latest.readings.len(), "final telemetry");
        }
    }

    if let Some(handle) = cloud_handle {
        let _ = handle.await;
    }
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

async fn cloud_task(session: CloudSession, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        match session.fetch_status().await {
            Ok(snapshot) => {
                for device in &snapshot.devices {
                    info!(
                        devid = %device.devid,
                        soc = device.number("soc").unwrap_or(f64::NAN),
                        "cloud status"
                    );
                }
            }
            Err(err) if err.is_auth() => {
                error!(error = %err, "cloud authentication failed");
            }
            Err(err) => {
                warn!(error = %err, "cloud status fetch failed");
            }
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("cloud polling stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
