use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;

use battery_app::TelemetryStore;
use poll_scheduler::{PollScheduler, QueryMessage, SchedulerConfig};
use protocol::telemetry::{DeviceMode, QueryKind, ReadingValue, ScaleRule, ScaleTable};
use types::{Endpoint, PollTarget};
use udp_transport::{EndpointTable, Transport, TransportConfig};

const TAG: &str = "VenusC-24215ee580e7";

#[tokio::test]
async fn polled_replies_land_in_telemetry_store() {
    let device = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake device");
    let addr = device.local_addr().expect("addr");
    tokio::spawn(answer_polls(device));

    let transport = Transport::new(TransportConfig {
        bind_port: 0,
        device_port: addr.port(),
        broadcast_address: Some(Ipv4Addr::LOCALHOST),
        local_addresses: Some(Vec::new()),
        ..TransportConfig::default()
    });
    let endpoints = EndpointTable::new(addr.port());
    endpoints.insert(Endpoint::new(TAG).with_ip(addr.ip()));
    endpoints.attach(&transport);

    let telemetry = TelemetryStore::new(ScaleTable::from_rules([
        ScaleRule {
            field: "bat_power".to_string(),
            min_firmware: 150,
            factor: 10.0,
        },
        ScaleRule {
            field: "bat_temp".to_string(),
            min_firmware: 0,
            factor: 0.1,
        },
    ]));
    telemetry.attach(&transport, &endpoints);

    let scheduler = PollScheduler::new(
        transport.clone(),
        Arc::new(endpoints.clone()),
        SchedulerConfig {
            floor: Duration::from_millis(40),
            default_interval: Duration::from_millis(40),
            jitter_ms: 0,
            inter_send_delay: Duration::ZERO,
            rotation: vec![
                QueryMessage::broadcast(QueryKind::Device),
                QueryMessage::each_device(QueryKind::EsStatus),
                QueryMessage::each_device(QueryKind::EsMode),
            ],
        },
    );
    scheduler.start(PollTarget::new(TAG));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let ready = telemetry
            .latest(TAG)
            .map(|latest| latest.readings.contains_key("mode") && latest.readings.contains_key("bat_power"))
            .unwrap_or(false);
        if ready {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "telemetry never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.shutdown();

    let latest = telemetry.latest(TAG).expect("telemetry");
    assert_eq!(latest.firmware, Some(154));
    assert_eq!(latest.number("bat_power"), Some(-1230.0));
    assert_eq!(latest.number("bat_temp"), Some(25.0));
    assert_eq!(latest.number("bat_soc"), Some(64.0));
    assert_eq!(latest.readings.get("mode"), Some(&ReadingValue::Mode(DeviceMode::Auto)));
    assert!(latest.readings.get("id").is_none());
    assert_eq!(telemetry.devices(), vec![TAG.to_string()]);
    assert!(telemetry.latest("VenusE-stranger").is_none());
    assert!(endpoints.last_seen(TAG).is_some());

    transport.destroy();
}

#[tokio::test]
async fn store_keeps_only_latest_values() {
    let telemetry = TelemetryStore::new(ScaleTable::default());
    telemetry.record(TAG, QueryKind::EmStatus, &json!({ "id": 0, "total_power": 420 }));
    telemetry.record(TAG, QueryKind::EmStatus, &json!({ "id": 0, "total_power": 380 }));

    let latest = telemetry.latest(TAG).expect("telemetry");
    assert_eq!(latest.number("total_power"), Some(380.0));
    assert!(telemetry.latest("unknown").is_none());
}

async fn answer_polls(socket: UdpSocket) {
    let mut buf = [0u8; 2048];
    while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
        let Ok(request) = serde_json::from_slice::<Value>(&buf[..len]) else {
            continue;
        };
        let result = match request["method"].as_str() {
            Some("Marstek.GetDevice") => {
                // A neighbour nobody tracks answers the broadcast too.
                let stranger = json!({
                    "src": "VenusE-stranger",
                    "id": request["id"],
                    "result": { "device": "VenusE", "ver": 200 }
                });
                let bytes = serde_json::to_vec(&stranger).expect("encode");
                let _ = socket.send_to(&bytes, peer).await;
                json!({ "device": "VenusC", "ver": 154 })
            }
            Some("ES.GetStatus") => json!({ "id": 0, "bat_soc": 64, "bat_power": -123, "bat_temp": 250 }),
            Some("ES.GetMode") => json!({ "id": 0, "mode": "Auto", "ongrid_power": 0 }),
            _ => continue,
        };
        let reply = json!({ "src": TAG, "id": request["id"], "result": result });
        let bytes = serde_json::to_vec(&reply).expect("encode");
        let _ = socket.send_to(&bytes, peer).await;
    }
}
