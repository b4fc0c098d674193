use protocol::telemetry::{
    firmware_version, normalize, DeviceMode, QueryKind, ReadingValue, ScaleRule, ScaleTable,
};
use protocol::{
    encode_request, is_negative_ack, parse_reply, ModeConfig, ProtocolError, ReplyBody,
    ValidationError, Weekday, WeekdaySet, CORRELATION_ID_CEILING, ES_GET_STATUS,
};
use serde_json::{json, Value};

#[test]
fn parse_status_reply_fixture() {
    let data = include_bytes!("fixtures/es_status_reply.json");
    let frame = parse_reply(data).expect("reply parse");
    assert_eq!(frame.src, "VenusC-24215ee580e7");
    assert_eq!(frame.id, Some(QueryKind::EsStatus.poll_id()));
    match frame.body {
        ReplyBody::Result(result) => assert_eq!(result["bat_soc"], 98),
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn malformed_datagrams_are_rejected() {
    assert!(matches!(
        parse_reply(&[0xff, 0xfe, 0x00]),
        Err(ProtocolError::Utf8(_))
    ));
    assert!(matches!(parse_reply(b"not json"), Err(ProtocolError::Json(_))));
    assert!(matches!(parse_reply(b"[1,2,3]"), Err(ProtocolError::NotAnObject)));
    assert!(matches!(
        parse_reply(br#"{"id":1,"result":{}}"#),
        Err(ProtocolError::MissingSource)
    ));
    assert!(matches!(
        parse_reply(br#"{"src":42,"id":1}"#),
        Err(ProtocolError::MissingSource)
    ));
}

#[test]
fn reply_without_result_or_error_is_empty() {
    let frame = parse_reply(br#"{"src":"VenusE-1","id":9}"#).expect("reply parse");
    assert_eq!(frame.body, ReplyBody::Empty);
}

#[test]
fn string_error_becomes_error_body() {
    let frame = parse_reply(br#"{"src":"VenusE-1","id":9,"error":"busy"}"#).expect("reply parse");
    assert_eq!(
        frame.body,
        ReplyBody::Error {
            code: None,
            message: "busy".to_string()
        }
    );
}

#[test]
fn request_frame_shape() {
    let bytes = encode_request(12, ES_GET_STATUS, &json!({ "id": 0 })).expect("encode");
    let value: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(value, json!({ "id": 12, "method": "ES.GetStatus", "params": { "id": 0 } }));
}

#[test]
fn weekday_bitmask_round_trip_monday_wednesday_friday() {
    let selected = [Weekday::Monday, Weekday::Wednesday, Weekday::Friday];
    let set: WeekdaySet = selected.into_iter().collect();
    // Monday is bit 0, Sunday bit 6.
    assert_eq!(set.bits(), 0b0001_0101);

    let decoded = WeekdaySet::from_bits(set.bits()).days();
    assert_eq!(decoded, selected.to_vec());
}

#[test]
fn weekday_bitmask_from_indices() {
    let set = WeekdaySet::from_indices(&[5, 6]).expect("indices");
    assert_eq!(set.bits(), 0b0110_0000);
    assert_eq!(WeekdaySet::from_indices(&[0, 1, 2, 3, 4, 5, 6]).unwrap(), WeekdaySet::EVERY_DAY);
    assert_eq!(
        WeekdaySet::from_indices(&[7]),
        Err(ValidationError::Weekday(7))
    );
    assert_eq!(WeekdaySet::from_bits(0xff), WeekdaySet::EVERY_DAY);
}

#[test]
fn manual_mode_params() {
    let weekdays = WeekdaySet::from_indices(&[0, 2, 4]).unwrap();
    let config = ModeConfig::manual(1, "8:30", "20:05", weekdays, 800.4, true).expect("manual");
    assert_eq!(
        config.to_params(),
        json!({
            "id": 0,
            "config": {
                "mode": "Manual",
                "manual_cfg": {
                    "time_num": 1,
                    "start_time": "08:30",
                    "end_time": "20:05",
                    "week_set": 21,
                    "power": 800,
                    "enable": 1
                }
            }
        })
    );
}

#[test]
fn auto_ai_and_passive_params() {
    assert_eq!(
        ModeConfig::Auto.to_params()["config"],
        json!({ "mode": "Auto", "auto_cfg": { "enable": 1 } })
    );
    assert_eq!(
        ModeConfig::Ai.to_params()["config"],
        json!({ "mode": "AI", "ai_cfg": { "enable": 1 } })
    );
    let passive = ModeConfig::passive(1500.0, 300.0).expect("passive");
    assert_eq!(
        passive.to_params()["config"],
        json!({ "mode": "Passive", "passive_cfg": { "power": 1500, "cd_time": 300 } })
    );
}

#[test]
fn invalid_mode_inputs_are_rejected() {
    assert!(matches!(
        ModeConfig::passive(-1.0, 300.0),
        Err(ValidationError::NotNonNegative { field: "power", .. })
    ));
    assert!(matches!(
        ModeConfig::passive(100.0, f64::NAN),
        Err(ValidationError::NotNonNegative { field: "cd_time", .. })
    ));
    assert!(matches!(
        ModeConfig::passive(f64::INFINITY, 0.0),
        Err(ValidationError::NotNonNegative { .. })
    ));
    assert!(matches!(
        ModeConfig::manual(1, "25:00", "20:00", WeekdaySet::EVERY_DAY, 100.0, true),
        Err(ValidationError::InvalidTime { field: "start_time", .. })
    ));
    assert_eq!(
        ModeConfig::manual(10, "08:00", "20:00", WeekdaySet::EVERY_DAY, 100.0, true),
        Err(ValidationError::TimeSlot(10))
    );
    assert_eq!(
        ModeConfig::manual(0, "08:00", "20:00", WeekdaySet::empty(), 100.0, true),
        Err(ValidationError::NoWeekdays)
    );
}

#[test]
fn negative_ack_detection() {
    assert!(is_negative_ack(&json!({ "id": 0, "set_result": false })));
    assert!(is_negative_ack(&json!({ "set_result": 0 })));
    assert!(!is_negative_ack(&json!({ "id": 0, "set_result": true })));
    assert!(!is_negative_ack(&json!({ "id": 0 })));
}

#[test]
fn poll_ids_never_collide_with_correlation_ids() {
    for kind in QueryKind::ALL {
        assert!(kind.poll_id() > CORRELATION_ID_CEILING);
        assert_eq!(QueryKind::from_poll_id(kind.poll_id()), Some(kind));
    }
    assert_eq!(QueryKind::from_poll_id(12), None);
    assert_eq!(QueryKind::from_poll_id(QueryKind::WifiStatus.poll_id() + 1), None);
}

#[test]
fn scale_table_picks_newest_applicable_rule() {
    let table = ScaleTable::from_rules([
        ScaleRule {
            field: "bat_power".to_string(),
            min_firmware: 154,
            factor: 10.0,
        },
        ScaleRule {
            field: "bat_power".to_string(),
            min_firmware: 0,
            factor: 1.0,
        },
        ScaleRule {
            field: "bat_temp".to_string(),
            min_firmware: 140,
            factor: 0.1,
        },
    ]);

    assert_eq!(table.len(), 3);
    assert_eq!(table.factor("bat_power", Some(160)), 10.0);
    assert_eq!(table.factor("bat_power", Some(153)), 1.0);
    assert_eq!(table.factor("bat_power", None), 1.0);
    assert_eq!(table.factor("bat_temp", Some(100)), 1.0);
    assert_eq!(table.factor("bat_temp", Some(140)), 0.1);
    assert_eq!(table.factor("unknown", Some(200)), 1.0);
}

#[test]
fn normalize_scales_numbers_and_types_mode() {
    let table = ScaleTable::from_rules([ScaleRule {
        field: "bat_temp".to_string(),
        min_firmware: 0,
        factor: 0.1,
    }]);
    let result = json!({ "id": 0, "bat_temp": 215, "mode": "Passive", "charg_flag": true });

    let readings = normalize(QueryKind::BatStatus, &result, &table, Some(150));
    assert_eq!(readings.len(), 3);
    let temp = readings.iter().find(|r| r.field == "bat_temp").expect("temp");
    match temp.value {
        ReadingValue::Number(value) => assert!((value - 21.5).abs() < 1e-9),
        ref other => panic!("unexpected {other:?}"),
    }
    let mode = readings.iter().find(|r| r.field == "mode").expect("mode");
    assert_eq!(mode.value, ReadingValue::Mode(DeviceMode::Passive));
    assert!(readings.iter().all(|r| r.field != "id"));
}

#[test]
fn firmware_version_from_device_result() {
    assert_eq!(firmware_version(&json!({ "device": "VenusC", "ver": 154 })), Some(154));
    assert_eq!(firmware_version(&json!({ "ver": "139" })), Some(139));
    assert_eq!(firmware_version(&json!({ "device": "VenusC" })), None);
}
