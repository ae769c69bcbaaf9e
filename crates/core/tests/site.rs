//! End-to-end site run: a sensing zone chained to the central zone, with
//! event CSVs and the site database written to disk.

use std::sync::Arc;
use std::time::Duration;

use sitenet::eventlog::CsvEventLog;
use sitenet::zone::{SensorSpec, SiteDatabase, Zone, ZoneParams};
use sitenet::SimClock;
use tempfile::tempdir;
use testresult::TestResult;

#[test_log::test(tokio::test(start_paused = true))]
async fn sensor_readings_reach_the_site_database() -> TestResult {
    let dir = tempdir()?;
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&inputs)?;
    std::fs::write(
        inputs.join("Zone1_gate_scanner_input.csv"),
        "ID\nOmar\nIntruder\n",
    )?;
    std::fs::write(
        inputs.join("Zone1_temp_sensor_input.csv"),
        "Temperature\n21\n22\n23\n",
    )?;
    let logs = dir.path().join("logs");
    let (events, log_task) = CsvEventLog::spawn(&logs)?;
    let clock = SimClock::new(1.0);

    let params = ZoneParams {
        step: Duration::from_millis(100),
        rtt_to_master_ms: 10,
        ble_rate_kbps: 1000,
        wifi_rate_kbps: 10_000,
        buffer_threshold: 2,
        camera_frame_bytes: 1000,
        input_dir: inputs.clone(),
        forward_to: vec!["CentralZone".to_owned()],
    };
    let zone1 = Zone::build_slave_zone(
        "Zone1",
        &[SensorSpec {
            name: "temp".into(),
            field_size: 4,
        }],
        &params,
        &clock,
        &events,
    );
    let database = Arc::new(SiteDatabase::new(logs.join("Database.csv")));
    let central = Zone::build_master_zone(
        "CentralZone",
        database.clone(),
        &ZoneParams {
            forward_to: Vec::new(),
            ..params.clone()
        },
        &clock,
        &events,
    );
    zone1.connect_to(&central, 100);
    zone1.add_permitted_id("Omar");
    zone1.init_fields()?;
    central.init_fields()?;

    clock.reset();
    zone1.start();
    central.start();
    clock.wait_for(Duration::from_secs(5)).await;
    zone1.terminate();
    central.terminate();
    zone1.join().await;
    central.join().await;

    let rows = std::fs::read_to_string(database.path())?;
    let mut lines = rows.lines();
    assert_eq!(
        lines.next(),
        Some("Time of Arrival,Source Node,Bulk Created At,Source,Field,Value,Size (bytes),Created At")
    );
    assert!(lines.next().is_some(), "at least one aggregate was stored");
    assert!(rows.contains(",Zone1_master,"), "aggregates name their zone");
    assert!(
        rows.contains("Zone1_temp_sensor,Temperature,"),
        "sensor readings are persisted: {rows}"
    );
    assert!(
        rows.contains("Zone1_gate_scanner,ID,"),
        "badge scans are persisted alongside sensor data"
    );
    assert!(
        rows.contains("Zone1_camera,Frame,frame-"),
        "a camera frame rides along with every aggregate"
    );

    // Flush the event log before inspecting the per-object CSVs.
    drop(zone1);
    drop(central);
    drop(events);
    log_task.shutdown().await;

    let master_rows = std::fs::read_to_string(logs.join("Zone1_master_output.csv"))?;
    assert!(master_rows.contains("[PERMITTED] entry check for [Omar] at [Zone1_gate]"));
    assert!(master_rows.contains("[DENIED] entry check for [Intruder] at [Zone1_gate]"));
    assert!(master_rows.contains("Drained ("));

    let relay_rows = std::fs::read_to_string(logs.join("Zone1_gate_relay_output.csv"))?;
    assert!(relay_rows.contains("[SUCCESS] SWITCH 0 -> on"));
    assert!(relay_rows.contains("[SUCCESS] SWITCH 0 -> off"));
    let motor_rows = std::fs::read_to_string(logs.join("Zone1_gate_motor_output.csv"))?;
    assert!(
        motor_rows.contains("[SUCCESS] SWITCH -> on"),
        "the gate motor was powered for the permitted badge"
    );

    let central_rows = std::fs::read_to_string(logs.join("CentralZone_master_ctl_output.csv"))?;
    assert!(central_rows.contains("Received bulk packet"));

    for object in [
        "Zone1_gate_scanner",
        "Zone1_temp_sensor",
        "Zone1_camera",
        "Zone1_speaker_unit",
    ] {
        assert!(
            logs.join(format!("{object}_output.csv")).exists(),
            "{object} should export state rows"
        );
    }
    Ok(())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn the_speaker_is_announced_once_at_setup() -> TestResult {
    let dir = tempdir()?;
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&inputs)?;
    let (events, log_task) = CsvEventLog::spawn(dir.path().join("logs"))?;
    let clock = SimClock::new(1.0);

    let zone = Zone::build_slave_zone(
        "Zone1",
        &[],
        &ZoneParams {
            step: Duration::from_millis(100),
            rtt_to_master_ms: 10,
            ble_rate_kbps: 1000,
            wifi_rate_kbps: 10_000,
            buffer_threshold: 2,
            camera_frame_bytes: 1000,
            input_dir: inputs,
            forward_to: Vec::new(),
        },
        &clock,
        &events,
    );
    zone.init_fields()?;

    clock.reset();
    zone.start();
    clock.wait_for(Duration::from_millis(500)).await;
    zone.terminate();
    zone.join().await;

    let played = zone
        .slave("Zone1_speaker")
        .and_then(|speaker| {
            speaker
                .controller()
                .get_field("Zone1_speaker_unit", "Played Message")
                .into_packet()
        })
        .map(|packet| packet.value().to_owned());
    assert_eq!(played.as_deref(), Some("Zone online"));
    // The cache tracks published and scanned values, not remote writes.
    assert_eq!(
        zone.master()
            .current_value("Zone1_speaker_unit_Played Message")
            .as_deref(),
        Some(sitenet::device::UNINITIALIZED_VALUE)
    );

    drop(zone);
    drop(events);
    log_task.shutdown().await;
    Ok(())
}
