//! Simulated construction site: three sensing zones chained over Wi-Fi
//! gateways to a central zone that persists everything it receives.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sitenet::config::{Settings, SimulationArgs};
use sitenet::eventlog::CsvEventLog;
use sitenet::zone::{SensorSpec, SiteDatabase, Zone};
use sitenet::SimClock;

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "trace")]
    sitenet::config::init_tracing();

    let args = SimulationArgs::parse();
    let settings = Settings::load(&args)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")?;
    rt.block_on(run(&args, &settings))
}

async fn run(args: &SimulationArgs, settings: &Settings) -> anyhow::Result<()> {
    write_sample_inputs(&settings.input_dir)?;

    let clock = SimClock::new(settings.time_scale);
    let (events, log_task) = CsvEventLog::spawn(&settings.log_dir)?;
    let database = Arc::new(SiteDatabase::new(&settings.database_path));

    // Zones sit on a chain, so each one routes through every zone between
    // itself and the central zone.
    let zone1 = Zone::build_slave_zone(
        "Zone1",
        &env_sensors(&["temperature", "humidity"]),
        &settings.zone_params(route(&["Zone2", "Zone3", "CentralZone"])),
        &clock,
        &events,
    );
    let zone2 = Zone::build_slave_zone(
        "Zone2",
        &env_sensors(&["temperature", "dust"]),
        &settings.zone_params(route(&["Zone3", "CentralZone"])),
        &clock,
        &events,
    );
    let zone3 = Zone::build_slave_zone(
        "Zone3",
        &env_sensors(&["noise"]),
        &settings.zone_params(route(&["CentralZone"])),
        &clock,
        &events,
    );
    let central = Zone::build_master_zone(
        "CentralZone",
        database.clone(),
        &settings.zone_params(Vec::new()),
        &clock,
        &events,
    );

    zone1.connect_to(&zone2, settings.inter_zone_rtt_ms);
    zone2.connect_to(&zone3, settings.inter_zone_rtt_ms);
    zone3.connect_to(&central, settings.inter_zone_rtt_ms);

    let zones = [&zone1, &zone2, &zone3, &central];
    for zone in zones {
        for id in &settings.permitted_ids {
            zone.add_permitted_id(id.clone());
        }
        zone.init_fields()
            .with_context(|| format!("loading initial device state for {}", zone.name()))?;
    }

    clock.reset();
    for zone in zones {
        zone.start();
    }
    tracing::info!(
        zones = zones.len(),
        time_scale = settings.time_scale,
        "site is running"
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.run_for)) => {
            tracing::info!(seconds = args.run_for, "run window elapsed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    for zone in zones {
        zone.terminate();
    }
    for zone in zones {
        zone.join().await;
    }
    tracing::info!(
        simulated_secs = clock.now().as_secs_f64(),
        database = %database.path().display(),
        "site stopped"
    );

    // The writer drains once every log handle is gone; the zones hold
    // clones, so drop them before waiting on it.
    drop(zone1);
    drop(zone2);
    drop(zone3);
    drop(central);
    drop(events);
    log_task.shutdown().await;
    Ok(())
}

fn env_sensors(names: &[&str]) -> Vec<SensorSpec> {
    names
        .iter()
        .map(|name| SensorSpec {
            name: (*name).to_owned(),
            field_size: 4,
        })
        .collect()
}

fn route(hops: &[&str]) -> Vec<String> {
    hops.iter().map(|hop| (*hop).to_owned()).collect()
}

/// Seeds playback CSVs for the demo devices. Existing files are kept, so a
/// user can swap in their own traces without fighting the binary.
fn write_sample_inputs(dir: &Path) -> anyhow::Result<()> {
    const SAMPLES: &[(&str, &str)] = &[
        (
            "Zone1_gate_scanner_input.csv",
            "ID\nOmar\nIntruder\nMAINTAIN\nFarrag\n",
        ),
        (
            "Zone2_gate_scanner_input.csv",
            "ID\nMohsen\nGhost\nOmar\nMAINTAIN\n",
        ),
        (
            "Zone3_gate_scanner_input.csv",
            "ID\nFarrag\nMAINTAIN\nVisitor\nMohsen\n",
        ),
        (
            "Zone1_temperature_sensor_input.csv",
            "Temperature\n21\n22\nMAINTAIN\n24\n",
        ),
        (
            "Zone1_humidity_sensor_input.csv",
            "Humidity\n40\n41\n43\nMAINTAIN\n",
        ),
        (
            "Zone2_temperature_sensor_input.csv",
            "Temperature\n19\n20\n18\n17\n",
        ),
        ("Zone2_dust_sensor_input.csv", "Dust\n3\n5\n2\n6\n"),
        ("Zone3_noise_sensor_input.csv", "Noise\n60\n72\n81\n65\n"),
    ];

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating input directory {}", dir.display()))?;
    for (file, contents) in SAMPLES {
        let path = dir.join(file);
        if !path.exists() {
            std::fs::write(&path, contents)
                .with_context(|| format!("writing sample input {}", path.display()))?;
        }
    }
    Ok(())
}
