//! Runtime configuration: command-line flags layered over an optional
//! TOML settings file. Flags win over file values, file values over the
//! built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::clock::DEFAULT_SCALE_FACTOR;
use crate::zone::ZoneParams;

#[derive(Debug, Parser)]
#[command(name = "sitenet", version, about = "Construction-site sensor network simulator")]
pub struct SimulationArgs {
    /// Path to a TOML settings file.
    #[arg(long, env = "SITENET_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory event CSVs are written to.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Directory device playback CSVs are read from.
    #[arg(long)]
    pub input_dir: Option<PathBuf>,
    /// Simulated seconds elapsing per wall-clock second.
    #[arg(long)]
    pub time_scale: Option<f64>,
    /// Simulated milliseconds between controller ticks.
    #[arg(long)]
    pub step_ms: Option<u64>,
    /// Wall-clock seconds to run before shutting down.
    #[arg(long, default_value_t = 10)]
    pub run_for: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub input_dir: PathBuf,
    pub database_path: PathBuf,
    pub time_scale: f64,
    pub step_ms: u64,
    pub rtt_to_master_ms: u64,
    pub ble_rate_kbps: u64,
    pub wifi_rate_kbps: u64,
    pub inter_zone_rtt_ms: u64,
    pub buffer_threshold: usize,
    pub camera_frame_bytes: u64,
    pub permitted_ids: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_dir: PathBuf::from("logs"),
            input_dir: PathBuf::from("inputs"),
            database_path: PathBuf::from("logs/Database.csv"),
            time_scale: DEFAULT_SCALE_FACTOR,
            step_ms: 500,
            rtt_to_master_ms: 10,
            ble_rate_kbps: 1000,
            wifi_rate_kbps: 10_000,
            inter_zone_rtt_ms: 100,
            buffer_threshold: 20,
            camera_frame_bytes: 3_500_000,
            permitted_ids: vec!["Omar".into(), "Farrag".into(), "Mohsen".into()],
        }
    }
}

impl Settings {
    /// Reads the settings file named by `args` (defaults when absent),
    /// applies flag overrides and validates the result.
    pub fn load(args: &SimulationArgs) -> anyhow::Result<Settings> {
        let mut settings = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading settings file {}", path.display()))?;
                Settings::from_toml_str(&raw)?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(args);
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Settings> {
        toml::from_str(raw).context("parsing settings")
    }

    pub fn apply_overrides(&mut self, args: &SimulationArgs) {
        if let Some(log_dir) = &args.log_dir {
            self.log_dir = log_dir.clone();
        }
        if let Some(input_dir) = &args.input_dir {
            self.input_dir = input_dir.clone();
        }
        if let Some(time_scale) = args.time_scale {
            self.time_scale = time_scale;
        }
        if let Some(step_ms) = args.step_ms {
            self.step_ms = step_ms;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.time_scale.is_finite() && self.time_scale > 0.0,
            "time_scale must be a positive number"
        );
        anyhow::ensure!(self.step_ms > 0, "step_ms must be at least 1");
        anyhow::ensure!(self.ble_rate_kbps > 0, "ble_rate_kbps must be at least 1");
        anyhow::ensure!(self.wifi_rate_kbps > 0, "wifi_rate_kbps must be at least 1");
        anyhow::ensure!(
            self.buffer_threshold > 0,
            "buffer_threshold must be at least 1"
        );
        Ok(())
    }

    /// Builder parameters for one zone forwarding along `forward_to`.
    pub fn zone_params(&self, forward_to: Vec<String>) -> ZoneParams {
        ZoneParams {
            step: Duration::from_millis(self.step_ms),
            rtt_to_master_ms: self.rtt_to_master_ms,
            ble_rate_kbps: self.ble_rate_kbps,
            wifi_rate_kbps: self.wifi_rate_kbps,
            buffer_threshold: self.buffer_threshold,
            camera_frame_bytes: self.camera_frame_bytes,
            input_dir: self.input_dir.clone(),
            forward_to,
        }
    }
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` with an info
/// default. The library itself never installs a subscriber.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
