//! Device capability layer.
//!
//! Devices are passive: they hold field state and answer typed commands;
//! nothing in a device runs on its own task. The owning controller drives
//! [`Device::tick`] once per scheduling step and dispatches [`Command`]s
//! through the uniform `execute` contract. Three concrete kinds ship here:
//! sensor playback ([`LowPowerDevice`]), a powered actuator
//! ([`HighPowerDevice`]) and a switch bank ([`Relay`]) cascading power to
//! actuators.

mod high_power;
mod low_power;
mod relay;

pub use high_power::HighPowerDevice;
pub use low_power::LowPowerDevice;
pub use relay::Relay;

use std::path::PathBuf;

use thiserror::Error;

use crate::packet::ExecutionResult;

/// Value a field holds before its first sample or write.
pub const UNINITIALIZED_VALUE: &str = "Uninitialized";

/// Commands understood by every device.
///
/// Payloads are typed; string parsing happens once, at the controller's
/// `update_switch` boundary, never inside a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { field: String },
    Set { field: String, value: String },
    Switch { position: usize, state: bool },
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read input file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create input file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Capability surface the controller consumes.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Loads initial field state from the device's input source.
    fn init_fields(&self) -> Result<(), InputError>;

    /// Field names this device exposes, in a stable order.
    fn field_names(&self) -> Vec<String>;

    fn execute(&self, command: Command) -> ExecutionResult;

    /// Per-tick sampling/update, driven by the owning controller.
    fn tick(&self);

    fn start(&self);

    fn terminate(&self);
}
