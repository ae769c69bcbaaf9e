//! Powered actuator.
//!
//! A high-power device is a motor, buzzer or similar: a single on/off state
//! driven through SWITCH commands, usually cascaded from a [`super::Relay`]
//! position. It exposes no fields, so GET/SET fail.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{Command, Device, InputError};
use crate::clock::SimClock;
use crate::eventlog::EventLog;
use crate::packet::{DataPacket, ExecutionResult};

/// Byte size of a switch command echo.
const SWITCH_ECHO_BYTES: u64 = 1;

pub struct HighPowerDevice {
    name: String,
    clock: SimClock,
    events: EventLog,
    powered: AtomicBool,
    terminated: AtomicBool,
}

impl HighPowerDevice {
    pub fn new(name: impl Into<String>, clock: SimClock, events: EventLog) -> Self {
        HighPowerDevice {
            name: name.into(),
            clock,
            events,
            powered: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    fn export_state(&self, event: String) {
        self.events.record(self.clock.now(), &self.name, event);
    }
}

impl Device for HighPowerDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_fields(&self) -> Result<(), InputError> {
        Ok(())
    }

    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn execute(&self, command: Command) -> ExecutionResult {
        match command {
            // The position is the relay's concern; only the state matters here.
            Command::Switch { state, .. } => {
                self.powered.store(state, Ordering::Release);
                self.export_state(format!(
                    "[SUCCESS] SWITCH -> {}",
                    if state { "on" } else { "off" }
                ));
                ExecutionResult::ok(DataPacket::new(
                    &self.name,
                    "Power Status",
                    state.to_string(),
                    SWITCH_ECHO_BYTES,
                    self.clock.now(),
                ))
            }
            Command::Get { .. } | Command::Set { .. } => {
                self.export_state("[FAILURE] no readable fields".to_owned());
                ExecutionResult::failed()
            }
        }
    }

    fn tick(&self) {
        self.events.record_with_fields(
            self.clock.now(),
            &self.name,
            "Running",
            vec![("Power Status".to_owned(), self.is_powered().to_string())],
        );
    }

    fn start(&self) {
        self.export_state("Started".to_owned());
    }

    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.export_state("Terminated".to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test(start_paused = true))]
    async fn switch_toggles_power() {
        let device = HighPowerDevice::new("motor", SimClock::new(1.0), EventLog::noop());
        assert!(!device.is_powered());

        let on = device.execute(Command::Switch {
            position: 0,
            state: true,
        });
        assert!(on.is_success());
        assert_eq!(on.value(), Some("true"));
        assert!(device.is_powered());

        let off = device.execute(Command::Switch {
            position: 3,
            state: false,
        });
        assert!(off.is_success(), "position is ignored, only state matters");
        assert!(!device.is_powered());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn reads_and_writes_fail() {
        let device = HighPowerDevice::new("motor", SimClock::new(1.0), EventLog::noop());
        assert!(!device
            .execute(Command::Get {
                field: "Power Status".into()
            })
            .is_success());
        assert!(!device
            .execute(Command::Set {
                field: "Power Status".into(),
                value: "true".into()
            })
            .is_success());
    }
}
