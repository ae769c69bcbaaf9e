//! Switch bank cascading power to wired actuators.
//!
//! A relay owns N positions. Each position exposes two synthetic fields,
//! `Connected Device <i>` and `Switch <i> Status`, and may be wired to one
//! [`HighPowerDevice`]. A SWITCH command records the position's state and
//! cascades it to the wired device; switch state is only reachable through
//! SWITCH, so SET fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Command, Device, HighPowerDevice, InputError};
use crate::clock::SimClock;
use crate::eventlog::EventLog;
use crate::packet::{DataPacket, ExecutionResult};

const SWITCH_ECHO_BYTES: u64 = 1;

pub struct Relay {
    name: String,
    clock: SimClock,
    events: EventLog,
    slots: Mutex<Vec<SwitchSlot>>,
    terminated: AtomicBool,
}

#[derive(Default)]
struct SwitchSlot {
    device: Option<Arc<HighPowerDevice>>,
    on: bool,
}

impl Relay {
    pub fn new(name: impl Into<String>, positions: usize, clock: SimClock, events: EventLog) -> Self {
        let mut slots = Vec::with_capacity(positions);
        slots.resize_with(positions, SwitchSlot::default);
        Relay {
            name: name.into(),
            clock,
            events,
            slots: Mutex::new(slots),
            terminated: AtomicBool::new(false),
        }
    }

    /// Wires `device` to `position` and powers it to the position's
    /// recorded switch state. Refuses a position that does not exist or is
    /// already wired.
    pub fn connect_to(&self, device: Arc<HighPowerDevice>, position: usize) -> bool {
        let wired = {
            let mut slots = self.slots.lock();
            match slots.get_mut(position) {
                Some(slot) if slot.device.is_some() => Err("position already wired"),
                Some(slot) => {
                    slot.device = Some(device.clone());
                    Ok(slot.on)
                }
                None => Err("no such position"),
            }
        };
        match wired {
            Ok(state) => {
                device.execute(Command::Switch { position: 0, state });
                self.export_state(format!(
                    "Connected device [{}] to position {position}",
                    device.name()
                ));
                true
            }
            Err(reason) => {
                tracing::warn!(
                    relay = %self.name,
                    device = %device.name(),
                    position,
                    reason,
                    "cannot wire device"
                );
                false
            }
        }
    }

    /// Unwires whatever is at `position`, powering the outgoing device off.
    /// The switch state itself is kept. Returns false only when the position
    /// does not exist.
    pub fn disconnect(&self, position: usize) -> bool {
        let unwired = {
            let mut slots = self.slots.lock();
            slots.get_mut(position).map(|slot| slot.device.take())
        };
        match unwired {
            Some(Some(device)) => {
                device.execute(Command::Switch {
                    position: 0,
                    state: false,
                });
                self.export_state(format!(
                    "Disconnected device [{}] from position {position}",
                    device.name()
                ));
                true
            }
            Some(None) => true,
            None => {
                tracing::warn!(relay = %self.name, position, "cannot unwire, no such position");
                false
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        let slots = self.slots.lock();
        let mut fields = Vec::with_capacity(slots.len() * 2);
        for (position, slot) in slots.iter().enumerate() {
            let device = slot
                .device
                .as_ref()
                .map(|device| device.name().to_owned())
                .unwrap_or_else(|| "None".to_owned());
            fields.push((format!("Connected Device {position}"), device));
            fields.push((format!("Switch {position} Status"), slot.on.to_string()));
        }
        fields
    }

    fn export_state(&self, event: String) {
        self.events.record(self.clock.now(), &self.name, event);
    }
}

impl Device for Relay {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_fields(&self) -> Result<(), InputError> {
        Ok(())
    }

    fn field_names(&self) -> Vec<String> {
        let count = self.slots.lock().len();
        let mut names = Vec::with_capacity(count * 2);
        for position in 0..count {
            names.push(format!("Connected Device {position}"));
            names.push(format!("Switch {position} Status"));
        }
        names
    }

    fn execute(&self, command: Command) -> ExecutionResult {
        match command {
            Command::Get { field } => {
                let value = self
                    .snapshot()
                    .into_iter()
                    .find(|(name, _)| name == &field)
                    .map(|(_, value)| value);
                match value {
                    Some(value) => {
                        self.export_state(format!("[SUCCESS] GET {field} -> {value}"));
                        ExecutionResult::ok(DataPacket::new(
                            &self.name,
                            field,
                            value,
                            SWITCH_ECHO_BYTES,
                            self.clock.now(),
                        ))
                    }
                    None => {
                        self.export_state(format!("[FAILURE] GET {field}: unknown field"));
                        ExecutionResult::failed()
                    }
                }
            }
            Command::Set { field, .. } => {
                self.export_state(format!(
                    "[FAILURE] SET {field}: switch state only changes through SWITCH"
                ));
                ExecutionResult::failed()
            }
            Command::Switch { position, state } => {
                let slot = {
                    let mut slots = self.slots.lock();
                    slots.get_mut(position).map(|slot| {
                        slot.on = state;
                        slot.device.clone()
                    })
                };
                let echo = DataPacket::new(
                    &self.name,
                    format!("Switch {position} Status"),
                    state.to_string(),
                    SWITCH_ECHO_BYTES,
                    self.clock.now(),
                );
                match slot {
                    Some(wired) => {
                        // An unwired position still records its state.
                        let applied = match wired {
                            Some(device) => device
                                .execute(Command::Switch { position: 0, state })
                                .is_success(),
                            None => true,
                        };
                        self.export_state(format!(
                            "[{}] SWITCH {position} -> {}",
                            if applied { "SUCCESS" } else { "FAILURE" },
                            if state { "on" } else { "off" }
                        ));
                        if applied {
                            ExecutionResult::ok(echo)
                        } else {
                            ExecutionResult::rejected(echo)
                        }
                    }
                    None => {
                        self.export_state(format!("[FAILURE] SWITCH {position}: no such position"));
                        ExecutionResult::rejected(echo)
                    }
                }
            }
        }
    }

    fn tick(&self) {
        self.events
            .record_with_fields(self.clock.now(), &self.name, "Running", self.snapshot());
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
