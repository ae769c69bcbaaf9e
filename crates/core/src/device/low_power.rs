//! Sensor playback device.
//!
//! A low-power device replays field samples from a CSV input: the header row
//! names the fields, each following row is one tick's worth of values, and
//! rows cycle once exhausted. The literal cell `MAINTAIN` (or a short row)
//! keeps a field's previous value, which is how slowly-changing sensors are
//! encoded without repeating themselves. All fields share one configured
//! byte size.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Command, Device, InputError, UNINITIALIZED_VALUE};
use crate::clock::SimClock;
use crate::eventlog::EventLog;
use crate::packet::{DataPacket, ExecutionResult};

pub struct LowPowerDevice {
    name: String,
    field_size: u64,
    input: Option<PathBuf>,
    clock: SimClock,
    events: EventLog,
    state: Mutex<Playback>,
    terminated: AtomicBool,
}

#[derive(Default)]
struct Playback {
    fields: Vec<String>,
    values: Vec<String>,
    rows: Vec<Vec<String>>,
    cursor: usize,
}

impl LowPowerDevice {
    /// Cell keyword that keeps a field's previous value.
    pub const MAINTAIN: &'static str = "MAINTAIN";

    /// Device whose fields and samples come from a CSV file, loaded by
    /// `init_fields`. A missing file is created empty (fieldless device).
    pub fn from_input_file(
        name: impl Into<String>,
        field_size: u64,
        input: impl Into<PathBuf>,
        clock: SimClock,
        events: EventLog,
    ) -> Self {
        LowPowerDevice {
            name: name.into(),
            field_size,
            input: Some(input.into()),
            clock,
            events,
            state: Mutex::new(Playback::default()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Device built directly from a header and sample rows; used by zone
    /// composition for write-only fields (no input file) and by tests.
    pub fn with_playback(
        name: impl Into<String>,
        field_size: u64,
        fields: Vec<String>,
        rows: Vec<Vec<String>>,
        clock: SimClock,
        events: EventLog,
    ) -> Self {
        let values = vec![UNINITIALIZED_VALUE.to_owned(); fields.len()];
        LowPowerDevice {
            name: name.into(),
            field_size,
            input: None,
            clock,
            events,
            state: Mutex::new(Playback {
                fields,
                values,
                rows,
                cursor: 0,
            }),
            terminated: AtomicBool::new(false),
        }
    }

    fn load_input(&self, path: &Path) -> Result<(), InputError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    device = %self.name,
                    path = %path.display(),
                    "input file missing, creating an empty one"
                );
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| InputError::Create {
                        path: path.to_owned(),
                        source,
                    })?;
                }
                std::fs::write(path, "").map_err(|source| InputError::Create {
                    path: path.to_owned(),
                    source,
                })?;
                return Ok(());
            }
            Err(source) => {
                return Err(InputError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        let mut lines = content.lines().filter(|line| !line.trim().is_empty());
        let fields: Vec<String> = match lines.next() {
            Some(header) => header.split(',').map(|cell| cell.trim().to_owned()).collect(),
            None => Vec::new(),
        };
        let rows: Vec<Vec<String>> = lines
            .map(|line| line.split(',').map(|cell| cell.trim().to_owned()).collect())
            .collect();

        let mut playback = self.state.lock();
        playback.values = vec![UNINITIALIZED_VALUE.to_owned(); fields.len()];
        playback.fields = fields;
        playback.rows = rows;
        playback.cursor = 0;
        Ok(())
    }

    fn export_state(&self, event: String) {
        self.events.record(self.clock.now(), &self.name, event);
    }
}

impl Device for LowPowerDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_fields(&self) -> Result<(), InputError> {
        if let Some(path) = self.input.clone() {
            self.load_input(&path)?;
        }
        let field_count = self.state.lock().fields.len();
        self.export_state(format!("Initialized ({field_count}) fields"));
        Ok(())
    }

    fn field_names(&self) -> Vec<String> {
        self.state.lock().fields.clone()
    }

    fn execute(&self, command: Command) -> ExecutionResult {
        match command {
            Command::Get { field } => {
                let value = {
                    let playback = self.state.lock();
                    playback
                        .fields
                        .iter()
                        .position(|name| name == &field)
                        .map(|index| playback.values[index].clone())
                };
                match value {
                    Some(value) => {
                        self.export_state(format!("[SUCCESS] GET {field} -> {value}"));
                        ExecutionResult::ok(DataPacket::new(
                            &self.name,
                            field,
                            value,
                            self.field_size,
                            self.clock.now(),
                        ))
                    }
                    None => {
                        self.export_state(format!("[FAILURE] GET {field}: unknown field"));
                        ExecutionResult::failed()
                    }
                }
            }
            Command::Set { field, value } => {
                let applied = {
                    let mut playback = self.state.lock();
                    match playback.fields.iter().position(|name| name == &field) {
                        Some(index) => {
                            playback.values[index] = value.clone();
                            true
                        }
                        None => false,
                    }
                };
                if applied {
                    self.export_state(format!("[SUCCESS] SET {field} <- {value}"));
                    ExecutionResult::ok(DataPacket::new(
                        &self.name,
                        field,
                        value,
                        self.field_size,
                        self.clock.now(),
                    ))
                } else {
                    self.export_state(format!("[FAILURE] SET {field}: unknown field"));
                    ExecutionResult::failed()
                }
            }
            Command::Switch { .. } => {
                self.export_state("[FAILURE] SWITCH: not a switching device".to_owned());
                ExecutionResult::failed()
            }
        }
    }

    fn tick(&self) {
        let (event, snapshot) = {
            let mut playback = self.state.lock();
            if playback.fields.is_empty() {
                return;
            }
            let event = if playback.rows.is_empty() {
                "Running".to_owned()
            } else {
                let index = playback.cursor % playback.rows.len();
                let row = playback.rows[index].clone();
                for (position, value) in playback.values.iter_mut().enumerate() {
                    match row.get(position) {
                        Some(cell) if cell != Self::MAINTAIN => *value = cell.clone(),
                        // MAINTAIN or a short row keeps the previous value
                        _ => {}
                    }
                }
                playback.cursor += 1;
                format!("Sampled input row {index}")
            };
            let snapshot = playback
                .fields
                .iter()
                .cloned()
                .zip(playback.values.iter().cloned())
                .collect();
            (event, snapshot)
        };
        self.events
            .record_with_fields(self.clock.now(), &self.name, event, snapshot);
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
