//! Persistence of exported state rows.
//!
//! Every simulated object reports notable state changes as [`EventRecord`]s:
//! a virtual timestamp, the object's name, a free-form event string, and an
//! optional field snapshot. Records flow through an [`EventSink`]; the
//! shipped CSV sink hands them to a background task over an unbounded
//! channel so actors never block on file I/O, and writes one
//! `<object>_output.csv` per object under the log directory. Every record is
//! also mirrored to `tracing` at debug level.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Timestamp;

/// One exported state row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: Timestamp,
    pub object: String,
    pub event: String,
    pub fields: Vec<(String, String)>,
}

/// Destination for exported state rows.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, record: EventRecord);
}

/// Shared handle simulated objects report through. Cheap to clone.
#[derive(Clone)]
pub struct EventLog {
    sink: Arc<dyn EventSink>,
}

impl EventLog {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        EventLog { sink }
    }

    /// Discards every record; for benchmarks and quiet test fixtures.
    pub fn noop() -> Self {
        EventLog {
            sink: Arc::new(NoopSink),
        }
    }

    pub fn record(&self, timestamp: Timestamp, object: &str, event: impl Into<String>) {
        self.record_with_fields(timestamp, object, event, Vec::new());
    }

    pub fn record_with_fields(
        &self,
        timestamp: Timestamp,
        object: &str,
        event: impl Into<String>,
        fields: Vec<(String, String)>,
    ) {
        let event = event.into();
        tracing::debug!(target: "sitenet::event", object, time = %timestamp, %event);
        self.sink.record(EventRecord {
            timestamp,
            object: object.to_owned(),
            event,
            fields,
        });
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _record: EventRecord) {}
}

/// Sink that keeps every record in memory; the test fixtures' sink.
#[derive(Default)]
pub struct CapturingSink {
    records: Mutex<Vec<EventRecord>>,
}

impl CapturingSink {
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Event strings recorded for one object, in order.
    pub fn events_for(&self, object: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.object == object)
            .map(|record| record.event.clone())
            .collect()
    }
}

impl EventSink for CapturingSink {
    fn record(&self, record: EventRecord) {
        self.records.lock().push(record);
    }
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// CSV sink backed by a background writer task.
pub struct CsvEventLog {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl CsvEventLog {
    /// Creates `dir` and spawns the writer task on the ambient runtime.
    ///
    /// Returns the log handle to distribute to simulated objects and the
    /// task handle to await at shutdown.
    pub fn spawn(dir: impl Into<PathBuf>) -> Result<(EventLog, EventLogTask), EventLogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| EventLogError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(dir, rx));
        let log = EventLog::new(Arc::new(CsvEventLog { tx }));
        Ok((log, EventLogTask { handle }))
    }
}

impl EventSink for CsvEventLog {
    fn record(&self, record: EventRecord) {
        // Send fails only after the writer task is gone; late rows from
        // still-draining actors are dropped.
        let _ = self.tx.send(record);
    }
}

/// Handle on the background writer task.
pub struct EventLogTask {
    handle: JoinHandle<()>,
}

impl EventLogTask {
    /// Waits for the writer to drain and exit. The writer exits once every
    /// [`EventLog`] handle cloned from the sink has been dropped.
    pub async fn shutdown(self) {
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "event log writer task failed");
        }
    }
}

struct ObjectFile {
    file: tokio::fs::File,
    columns: Vec<String>,
}

async fn write_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<EventRecord>) {
    let mut files: HashMap<String, ObjectFile> = HashMap::new();
    while let Some(record) = rx.recv().await {
        if let Err(error) = append_record(&dir, &mut files, &record).await {
            tracing::warn!(object = %record.object, %error, "failed to append event row");
        }
    }
    for target in files.values_mut() {
        let _ = target.file.flush().await;
    }
}

async fn append_record(
    dir: &Path,
    files: &mut HashMap<String, ObjectFile>,
    record: &EventRecord,
) -> std::io::Result<()> {
    let target = match files.entry(record.object.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            // The column set is fixed by the first record an object exports;
            // later records are matched to it by key.
            let path = dir.join(format!("{}_output.csv", record.object));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            let columns: Vec<String> = record.fields.iter().map(|(key, _)| key.clone()).collect();
            let mut target = ObjectFile { file, columns };
            let mut header = String::from("Timestamp,Object Name,Event");
            for column in &target.columns {
                header.push(',');
                header.push_str(&csv_cell(column));
            }
            header.push('\n');
            target.file.write_all(header.as_bytes()).await?;
            entry.insert(target)
        }
    };

    let mut row = format!(
        "{},{},{}",
        record.timestamp,
        csv_cell(&record.object),
        csv_cell(&record.event)
    );
    for column in &target.columns {
        let value = record
            .fields
            .iter()
            .find(|(key, _)| key == column)
            .map(|(_, value)| value.as_str())
            .unwrap_or("");
        row.push(',');
        row.push_str(&csv_cell(value));
    }
    row.push('\n');
    target.file.write_all(row.as_bytes()).await
}

fn csv_cell(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[test]
    fn capturing_sink_keeps_rows_in_order() {
        let sink = Arc::new(CapturingSink::default());
        let log = EventLog::new(sink.clone());

        log.record(Timestamp::from_millis(100), "gate", "Started");
        log.record_with_fields(
            Timestamp::from_millis(600),
            "gate",
            "Scanned badge",
            vec![("ID".into(), "Omar".into())],
        );
        log.record(Timestamp::from_millis(700), "relay", "Started");

        assert_eq!(sink.events_for("gate"), vec!["Started", "Scanned badge"]);
        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].fields, vec![("ID".into(), "Omar".into())]);
    }

    #[test]
    fn cells_with_commas_are_quoted() {
        assert_eq!(csv_cell("plain"), "plain");
        assert_eq!(csv_cell("a,b"), "\"a,b\"");
        assert_eq!(csv_cell("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test_log::test(tokio::test)]
    async fn csv_sink_writes_one_file_per_object() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (log, task) = CsvEventLog::spawn(dir.path())?;

        log.record_with_fields(
            Timestamp::from_millis(500),
            "Zone1_master",
            "Received (2) packets",
            vec![
                ("sensor_Temperature".into(), "21".into()),
                ("sensor_Humidity".into(), "60".into()),
            ],
        );
        log.record_with_fields(
            Timestamp::from_millis(1000),
            "Zone1_master",
            "Received (1) packets",
            vec![("sensor_Temperature".into(), "22".into())],
        );
        log.record(Timestamp::from_millis(1500), "Zone1_gate", "Started");

        drop(log);
        task.shutdown().await;

        let master = std::fs::read_to_string(dir.path().join("Zone1_master_output.csv"))?;
        let mut lines = master.lines();
        assert_eq!(
            lines.next(),
            Some("Timestamp,Object Name,Event,sensor_Temperature,sensor_Humidity")
        );
        assert_eq!(
            lines.next(),
            Some("0.500,Zone1_master,Received (2) packets,21,60")
        );
        // Second record omitted the humidity key; its column stays empty.
        assert_eq!(
            lines.next(),
            Some("1.000,Zone1_master,Received (1) packets,22,")
        );

        let gate = std::fs::read_to_string(dir.path().join("Zone1_gate_output.csv"))?;
        assert_eq!(
            gate.lines().collect::<Vec<_>>(),
            vec!["Timestamp,Object Name,Event", "1.500,Zone1_gate,Started"]
        );
        Ok(())
    }
}
