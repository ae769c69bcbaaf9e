//! Message and result value types.
//!
//! A [`DataPacket`] carries one field observation (or one command echo); a
//! [`BulkDataPacket`] batches packets for the inter-zone uplink path. Both
//! are plain values: two packets with equal fields are interchangeable.
//! [`ExecutionResult`] is the uniform return contract for every device
//! operation and every remote node operation.

use std::fmt;

use crate::clock::Timestamp;

/// One field observation or one command's echoed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    source: String,
    field: String,
    value: String,
    size_bytes: u64,
    created_at: Timestamp,
}

impl DataPacket {
    /// Column names matching [`DataPacket`]'s `Display` output.
    pub const CSV_HEADER: &'static str = "Source,Field,Value,Size (bytes),Created At";

    pub fn new(
        source: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
        size_bytes: u64,
        created_at: Timestamp,
    ) -> Self {
        DataPacket {
            source: source.into(),
            field: field.into(),
            value: value.into(),
            size_bytes,
            created_at,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Key this packet's value is cached under in a master's field cache.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.source, self.field)
    }
}

impl fmt::Display for DataPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.source, self.field, self.value, self.size_bytes, self.created_at
        )
    }
}

/// An ordered batch of packets bound for another zone.
///
/// The running total always equals the sum of the contained packet sizes;
/// both appenders update the list and the total together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDataPacket {
    source_node: String,
    created_at: Timestamp,
    packets: Vec<DataPacket>,
    total_size_bytes: u64,
}

impl BulkDataPacket {
    pub fn new(source_node: impl Into<String>, created_at: Timestamp) -> Self {
        BulkDataPacket {
            source_node: source_node.into(),
            created_at,
            packets: Vec::new(),
            total_size_bytes: 0,
        }
    }

    pub fn from_packets(
        source_node: impl Into<String>,
        created_at: Timestamp,
        packets: Vec<DataPacket>,
    ) -> Self {
        let mut bulk = BulkDataPacket::new(source_node, created_at);
        bulk.add_packets(packets);
        bulk
    }

    pub fn add_packet(&mut self, packet: DataPacket) {
        self.total_size_bytes += packet.size_bytes();
        self.packets.push(packet);
    }

    pub fn add_packets(&mut self, packets: impl IntoIterator<Item = DataPacket>) {
        for packet in packets {
            self.add_packet(packet);
        }
    }

    pub fn source_node(&self) -> &str {
        &self.source_node
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn packets(&self) -> &[DataPacket] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }
}

/// Outcome of a device command or remote node operation.
///
/// The packet echoes the operation's parameters or carries the read value;
/// it is absent on lookup failures. SET/SWITCH echo the requested parameters
/// even when the state did not change, so callers must consult `success`,
/// never the packet, to decide whether a write took effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    success: bool,
    packet: Option<DataPacket>,
}

impl ExecutionResult {
    pub fn ok(packet: DataPacket) -> Self {
        ExecutionResult {
            success: true,
            packet: Some(packet),
        }
    }

    /// Command reached the device and parsed, but was not applied.
    pub fn rejected(packet: DataPacket) -> Self {
        ExecutionResult {
            success: false,
            packet: Some(packet),
        }
    }

    /// Lookup or parse failure; nothing to echo.
    pub fn failed() -> Self {
        ExecutionResult {
            success: false,
            packet: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn packet(&self) -> Option<&DataPacket> {
        self.packet.as_ref()
    }

    pub fn into_packet(self) -> Option<DataPacket> {
        self.packet
    }

    /// The carried value, if any packet is present.
    pub fn value(&self) -> Option<&str> {
        self.packet.as_ref().map(|packet| packet.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(field: &str, size: u64) -> DataPacket {
        DataPacket::new("sensor", field, "42", size, Timestamp::from_millis(500))
    }

    #[test]
    fn bulk_total_tracks_every_append() {
        let mut bulk = BulkDataPacket::new("Zone1_master", Timestamp::ZERO);
        assert_eq!(bulk.total_size_bytes(), 0);

        bulk.add_packet(packet("a", 100));
        assert_eq!(bulk.total_size_bytes(), 100);

        bulk.add_packets(vec![packet("b", 20), packet("c", 3)]);
        assert_eq!(bulk.total_size_bytes(), 123);
        assert_eq!(bulk.len(), 3);

        let expected: u64 = bulk.packets().iter().map(DataPacket::size_bytes).sum();
        assert_eq!(bulk.total_size_bytes(), expected);
    }

    #[test]
    fn from_packets_computes_the_total() {
        let bulk = BulkDataPacket::from_packets(
            "Zone1_master",
            Timestamp::ZERO,
            vec![packet("a", 7), packet("b", 9)],
        );
        assert_eq!(bulk.total_size_bytes(), 16);
        assert_eq!(bulk.source_node(), "Zone1_master");
    }

    #[test]
    fn cache_key_joins_source_and_field() {
        assert_eq!(packet("Temperature", 4).cache_key(), "sensor_Temperature");
    }

    #[test]
    fn packet_displays_as_a_csv_row() {
        assert_eq!(packet("Temperature", 4).to_string(), "sensor,Temperature,42,4,0.500");
    }

    #[test]
    fn result_accessors() {
        let ok = ExecutionResult::ok(packet("a", 1));
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some("42"));

        let failed = ExecutionResult::failed();
        assert!(!failed.is_success());
        assert!(failed.packet().is_none());

        let rejected = ExecutionResult::rejected(packet("a", 1));
        assert!(!rejected.is_success());
        assert!(rejected.packet().is_some());
    }
}
