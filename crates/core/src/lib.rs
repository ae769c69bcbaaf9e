/// Scalable virtual time source shared by every actor.
pub mod clock;
pub use clock::{SimClock, Timestamp};

/// Runtime configuration for the simulation binary.
pub mod config;

/// The microcontroller actor: owns devices, runs setup/loop algorithms.
pub mod controller;
pub use controller::{Controller, Routine, RunState};

/// Device capability layer and the concrete device kinds.
pub mod device;

/// CSV persistence of exported state rows, keyed by virtual timestamp.
pub mod eventlog;
pub use eventlog::EventLog;

/// Inter-zone mesh node with source-routed store-and-forward.
pub mod gateway;

/// RTT/bitrate delay accounting for simulated links.
pub mod link;
pub use link::LinkModel;

/// Slave/master roles a node plays in the intra-zone hierarchy.
pub mod node;

/// Message and result value types.
pub mod packet;
pub use packet::{BulkDataPacket, DataPacket, ExecutionResult};

/// Zone composition: wiring nodes, devices and gateways into zones.
pub mod zone;
