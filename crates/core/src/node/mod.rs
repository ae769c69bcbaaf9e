//! Publish-subscribe roles a zone member plays around its controller.
//!
//! A node wraps exactly one [`Controller`](crate::controller::Controller).
//! Slaves report to a master over a simulated BLE link; the master caches
//! field values, stages packets for the inter-zone uplink, and answers
//! zone-internal queries. Nodes have no task of their own; every delay is
//! paid on the task of whichever controller makes the call.

mod master;
mod slave;

pub use master::MasterNode;
pub use slave::SlaveNode;
