//! Shared fixtures for the integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sitenet::node::{MasterNode, SlaveNode};
use sitenet::{Controller, EventLog, LinkModel, SimClock};

/// Simulated pause between controller ticks in this suite.
pub const STEP: Duration = Duration::from_millis(100);

/// Intra-zone link: 10ms round trip at 1000 kbps.
pub fn ble_link() -> LinkModel {
    LinkModel::new(10, 1000)
}

pub fn controller(name: &str, clock: &SimClock, events: &EventLog) -> Arc<Controller> {
    Arc::new(Controller::new(name, clock.clone(), events.clone(), STEP))
}

/// One master with one subscribed slave over [`ble_link`].
pub fn master_with_slave(
    master_name: &str,
    slave_name: &str,
    clock: &SimClock,
    events: &EventLog,
) -> (Arc<MasterNode>, Arc<SlaveNode>) {
    let master = MasterNode::new(
        master_name,
        controller(&format!("{master_name}_ctl"), clock, events),
    );
    let slave = SlaveNode::new(
        slave_name,
        controller(&format!("{slave_name}_ctl"), clock, events),
        ble_link(),
    );
    MasterNode::subscribe(&master, [slave.clone()]);
    (master, slave)
}
