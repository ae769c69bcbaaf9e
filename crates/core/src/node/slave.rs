//! Slave role: delay-accounted remote calls into one zone member.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::controller::{Controller, Parent};
use crate::device::InputError;
use crate::link::LinkModel;
use crate::node::MasterNode;
use crate::packet::{DataPacket, ExecutionResult};

const SWITCH_PAYLOAD_BYTES: u64 = 1;

/// A zone member reporting to a [`MasterNode`] over a simulated BLE link.
///
/// The slave itself is passive. Its async methods are remote-call wrappers:
/// whoever invokes them pays the link delay on their own task, with the
/// wrapped controller's local dispatch in between the two waits.
pub struct SlaveNode {
    name: String,
    controller: Arc<Controller>,
    link: LinkModel,
    master: OnceLock<Weak<MasterNode>>,
    terminated: AtomicBool,
}

impl SlaveNode {
    /// Wraps `controller` as a slave and back-links it as the controller's
    /// parent.
    pub fn new(
        name: impl Into<String>,
        controller: Arc<Controller>,
        link: LinkModel,
    ) -> Arc<SlaveNode> {
        let node = Arc::new(SlaveNode {
            name: name.into(),
            controller,
            link,
            master: OnceLock::new(),
            terminated: AtomicBool::new(false),
        });
        node.controller
            .set_parent(Parent::Slave(Arc::downgrade(&node)));
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn link(&self) -> LinkModel {
        self.link
    }

    pub(crate) fn set_master(&self, master: Weak<MasterNode>) {
        if self.master.set(master).is_err() {
            tracing::warn!(node = %self.name, "master already subscribed");
        }
    }

    pub fn master(&self) -> Option<Arc<MasterNode>> {
        self.master.get().and_then(Weak::upgrade)
    }

    /// Publishes packets to the subscribed master. The calling task pays
    /// the full uplink round trip inside this call.
    pub async fn publish(&self, packets: Vec<DataPacket>) {
        let Some(master) = self.master() else {
            tracing::warn!(node = %self.name, "publish without a master subscription");
            self.export_state("[FAILURE] publish: not subscribed to a master");
            return;
        };
        let count = packets.len();
        self.export_state(format!(
            "Started publishing ({count}) packets to [{}]",
            master.name()
        ));
        master.update(self, packets).await;
        self.export_state(format!(
            "Done publishing ({count}) packets to [{}]",
            master.name()
        ));
    }

    /// Remote field read. The request is negligible, so the caller pays
    /// half the RTT out and half the RTT plus the result's transmission
    /// time back.
    pub async fn get_field(&self, device: &str, field: &str) -> ExecutionResult {
        let clock = self.controller.clock();
        clock.wait_for(self.link.half_rtt()).await;
        let result = self.controller.get_field(device, field);
        let result_size = result.packet().map(DataPacket::size_bytes).unwrap_or(0);
        clock.wait_for(self.link.one_way(result_size)).await;
        result
    }

    /// Remote field write. The value travels out at the link rate; the
    /// acknowledgement back is negligible.
    pub async fn set_field(&self, device: &str, field: &str, value: &str) -> ExecutionResult {
        let clock = self.controller.clock();
        clock.wait_for(self.link.one_way(value.len() as u64)).await;
        let result = self.controller.set_field(device, field, value);
        clock.wait_for(self.link.half_rtt()).await;
        result
    }

    /// Remote switch flip; the command payload is a single byte.
    pub async fn update_switch(&self, device: &str, position: &str, state: &str) -> ExecutionResult {
        let clock = self.controller.clock();
        clock
            .wait_for(self.link.one_way(SWITCH_PAYLOAD_BYTES))
            .await;
        let result = self.controller.update_switch(device, position, state);
        clock.wait_for(self.link.half_rtt()).await;
        result
    }

    /// Sends a scanned badge packet up to the master for an entry decision.
    pub async fn is_permitted_to_enter(&self, badge: DataPacket) -> bool {
        let Some(master) = self.master() else {
            tracing::warn!(node = %self.name, "permission check without a master subscription");
            return false;
        };
        master.is_permitted_to_enter(self, badge).await
    }

    pub fn init_fields(&self) -> Result<(), InputError> {
        self.controller.init_fields()
    }

    pub fn start(&self) {
        self.export_state("Started");
        self.controller.clone().start();
    }

    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.export_state("Terminated");
        }
        self.controller.terminate();
    }

    pub async fn join(&self) {
        self.controller.join().await;
    }

    fn export_state(&self, event: impl Into<String>) {
        self.controller
            .events()
            .record(self.controller.clock().now(), &self.name, event);
    }
}
