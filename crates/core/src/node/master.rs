//! Master role: zone-level cache, packet staging and entry decisions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::controller::{Controller, Parent};
use crate::device::{InputError, UNINITIALIZED_VALUE};
use crate::node::SlaveNode;
use crate::packet::{BulkDataPacket, DataPacket, ExecutionResult};

/// The zone coordinator. Aggregates from subscribed [`SlaveNode`]s, caches
/// the last value of every field in the zone, stages packets for the
/// inter-zone uplink and stores bulk packets arriving from other zones.
///
/// The cache key for a field is `<device>_<field>`, the same shape
/// [`DataPacket::cache_key`] produces.
pub struct MasterNode {
    name: String,
    controller: Arc<Controller>,
    subscribers: Mutex<HashMap<String, Arc<SlaveNode>>>,
    cache: Mutex<BTreeMap<String, String>>,
    buffer: Mutex<Vec<DataPacket>>,
    inbox: Mutex<Vec<BulkDataPacket>>,
    terminated: AtomicBool,
}

impl MasterNode {
    /// Wraps `controller` as a master and back-links it as the controller's
    /// parent.
    pub fn new(name: impl Into<String>, controller: Arc<Controller>) -> Arc<MasterNode> {
        let node = Arc::new(MasterNode {
            name: name.into(),
            controller,
            subscribers: Mutex::new(HashMap::new()),
            cache: Mutex::new(BTreeMap::new()),
            buffer: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        });
        node.controller
            .set_parent(Parent::Master(Arc::downgrade(&node)));
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Subscribes slaves to this master: installs the lookup entries, sets
    /// each slave's back-reference and seeds the field cache with every
    /// subscribed field at the uninitialized sentinel.
    ///
    /// Call after the slaves' fields are initialized, otherwise there is
    /// nothing to seed.
    pub fn subscribe(master: &Arc<MasterNode>, slaves: impl IntoIterator<Item = Arc<SlaveNode>>) {
        for slave in slaves {
            slave.set_master(Arc::downgrade(master));
            {
                let mut cache = master.cache.lock();
                for key in slave.controller().qualified_field_names() {
                    cache.entry(key).or_insert_with(|| UNINITIALIZED_VALUE.to_owned());
                }
            }
            tracing::info!(
                master = %master.name,
                slave = %slave.name(),
                "subscribed slave node"
            );
            master
                .subscribers
                .lock()
                .insert(slave.name().to_owned(), slave);
        }
    }

    pub fn subscriber(&self, node: &str) -> Option<Arc<SlaveNode>> {
        self.subscribers.lock().get(node).cloned()
    }

    /// Ingests published packets from `sender`. The sender's task pays the
    /// uplink delay out, the cache and buffer are updated in one critical
    /// section, then the sender pays the acknowledgement leg back. Once
    /// this returns, a cache read anywhere observes the new values.
    pub(crate) async fn update(&self, sender: &SlaveNode, packets: Vec<DataPacket>) {
        let link = sender.link();
        let clock = self.controller.clock();
        let total: u64 = packets.iter().map(DataPacket::size_bytes).sum();
        let count = packets.len();
        clock.wait_for(link.one_way(total)).await;
        {
            let mut cache = self.cache.lock();
            let mut buffer = self.buffer.lock();
            for packet in packets {
                cache.insert(packet.cache_key(), packet.value().to_owned());
                buffer.push(packet);
            }
        }
        self.export_state(format!("Received ({count}) packets from [{}]", sender.name()));
        clock.wait_for(link.half_rtt()).await;
    }

    /// Reads a field from a subscribed node, paying the remote-call delay.
    /// An unknown node name fails without blocking.
    pub async fn get_field_from(&self, node: &str, device: &str, field: &str) -> ExecutionResult {
        let Some(slave) = self.subscriber(node) else {
            self.export_state(format!(
                "[FAILURE] GET {node}/{device}.{field}: unknown node"
            ));
            return ExecutionResult::failed();
        };
        self.export_state(format!("Requesting {device}.{field} from [{node}]"));
        let result = slave.get_field(device, field).await;
        self.export_state(format!(
            "[{}] GET {node}/{device}.{field} -> {}",
            success_label(&result),
            result.value().unwrap_or("absent")
        ));
        result
    }

    /// Writes a field in a subscribed node, paying the remote-call delay.
    pub async fn set_field_in(
        &self,
        node: &str,
        device: &str,
        field: &str,
        value: &str,
    ) -> ExecutionResult {
        let Some(slave) = self.subscriber(node) else {
            self.export_state(format!(
                "[FAILURE] SET {node}/{device}.{field}: unknown node"
            ));
            return ExecutionResult::failed();
        };
        self.export_state(format!("Writing {device}.{field} = {value} in [{node}]"));
        let result = slave.set_field(device, field, value).await;
        self.export_state(format!(
            "[{}] SET {node}/{device}.{field} = {value}",
            success_label(&result)
        ));
        result
    }

    /// Flips a switch in a subscribed node, paying the remote-call delay.
    pub async fn update_switch_in(
        &self,
        node: &str,
        device: &str,
        position: &str,
        state: &str,
    ) -> ExecutionResult {
        let Some(slave) = self.subscriber(node) else {
            self.export_state(format!(
                "[FAILURE] SWITCH {node}/{device}[{position}]: unknown node"
            ));
            return ExecutionResult::failed();
        };
        self.export_state(format!(
            "Switching {device}[{position}] -> {state} in [{node}]"
        ));
        let result = slave.update_switch(device, position, state).await;
        self.export_state(format!(
            "[{}] SWITCH {node}/{device}[{position}] -> {state}",
            success_label(&result)
        ));
        result
    }

    /// Decides a badge scan sent up from `gate`. The badge travels up at
    /// the gate's link rate, lands in the buffer and the cache (the cache
    /// shows the last ID seen at the gate), and the decision travels back.
    pub async fn is_permitted_to_enter(&self, gate: &SlaveNode, badge: DataPacket) -> bool {
        let link = gate.link();
        let clock = self.controller.clock();
        let id = badge.value().to_owned();
        clock.wait_for(link.one_way(badge.size_bytes())).await;
        {
            let mut cache = self.cache.lock();
            let mut buffer = self.buffer.lock();
            cache.insert(badge.cache_key(), id.clone());
            buffer.push(badge);
        }
        let permitted = self.controller.is_permitted_to_enter(&id);
        self.export_state(format!(
            "[{}] entry check for [{id}] at [{}]",
            if permitted { "PERMITTED" } else { "DENIED" },
            gate.name()
        ));
        clock.wait_for(link.half_rtt()).await;
        permitted
    }

    /// Last cached value for a `<device>_<field>` key.
    pub fn current_value(&self, key: &str) -> Option<String> {
        self.cache.lock().get(key).cloned()
    }

    /// Snapshot of the staged uplink packets, in arrival order.
    pub fn buffered_packets(&self) -> Vec<DataPacket> {
        self.buffer.lock().clone()
    }

    /// Drains the staged uplink packets, returning exactly the packets
    /// present at drain time.
    pub fn clear_buffered_packets(&self) -> Vec<DataPacket> {
        let drained = std::mem::take(&mut *self.buffer.lock());
        if !drained.is_empty() {
            self.export_state(format!("Drained ({}) buffered packets", drained.len()));
        }
        drained
    }

    /// Snapshot of the bulk inbox; with `consume` the inbox is drained in
    /// the same critical section, so nothing arriving concurrently is lost
    /// or read twice.
    pub fn received_bulk_packets(&self, consume: bool) -> Vec<BulkDataPacket> {
        let mut inbox = self.inbox.lock();
        if consume {
            std::mem::take(&mut *inbox)
        } else {
            inbox.clone()
        }
    }

    /// Stores a bulk packet delivered by the gateway mesh. The hops already
    /// paid the transfer delay, so storage is immediate.
    pub fn receive_forwarded(&self, sender: &str, packet: BulkDataPacket) {
        self.export_state(format!(
            "Stored bulk packet from [{sender}] ({} packets, {} bytes)",
            packet.len(),
            packet.total_size_bytes()
        ));
        self.inbox.lock().push(packet);
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

    /// Exports a state row carrying the current field-cache snapshot.
    /// Subscription seeds the cache, so the column set is complete before
    /// the first row is written.
    fn export_state(&self, event: impl Into<String>) {
        let fields: Vec<(String, String)> = self
            .cache
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.controller.events().record_with_fields(
            self.controller.clock().now(),
            &self.name,
            event,
            fields,
        );
    }
}

fn success_label(result: &ExecutionResult) -> &'static str {
    if result.is_success() {
        "SUCCESS"
    } else {
        "FAILURE"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::SimClock;
    use crate::eventlog::{CapturingSink, EventLog};
    use crate::link::LinkModel;

    fn pair() -> (Arc<MasterNode>, Arc<SlaveNode>, SimClock) {
        let clock = SimClock::new(1.0);
        let events = EventLog::noop();
        let step = Duration::from_millis(100);
        let master_ctl = Arc::new(Controller::new("master_ctl", clock.clone(), events.clone(), step));
        let slave_ctl = Arc::new(Controller::new("slave_ctl", clock.clone(), events.clone(), step));
        let master = MasterNode::new("master", master_ctl);
        let slave = SlaveNode::new("slave", slave_ctl, LinkModel::new(10, 1000));
        MasterNode::subscribe(&master, [slave.clone()]);
        (master, slave, clock)
    }

    fn packet(clock: &SimClock, field: &str, value: &str) -> DataPacket {
        DataPacket::new("sensor", field, value, 4, clock.now())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn update_fills_cache_and_buffer_in_arrival_order() {
        let (master, slave, clock) = pair();
        master
            .update(
                &slave,
                vec![packet(&clock, "Temperature", "21"), packet(&clock, "Dust", "3")],
            )
            .await;
        master.update(&slave, vec![packet(&clock, "Temperature", "24")]).await;

        assert_eq!(master.current_value("sensor_Temperature").as_deref(), Some("24"));
        assert_eq!(master.current_value("sensor_Dust").as_deref(), Some("3"));
        let buffered: Vec<_> = master
            .buffered_packets()
            .iter()
            .map(|p| p.value().to_owned())
            .collect();
        assert_eq!(buffered, ["21", "3", "24"]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn draining_returns_the_snapshot_and_empties_the_buffer() {
        let (master, slave, clock) = pair();
        master
            .update(
                &slave,
                vec![packet(&clock, "A", "1"), packet(&clock, "B", "2")],
            )
            .await;

        let drained = master.clear_buffered_packets();
        assert_eq!(drained.len(), 2);
        assert!(master.buffered_packets().is_empty());
        assert!(master.clear_buffered_packets().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unknown_nodes_fail_without_blocking() {
        let (master, _slave, clock) = pair();
        let before = clock.now();

        let read = master.get_field_from("ghost", "sensor", "Temperature").await;
        let write = master.set_field_in("ghost", "sensor", "Temperature", "1").await;
        let flip = master.update_switch_in("ghost", "relay", "0", "on").await;

        assert!(!read.is_success() && read.packet().is_none());
        assert!(!write.is_success());
        assert!(!flip.is_success());
        assert_eq!(clock.now().as_millis(), before.as_millis());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn bulk_inbox_peek_keeps_and_consume_drains() {
        let (master, _slave, clock) = pair();
        let mut bulk = BulkDataPacket::new("Zone2", clock.now());
        bulk.add_packet(packet(&clock, "Temperature", "19"));
        master.receive_forwarded("Zone2", bulk);

        assert_eq!(master.received_bulk_packets(false).len(), 1);
        assert_eq!(master.received_bulk_packets(false).len(), 1);
        let consumed = master.received_bulk_packets(true);
        assert_eq!(consumed.len(), 1);
        assert!(master.received_bulk_packets(false).is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn master_rows_carry_the_field_cache_snapshot() {
        let clock = SimClock::new(1.0);
        let sink = Arc::new(CapturingSink::default());
        let events = EventLog::new(sink.clone());
        let step = Duration::from_millis(100);
        let master_ctl = Arc::new(Controller::new("master_ctl", clock.clone(), events.clone(), step));
        let slave_ctl = Arc::new(Controller::new("slave_ctl", clock.clone(), events, step));
        let master = MasterNode::new("master", master_ctl);
        let slave = SlaveNode::new("slave", slave_ctl, LinkModel::new(10, 1000));
        MasterNode::subscribe(&master, [slave.clone()]);

        master
            .update(&slave, vec![packet(&clock, "Temperature", "21")])
            .await;
        master.clear_buffered_packets();
        assert_eq!(master.current_value("sensor_Temperature").as_deref(), Some("21"));

        let rows: Vec<_> = sink
            .records()
            .into_iter()
            .filter(|record| record.object == "master")
            .collect();
        assert_eq!(rows.len(), 2, "expected the received and drained rows");
        for record in &rows {
            assert!(
                record
                    .fields
                    .contains(&("sensor_Temperature".to_owned(), "21".to_owned())),
                "row {:?} is missing the cache snapshot",
                record.event
            );
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn subscribing_seeds_the_cache_with_the_sentinel() {
        let clock = SimClock::new(1.0);
        let events = EventLog::noop();
        let step = Duration::from_millis(100);
        let slave_ctl = Arc::new(Controller::new("slave_ctl", clock.clone(), events.clone(), step));
        slave_ctl.connect([Arc::new(crate::device::LowPowerDevice::with_playback(
            "sensor",
            4,
            vec!["Temperature".to_owned()],
            Vec::new(),
            clock.clone(),
            events.clone(),
        )) as Arc<dyn crate::device::Device>]);
        slave_ctl.init_fields().unwrap();

        let master_ctl = Arc::new(Controller::new("master_ctl", clock.clone(), events, step));
        let master = MasterNode::new("master", master_ctl);
        let slave = SlaveNode::new("slave", slave_ctl, LinkModel::new(10, 1000));
        MasterNode::subscribe(&master, [slave]);

        assert_eq!(
            master.current_value("sensor_Temperature").as_deref(),
            Some(UNINITIALIZED_VALUE)
        );
    }
}
