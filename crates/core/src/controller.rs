//! Microcontroller actor driving devices and network calls.
//!
//! A [`Controller`] owns the devices of one node and is that node's only
//! source of activity. Once started it runs on its own tokio task: every
//! tick it drives device sampling, runs the one-shot setup routine on the
//! first pass, runs the steady-state loop routine, then sleeps one step on
//! the simulated clock. Devices, node wrappers and gateways are passive and
//! only advance when the owning controller calls into them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::clock::SimClock;
use crate::device::{Command, Device, InputError};
use crate::eventlog::EventLog;
use crate::gateway::Gateway;
use crate::node::{MasterNode, SlaveNode};
use crate::packet::{BulkDataPacket, DataPacket, ExecutionResult};

/// Algorithm callback driven by a controller tick.
///
/// Implemented for any `Fn(Arc<Controller>) -> impl Future` closure, so
/// wiring code can hand plain async closures to [`Controller::with_setup`]
/// and [`Controller::with_main`].
pub trait Routine: Send + Sync + 'static {
    fn run(&self, controller: Arc<Controller>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Routine for F
where
    F: Fn(Arc<Controller>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn run(&self, controller: Arc<Controller>) -> BoxFuture<'static, ()> {
        Box::pin((self)(controller))
    }
}

fn idle() -> Arc<dyn Routine> {
    Arc::new(|_: Arc<Controller>| async {})
}

/// Lifecycle of a controller task.
///
/// `PendingSetup` is only entered when a setup routine was supplied; it
/// collapses to `Running` after the first tick. A terminated controller
/// cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Created = 0,
    PendingSetup = 1,
    Running = 2,
    Terminated = 3,
}

impl RunState {
    fn from_u8(raw: u8) -> RunState {
        match raw {
            0 => RunState::Created,
            1 => RunState::PendingSetup,
            2 => RunState::Running,
            _ => RunState::Terminated,
        }
    }
}

/// The parent role of a controller's owning node.
pub(crate) enum Parent {
    Slave(Weak<SlaveNode>),
    Master(Weak<MasterNode>),
}

#[derive(Default)]
struct FieldNames {
    local: Vec<String>,
    global: Vec<String>,
}

pub struct Controller {
    name: String,
    clock: SimClock,
    events: EventLog,
    step: Duration,
    devices: Mutex<Vec<Arc<dyn Device>>>,
    fields: Mutex<FieldNames>,
    gateway: OnceLock<Arc<Gateway>>,
    parent: OnceLock<Parent>,
    permitted: Mutex<HashSet<String>>,
    state: AtomicU8,
    setup: Mutex<Option<Arc<dyn Routine>>>,
    main: Arc<dyn Routine>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Creates a controller with no setup routine and an idle loop. `step`
    /// is the simulated pause between ticks.
    pub fn new(name: impl Into<String>, clock: SimClock, events: EventLog, step: Duration) -> Self {
        Controller {
            name: name.into(),
            clock,
            events,
            step,
            devices: Mutex::new(Vec::new()),
            fields: Mutex::new(FieldNames::default()),
            gateway: OnceLock::new(),
            parent: OnceLock::new(),
            permitted: Mutex::new(HashSet::new()),
            state: AtomicU8::new(RunState::Created as u8),
            setup: Mutex::new(None),
            main: idle(),
            task: Mutex::new(None),
        }
    }

    /// Installs the routine run exactly once, on the first tick.
    pub fn with_setup(self, routine: impl Routine) -> Self {
        *self.setup.lock() = Some(Arc::new(routine));
        self
    }

    /// Installs the steady-state routine run on every tick.
    pub fn with_main(mut self, routine: impl Routine) -> Self {
        self.main = Arc::new(routine);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Registers devices. Name uniqueness is not validated; when two devices
    /// share a name the last registered one wins at dispatch time.
    pub fn connect(&self, devices: impl IntoIterator<Item = Arc<dyn Device>>) {
        let mut connected = self.devices.lock();
        for device in devices {
            tracing::debug!(controller = %self.name, device = %device.name(), "connected device");
            connected.push(device);
        }
    }

    /// Attaches the zone gateway and back-links it to this controller.
    pub fn connect_gateway(controller: &Arc<Controller>, gateway: Arc<Gateway>) {
        gateway.set_parent(Arc::downgrade(controller));
        if controller.gateway.set(gateway).is_err() {
            tracing::warn!(controller = %controller.name, "gateway already attached");
        }
    }

    pub(crate) fn set_parent(&self, parent: Parent) {
        if self.parent.set(parent).is_err() {
            tracing::warn!(controller = %self.name, "parent node already wired");
        }
    }

    /// Loads every connected device's initial state and records its field
    /// names, both locally qualified (`<field>`) and globally qualified
    /// (`<device>_<field>`).
    pub fn init_fields(&self) -> Result<(), InputError> {
        let devices = self.device_snapshot();
        let mut loaded = Vec::new();
        for device in &devices {
            device.init_fields()?;
            for field in device.field_names() {
                loaded.push((device.name().to_owned(), field));
            }
        }
        let mut names = self.fields.lock();
        for (device, field) in loaded {
            names.global.push(format!("{device}_{field}"));
            names.local.push(field);
        }
        tracing::info!(
            controller = %self.name,
            fields = names.local.len(),
            "initialized device fields"
        );
        Ok(())
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.lock().local.clone()
    }

    pub fn qualified_field_names(&self) -> Vec<String> {
        self.fields.lock().global.clone()
    }

    pub fn slave_parent(&self) -> Option<Arc<SlaveNode>> {
        match self.parent.get() {
            Some(Parent::Slave(node)) => node.upgrade(),
            _ => None,
        }
    }

    pub fn master_parent(&self) -> Option<Arc<MasterNode>> {
        match self.parent.get() {
            Some(Parent::Master(node)) => node.upgrade(),
            _ => None,
        }
    }

    pub fn gateway(&self) -> Option<Arc<Gateway>> {
        self.gateway.get().cloned()
    }

    /// Reads one field from a connected device.
    pub fn get_field(&self, device: &str, field: &str) -> ExecutionResult {
        let Some(target) = self.find_device(device) else {
            self.export_state(format!("[FAILURE] GET {device}.{field}: unknown device"));
            return ExecutionResult::failed();
        };
        let result = target.execute(Command::Get {
            field: field.to_owned(),
        });
        tracing::debug!(
            controller = %self.name,
            device,
            field,
            success = result.is_success(),
            "dispatched GET"
        );
        self.export_state(format!(
            "[{}] GET {device}.{field} -> {}",
            outcome_label(&result),
            result.value().unwrap_or("absent")
        ));
        result
    }

    /// Writes one field on a connected device. The result echoes the
    /// requested value; only the success flag says whether it was applied.
    pub fn set_field(&self, device: &str, field: &str, value: &str) -> ExecutionResult {
        let Some(target) = self.find_device(device) else {
            self.export_state(format!(
                "[FAILURE] SET {device}.{field} = {value}: unknown device"
            ));
            return ExecutionResult::failed();
        };
        let result = target.execute(Command::Set {
            field: field.to_owned(),
            value: value.to_owned(),
        });
        tracing::debug!(
            controller = %self.name,
            device,
            field,
            value,
            success = result.is_success(),
            "dispatched SET"
        );
        self.export_state(format!(
            "[{}] SET {device}.{field} = {value}",
            outcome_label(&result)
        ));
        result
    }

    /// Flips a switch bank position on a connected device. Position and
    /// state arrive as strings from the remote call path; a malformed
    /// argument is a command failure, not a panic.
    pub fn update_switch(&self, device: &str, position: &str, state: &str) -> ExecutionResult {
        let (Ok(position_index), Some(state_flag)) =
            (position.trim().parse::<usize>(), parse_switch_state(state))
        else {
            self.export_state(format!(
                "[FAILURE] SWITCH {device}[{position}] -> {state}: malformed arguments"
            ));
            return ExecutionResult::failed();
        };
        let Some(target) = self.find_device(device) else {
            self.export_state(format!(
                "[FAILURE] SWITCH {device}[{position_index}]: unknown device"
            ));
            return ExecutionResult::failed();
        };
        let result = target.execute(Command::Switch {
            position: position_index,
            state: state_flag,
        });
        tracing::debug!(
            controller = %self.name,
            device,
            position = position_index,
            state = state_flag,
            success = result.is_success(),
            "dispatched SWITCH"
        );
        self.export_state(format!(
            "[{}] SWITCH {device}[{position_index}] -> {}",
            outcome_label(&result),
            if state_flag { "on" } else { "off" }
        ));
        result
    }

    /// Publishes packets to the zone master through the owning slave node,
    /// paying the uplink delay on this controller's task.
    pub async fn publish(&self, packets: Vec<DataPacket>) -> bool {
        match self.slave_parent() {
            Some(slave) => {
                slave.publish(packets).await;
                true
            }
            None => {
                tracing::warn!(controller = %self.name, "publish without a slave parent");
                self.export_state("[FAILURE] publish: no slave parent");
                false
            }
        }
    }

    /// Forwards a bulk packet through the attached gateway along `route`,
    /// prefixing the local gateway as the first hop.
    pub async fn forward(&self, packet: BulkDataPacket, route: &[String]) -> bool {
        let Some(gateway) = self.gateway.get() else {
            self.export_state("[FAILURE] forward: no gateway attached");
            return false;
        };
        let mut hops = Vec::with_capacity(route.len() + 1);
        hops.push(gateway.name().to_owned());
        hops.extend(route.iter().cloned());
        self.export_state(format!(
            "Forwarding bulk packet ({} packets, {} bytes) via [{}]",
            packet.len(),
            packet.total_size_bytes(),
            hops.join(" -> ")
        ));
        let delivered = gateway.forward(&self.name, &self.name, packet, &hops, 0).await;
        self.export_state(format!(
            "[{}] forward via [{}]",
            if delivered { "SUCCESS" } else { "FAILURE" },
            hops.join(" -> ")
        ));
        delivered
    }

    /// Forwards a bulk packet to the named zones; zone gateways carry their
    /// zone's name, so the zone list is the route.
    pub async fn forward_to_zones(&self, packet: BulkDataPacket, zones: &[String]) -> bool {
        self.forward(packet, zones).await
    }

    /// Terminal delivery hook invoked by the local gateway. The packet lands
    /// in the master parent's inbox; a controller without a master parent
    /// logs and drops it.
    pub fn receive_bulk_packet(&self, source: &str, previous: &str, packet: BulkDataPacket) {
        self.export_state(format!(
            "Received bulk packet ({} packets, {} bytes) from [{source}] via [{previous}]",
            packet.len(),
            packet.total_size_bytes()
        ));
        match self.master_parent() {
            Some(master) => master.receive_forwarded(source, packet),
            None => {
                tracing::warn!(
                    controller = %self.name,
                    source,
                    "no master parent to store the bulk packet, dropping"
                );
            }
        }
    }

    /// Reads the master parent's field cache; `None` under a slave parent.
    pub fn current_value(&self, device: &str, field: &str) -> Option<String> {
        let master = self.master_parent()?;
        master.current_value(&format!("{device}_{field}"))
    }

    /// Snapshot of the master parent's uplink buffer, without draining it.
    pub fn buffered_packets(&self) -> Vec<DataPacket> {
        self.master_parent()
            .map(|master| master.buffered_packets())
            .unwrap_or_default()
    }

    /// Drains the master parent's uplink buffer, returning the drained
    /// packets.
    pub fn clear_buffered_packets(&self) -> Vec<DataPacket> {
        self.master_parent()
            .map(|master| master.clear_buffered_packets())
            .unwrap_or_default()
    }

    /// Snapshot of the master parent's bulk inbox; with `consume` the inbox
    /// is drained in the same critical section.
    pub fn received_bulk_packets(&self, consume: bool) -> Vec<BulkDataPacket> {
        self.master_parent()
            .map(|master| master.received_bulk_packets(consume))
            .unwrap_or_default()
    }

    pub fn is_permitted_to_enter(&self, id: &str) -> bool {
        self.permitted.lock().contains(id)
    }

    pub fn add_permitted_id(&self, id: impl Into<String>) {
        let id = id.into();
        self.export_state(format!("Permitted ID added [{id}]"));
        self.permitted.lock().insert(id);
    }

    pub fn remove_permitted_id(&self, id: &str) -> bool {
        let removed = self.permitted.lock().remove(id);
        if removed {
            self.export_state(format!("Permitted ID removed [{id}]"));
        }
        removed
    }

    pub fn export_state(&self, event: impl Into<String>) {
        self.events.record(self.clock.now(), &self.name, event);
    }

    /// Spawns the controller task. Idempotent; a terminated controller
    /// stays terminated.
    pub fn start(self: Arc<Self>) {
        let target = if self.setup.lock().is_some() {
            RunState::PendingSetup
        } else {
            RunState::Running
        };
        if self
            .state
            .compare_exchange(
                RunState::Created as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::warn!(
                controller = %self.name,
                state = ?self.run_state(),
                "start ignored"
            );
            return;
        }
        self.export_state("Started");
        for device in self.device_snapshot() {
            device.start();
        }
        let controller = self.clone();
        let task = tokio::spawn(async move {
            controller.run_loop().await;
        });
        *self.task.lock() = Some(task);
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!(controller = %self.name, "run loop started");
        while self.run_state() != RunState::Terminated {
            self.clone().tick().await;
            self.clock.wait_for(self.step).await;
        }
        tracing::debug!(controller = %self.name, "run loop stopped");
    }

    /// One execution step: device sampling, setup on the first pass, then
    /// the loop routine. The inter-tick wait lives in the run loop.
    pub async fn tick(self: Arc<Self>) {
        if self.run_state() == RunState::Terminated {
            return;
        }
        let devices = self.device_snapshot();
        for device in devices {
            device.tick();
        }
        let setup = self.setup.lock().take();
        if let Some(setup) = setup {
            tracing::debug!(controller = %self.name, "running setup routine");
            setup.run(self.clone()).await;
            let _ = self.state.compare_exchange(
                RunState::PendingSetup as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        let main = self.main.clone();
        main.run(self.clone()).await;
    }

    /// Stops the controller after the current tick and cascades to every
    /// connected device and the gateway. Idempotent.
    pub fn terminate(&self) {
        let previous = self.state.swap(RunState::Terminated as u8, Ordering::AcqRel);
        if previous == RunState::Terminated as u8 {
            return;
        }
        self.export_state("Terminated");
        for device in self.device_snapshot() {
            device.terminate();
        }
        if let Some(gateway) = self.gateway.get() {
            gateway.terminate();
        }
    }

    /// Waits for the controller task to finish its last tick.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(controller = %self.name, %error, "controller task failed");
            }
        }
    }

    fn find_device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .iter()
            .rev()
            .find(|device| device.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    fn device_snapshot(&self) -> Vec<Arc<dyn Device>> {
        self.devices.lock().clone()
    }
}

fn outcome_label(result: &ExecutionResult) -> &'static str {
    if result.is_success() {
        "SUCCESS"
    } else {
        "FAILURE"
    }
}

fn parse_switch_state(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("on") || raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("off") || raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HighPowerDevice, LowPowerDevice, Relay};

    fn playback(
        name: &str,
        field: &str,
        clock: &SimClock,
        events: &EventLog,
    ) -> Arc<LowPowerDevice> {
        Arc::new(LowPowerDevice::with_playback(
            name,
            4,
            vec![field.to_owned()],
            Vec::new(),
            clock.clone(),
            events.clone(),
        ))
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn dispatch_is_case_insensitive_and_the_last_registered_name_wins() {
        let clock = SimClock::new(1.0);
        let events = EventLog::noop();
        let controller = Arc::new(Controller::new(
            "ctl",
            clock.clone(),
            events.clone(),
            Duration::from_millis(100),
        ));
        controller.connect([
            playback("Sensor", "Old", &clock, &events) as Arc<dyn Device>,
            playback("sensor", "New", &clock, &events) as Arc<dyn Device>,
        ]);

        assert!(controller.set_field("SENSOR", "New", "7").is_success());
        assert_eq!(controller.get_field("SeNsOr", "New").value(), Some("7"));
        assert!(
            !controller.get_field("sensor", "Old").is_success(),
            "the earlier registration is shadowed"
        );
        let missing = controller.get_field("nobody", "New");
        assert!(!missing.is_success());
        assert!(missing.packet().is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn malformed_switch_arguments_fail_without_reaching_the_device() {
        let clock = SimClock::new(1.0);
        let events = EventLog::noop();
        let controller = Arc::new(Controller::new(
            "ctl",
            clock.clone(),
            events.clone(),
            Duration::from_millis(100),
        ));
        let relay = Arc::new(Relay::new("relay", 1, clock.clone(), events.clone()));
        let motor = Arc::new(HighPowerDevice::new("motor", clock.clone(), events.clone()));
        relay.connect_to(motor.clone(), 0);
        controller.connect([relay as Arc<dyn Device>]);

        assert!(!controller.update_switch("relay", "first", "on").is_success());
        assert!(!controller.update_switch("relay", "0", "sideways").is_success());
        assert!(!motor.is_powered());

        assert!(controller.update_switch("relay", " 0 ", "ON").is_success());
        assert!(motor.is_powered());
        assert!(controller.update_switch("relay", "0", "False").is_success());
        assert!(!motor.is_powered());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn permitted_ids_are_a_plain_membership_set() {
        let controller = Controller::new(
            "ctl",
            SimClock::new(1.0),
            EventLog::noop(),
            Duration::from_millis(100),
        );
        controller.add_permitted_id("Omar");
        controller.add_permitted_id("Farrag");
        assert!(controller.is_permitted_to_enter("Omar"));
        assert!(!controller.is_permitted_to_enter("Unknown"));
        assert!(controller.remove_permitted_id("Omar"));
        assert!(!controller.remove_permitted_id("Omar"));
        assert!(!controller.is_permitted_to_enter("Omar"));
        assert!(controller.is_permitted_to_enter("Farrag"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn publish_without_a_slave_parent_is_rejected() {
        let controller = Arc::new(Controller::new(
            "ctl",
            SimClock::new(1.0),
            EventLog::noop(),
            Duration::from_millis(100),
        ));
        assert!(!controller.publish(Vec::new()).await);
    }

    #[test]
    fn switch_state_parsing_accepts_on_off_and_booleans() {
        assert_eq!(parse_switch_state("on"), Some(true));
        assert_eq!(parse_switch_state(" TRUE "), Some(true));
        assert_eq!(parse_switch_state("Off"), Some(false));
        assert_eq!(parse_switch_state("false"), Some(false));
        assert_eq!(parse_switch_state("1"), None);
        assert_eq!(parse_switch_state(""), None);
    }
}
