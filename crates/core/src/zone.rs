//! Zone composition: wiring controllers, nodes and gateways into the
//! clusters the site simulation runs.
//!
//! A slave zone carries the worker-facing nodes (badge gate, actuation
//! bank, alarm, speaker, any number of sensors) around one master node
//! whose controller owns the zone camera and runs the aggregation loop. A
//! master zone is the central sink: its controller drains the bulk inbox
//! into the site database. Builders perform all wiring up front; once a
//! zone is started its topology never changes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::clock::{SimClock, Timestamp};
use crate::controller::Controller;
use crate::device::{
    Device, HighPowerDevice, InputError, LowPowerDevice, Relay, UNINITIALIZED_VALUE,
};
use crate::eventlog::EventLog;
use crate::gateway::Gateway;
use crate::link::LinkModel;
use crate::node::{MasterNode, SlaveNode};
use crate::packet::{BulkDataPacket, DataPacket};

const BADGE_FIELD: &str = "ID";
const BADGE_FIELD_BYTES: u64 = 12;
const MESSAGE_FIELD: &str = "Played Message";
const MESSAGE_FIELD_BYTES: u64 = 64;
const CAMERA_FIELD: &str = "Frame";
const CAMERA_PLAYBACK_FRAMES: usize = 8;
const ACTUATION_POSITIONS: usize = 4;

/// Link and scheduling parameters shared by every node a builder creates.
#[derive(Debug, Clone)]
pub struct ZoneParams {
    /// Simulated pause between controller ticks.
    pub step: Duration,
    /// RTT of the intra-zone uplink, in simulated milliseconds.
    pub rtt_to_master_ms: u64,
    /// Intra-zone (BLE) transmission rate in kbps.
    pub ble_rate_kbps: u64,
    /// Inter-zone (Wi-Fi) transmission rate in kbps.
    pub wifi_rate_kbps: u64,
    /// Buffered packet count above which the master aggregates.
    pub buffer_threshold: usize,
    /// Size of one camera frame observation in bytes.
    pub camera_frame_bytes: u64,
    /// Directory holding `<device>_input.csv` playback files.
    pub input_dir: PathBuf,
    /// Gateway hop list aggregates travel along, excluding this zone.
    pub forward_to: Vec<String>,
}

/// One extra playback sensor node in a slave zone.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Node suffix; the device reads `<zone>_<name>_sensor_input.csv`.
    pub name: String,
    /// Byte size of every observation the sensor produces.
    pub field_size: u64,
}

/// A wired cluster of one master node, its gateway and its slave nodes.
pub struct Zone {
    name: String,
    master: Arc<MasterNode>,
    slaves: Vec<Arc<SlaveNode>>,
    gateway: Arc<Gateway>,
}

impl Zone {
    /// Builds a worker-facing zone: gate, actuation, alarm and speaker
    /// nodes plus one node per sensor spec, subscribed to a master whose
    /// controller owns the zone camera and aggregates per the configured
    /// threshold.
    pub fn build_slave_zone(
        name: &str,
        sensors: &[SensorSpec],
        params: &ZoneParams,
        clock: &SimClock,
        events: &EventLog,
    ) -> Zone {
        let link = LinkModel::new(params.rtt_to_master_ms, params.ble_rate_kbps);
        let mut slaves = Vec::new();

        slaves.push(SlaveNode::new(
            format!("{name}_gate"),
            build_gate_controller(name, params, clock, events),
            link,
        ));
        slaves.push(SlaveNode::new(
            format!("{name}_actuation"),
            build_actuation_controller(name, params, clock, events),
            link,
        ));
        slaves.push(SlaveNode::new(
            format!("{name}_alarm"),
            build_alarm_controller(name, params, clock, events),
            link,
        ));
        slaves.push(SlaveNode::new(
            format!("{name}_speaker"),
            build_speaker_controller(name, params, clock, events),
            link,
        ));
        for sensor in sensors {
            slaves.push(SlaveNode::new(
                format!("{name}_{}", sensor.name),
                build_sensor_controller(name, sensor, params, clock, events),
                link,
            ));
        }

        let master_ctl = build_zone_master_controller(name, params, clock, events);
        let gateway = Gateway::new(name, params.wifi_rate_kbps, clock.clone(), events.clone());
        Controller::connect_gateway(&master_ctl, gateway.clone());
        let master = MasterNode::new(format!("{name}_master"), master_ctl);

        Zone {
            name: name.to_owned(),
            master,
            slaves,
            gateway,
        }
    }

    /// Builds the central zone: a master whose controller consumes the
    /// bulk inbox into `database`.
    pub fn build_master_zone(
        name: &str,
        database: Arc<SiteDatabase>,
        params: &ZoneParams,
        clock: &SimClock,
        events: &EventLog,
    ) -> Zone {
        let writer = move |controller: Arc<Controller>| {
            let database = database.clone();
            async move {
                for bulk in controller.received_bulk_packets(true) {
                    let arrived = controller.clock().now();
                    if let Err(error) = database.append_bulk(arrived, &bulk).await {
                        tracing::error!(%error, "failed appending to the site database");
                    }
                }
            }
        };
        let master_ctl = Arc::new(
            Controller::new(
                format!("{name}_master_ctl"),
                clock.clone(),
                events.clone(),
                params.step,
            )
            .with_main(writer),
        );
        let gateway = Gateway::new(name, params.wifi_rate_kbps, clock.clone(), events.clone());
        Controller::connect_gateway(&master_ctl, gateway.clone());
        let master = MasterNode::new(format!("{name}_master"), master_ctl);

        Zone {
            name: name.to_owned(),
            master,
            slaves: Vec::new(),
            gateway,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> &Arc<MasterNode> {
        &self.master
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn slaves(&self) -> &[Arc<SlaveNode>] {
        &self.slaves
    }

    pub fn slave(&self, name: &str) -> Option<&Arc<SlaveNode>> {
        self.slaves.iter().find(|slave| slave.name() == name)
    }

    /// Adds a gateway edge between this zone and `other`.
    pub fn connect_to(&self, other: &Zone, rtt_millis: u64) {
        Gateway::connect(&self.gateway, &other.gateway, rtt_millis);
    }

    /// Authorizes a badge ID at this zone's gates.
    pub fn add_permitted_id(&self, id: impl Into<String>) {
        self.master.controller().add_permitted_id(id);
    }

    /// Loads every device's initial state, then subscribes the slaves so
    /// the master's cache is seeded with the loaded field names.
    pub fn init_fields(&self) -> Result<(), InputError> {
        self.master.init_fields()?;
        for slave in &self.slaves {
            slave.init_fields()?;
        }
        MasterNode::subscribe(&self.master, self.slaves.iter().cloned());
        Ok(())
    }

    pub fn start(&self) {
        for slave in &self.slaves {
            slave.start();
        }
        self.master.start();
    }

    pub fn terminate(&self) {
        for slave in &self.slaves {
            slave.terminate();
        }
        self.master.terminate();
    }

    pub async fn join(&self) {
        for slave in &self.slaves {
            slave.join().await;
        }
        self.master.join().await;
    }
}

/// Badge gate: a scanner playing back IDs, a one-position relay driving
/// the gate motor, and a loop that asks the zone master for an entry
/// decision on every scan.
fn build_gate_controller(
    zone: &str,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let scanner = Arc::new(LowPowerDevice::from_input_file(
        format!("{zone}_gate_scanner"),
        BADGE_FIELD_BYTES,
        params.input_dir.join(format!("{zone}_gate_scanner_input.csv")),
        clock.clone(),
        events.clone(),
    ));
    let relay = Arc::new(Relay::new(
        format!("{zone}_gate_relay"),
        1,
        clock.clone(),
        events.clone(),
    ));
    let motor = Arc::new(HighPowerDevice::new(
        format!("{zone}_gate_motor"),
        clock.clone(),
        events.clone(),
    ));
    relay.connect_to(motor.clone(), 0);

    let scanner_name = scanner.name().to_owned();
    let relay_name = relay.name().to_owned();
    let controller = Arc::new(
        Controller::new(
            format!("{zone}_gate_ctl"),
            clock.clone(),
            events.clone(),
            params.step,
        )
        .with_main(move |controller: Arc<Controller>| {
            let scanner = scanner_name.clone();
            let relay = relay_name.clone();
            async move {
                let Some(badge) = controller.get_field(&scanner, BADGE_FIELD).into_packet() else {
                    return;
                };
                if badge.value() == UNINITIALIZED_VALUE {
                    return;
                }
                let Some(node) = controller.slave_parent() else {
                    return;
                };
                let permitted = node.is_permitted_to_enter(badge).await;
                controller.update_switch(&relay, "0", if permitted { "on" } else { "off" });
            }
        }),
    );
    controller.connect([scanner as Arc<dyn Device>, relay, motor]);
    controller
}

/// Actuation bank: a four-position relay wired to four motors. Passive;
/// positions are flipped from the master side.
fn build_actuation_controller(
    zone: &str,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let relay = Arc::new(Relay::new(
        format!("{zone}_actuation_relay"),
        ACTUATION_POSITIONS,
        clock.clone(),
        events.clone(),
    ));
    let mut devices: Vec<Arc<dyn Device>> = vec![relay.clone()];
    for position in 0..ACTUATION_POSITIONS {
        let motor = Arc::new(HighPowerDevice::new(
            format!("{zone}_actuation_motor{position}"),
            clock.clone(),
            events.clone(),
        ));
        relay.connect_to(motor.clone(), position);
        devices.push(motor);
    }
    let controller = Arc::new(Controller::new(
        format!("{zone}_actuation_ctl"),
        clock.clone(),
        events.clone(),
        params.step,
    ));
    controller.connect(devices);
    controller
}

/// Alarm: a one-position relay wired to a buzzer. Passive.
fn build_alarm_controller(
    zone: &str,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let relay = Arc::new(Relay::new(
        format!("{zone}_alarm_relay"),
        1,
        clock.clone(),
        events.clone(),
    ));
    let buzzer = Arc::new(HighPowerDevice::new(
        format!("{zone}_alarm_buzzer"),
        clock.clone(),
        events.clone(),
    ));
    relay.connect_to(buzzer.clone(), 0);
    let controller = Arc::new(Controller::new(
        format!("{zone}_alarm_ctl"),
        clock.clone(),
        events.clone(),
        params.step,
    ));
    controller.connect([relay as Arc<dyn Device>, buzzer]);
    controller
}

/// Speaker: one writable `Played Message` field, set from the master side.
fn build_speaker_controller(
    zone: &str,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let unit = Arc::new(LowPowerDevice::with_playback(
        format!("{zone}_speaker_unit"),
        MESSAGE_FIELD_BYTES,
        vec![MESSAGE_FIELD.to_owned()],
        Vec::new(),
        clock.clone(),
        events.clone(),
    ));
    let controller = Arc::new(Controller::new(
        format!("{zone}_speaker_ctl"),
        clock.clone(),
        events.clone(),
        params.step,
    ));
    controller.connect([unit as Arc<dyn Device>]);
    controller
}

/// Playback sensor publishing every field to the zone master on each tick.
fn build_sensor_controller(
    zone: &str,
    sensor: &SensorSpec,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let device_name = format!("{zone}_{}_sensor", sensor.name);
    let device = Arc::new(LowPowerDevice::from_input_file(
        device_name.clone(),
        sensor.field_size,
        params.input_dir.join(format!("{device_name}_input.csv")),
        clock.clone(),
        events.clone(),
    ));
    let controller = Arc::new(
        Controller::new(
            format!("{zone}_{}_ctl", sensor.name),
            clock.clone(),
            events.clone(),
            params.step,
        )
        .with_main(move |controller: Arc<Controller>| {
            let device = device_name.clone();
            async move {
                let mut packets = Vec::new();
                for field in controller.field_names() {
                    if let Some(packet) = controller.get_field(&device, &field).into_packet() {
                        packets.push(packet);
                    }
                }
                if packets.is_empty() {
                    return;
                }
                controller.publish(packets).await;
            }
        }),
    );
    controller.connect([device as Arc<dyn Device>]);
    controller
}

/// Zone master: owns the camera, announces over the zone speaker once at
/// setup, and aggregates the staged uplink packets into a bulk packet
/// (with the latest camera frame riding along) whenever the buffer grows
/// past the threshold.
fn build_zone_master_controller(
    zone: &str,
    params: &ZoneParams,
    clock: &SimClock,
    events: &EventLog,
) -> Arc<Controller> {
    let camera = Arc::new(LowPowerDevice::with_playback(
        format!("{zone}_camera"),
        params.camera_frame_bytes,
        vec![CAMERA_FIELD.to_owned()],
        (0..CAMERA_PLAYBACK_FRAMES)
            .map(|frame| vec![format!("frame-{frame:04}")])
            .collect(),
        clock.clone(),
        events.clone(),
    ));

    let speaker_node = format!("{zone}_speaker");
    let speaker_device = format!("{zone}_speaker_unit");
    let setup = move |controller: Arc<Controller>| {
        let node = speaker_node.clone();
        let device = speaker_device.clone();
        async move {
            let Some(master) = controller.master_parent() else {
                return;
            };
            master
                .set_field_in(&node, &device, MESSAGE_FIELD, "Zone online")
                .await;
        }
    };

    let bulk_source = format!("{zone}_master");
    let camera_name = format!("{zone}_camera");
    let threshold = params.buffer_threshold;
    let forward_to = params.forward_to.clone();
    let main = move |controller: Arc<Controller>| {
        let bulk_source = bulk_source.clone();
        let camera = camera_name.clone();
        let route = forward_to.clone();
        async move {
            if controller.buffered_packets().len() <= threshold {
                return;
            }
            let drained = controller.clear_buffered_packets();
            if drained.is_empty() {
                return;
            }
            let mut bulk = BulkDataPacket::new(bulk_source, controller.clock().now());
            bulk.add_packets(drained);
            if let Some(frame) = controller.get_field(&camera, CAMERA_FIELD).into_packet() {
                if frame.value() != UNINITIALIZED_VALUE {
                    bulk.add_packet(frame);
                }
            }
            if route.is_empty() {
                tracing::warn!(
                    node = %bulk.source_node(),
                    "no destination zones configured, dropping aggregate"
                );
                return;
            }
            controller.forward_to_zones(bulk, &route).await;
        }
    };

    let controller = Arc::new(
        Controller::new(
            format!("{zone}_master_ctl"),
            clock.clone(),
            events.clone(),
            params.step,
        )
        .with_setup(setup)
        .with_main(main),
    );
    controller.connect([camera as Arc<dyn Device>]);
    controller
}

/// Site-wide CSV sink for bulk packets arriving at the central zone. One
/// row per contained packet, stamped with the simulated arrival time.
pub struct SiteDatabase {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl SiteDatabase {
    pub fn new(path: impl Into<PathBuf>) -> SiteDatabase {
        SiteDatabase {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append_bulk(
        &self,
        arrived_at: Timestamp,
        bulk: &BulkDataPacket,
    ) -> io::Result<()> {
        let mut rows = String::new();
        for packet in bulk.packets() {
            rows.push_str(&format!(
                "{arrived_at},{},{},{packet}\n",
                bulk.source_node(),
                bulk.created_at()
            ));
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let fresh = !self.path.exists();
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            if fresh {
                let header = format!(
                    "Time of Arrival,Source Node,Bulk Created At,{}\n",
                    DataPacket::CSV_HEADER
                );
                file.write_all(header.as_bytes()).await?;
            }
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(rows.as_bytes()).await?;
            // Nothing else flushes this handle; rows must be on disk once
            // this returns.
            file.flush().await?;
        }
        Ok(())
    }
}
