//! Source-routed store-and-forward mesh between zones.
//!
//! Gateways form an undirected weighted graph; there is no registry, so
//! reachability is whatever the neighbor maps encode. A route is the full
//! ordered hop list, fixed by the sender before transmission: intermediate
//! gateways only validate that the next named hop is actually a neighbor,
//! and the terminal gateway hands the packet to its owning controller. A
//! missing edge or a terminal name mismatch drops the packet; simulated
//! time spent on earlier hops is not refunded.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::clock::SimClock;
use crate::controller::Controller;
use crate::eventlog::EventLog;
use crate::link::LinkModel;
use crate::packet::BulkDataPacket;

pub struct Gateway {
    name: String,
    clock: SimClock,
    events: EventLog,
    wifi_rate_kbps: u64,
    neighbors: Mutex<HashMap<String, Neighbor>>,
    parent: OnceLock<Weak<Controller>>,
    terminated: AtomicBool,
}

struct Neighbor {
    gateway: Weak<Gateway>,
    rtt_millis: u64,
}

impl Gateway {
    pub fn new(
        name: impl Into<String>,
        wifi_rate_kbps: u64,
        clock: SimClock,
        events: EventLog,
    ) -> Arc<Gateway> {
        Arc::new(Gateway {
            name: name.into(),
            clock,
            events,
            wifi_rate_kbps,
            neighbors: Mutex::new(HashMap::new()),
            parent: OnceLock::new(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts the edge in both neighbor maps. Self-loops are ignored.
    pub fn connect(a: &Arc<Gateway>, b: &Arc<Gateway>, rtt_millis: u64) {
        if a == b {
            tracing::warn!(gateway = %a.name, "ignoring self-loop edge");
            return;
        }
        a.neighbors.lock().insert(
            b.name.clone(),
            Neighbor {
                gateway: Arc::downgrade(b),
                rtt_millis,
            },
        );
        b.neighbors.lock().insert(
            a.name.clone(),
            Neighbor {
                gateway: Arc::downgrade(a),
                rtt_millis,
            },
        );
        tracing::debug!(from = %a.name, to = %b.name, rtt_millis, "connected gateways");
    }

    pub fn neighbor_names(&self) -> Vec<String> {
        self.neighbors.lock().keys().cloned().collect()
    }

    pub(crate) fn set_parent(&self, controller: Weak<Controller>) {
        if self.parent.set(controller).is_err() {
            tracing::warn!(gateway = %self.name, "owning controller already set");
        }
    }

    pub fn parent(&self) -> Option<Arc<Controller>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Moves a bulk packet one hop along `route`, recursing into the next
    /// gateway until the terminal hop delivers to its owning controller.
    ///
    /// `position` indexes this gateway's own name in `route`. Each hop
    /// suspends the original caller for half the edge RTT plus the packet's
    /// transmission time at the Wi-Fi rate before recursing.
    pub fn forward<'a>(
        &'a self,
        source: &'a str,
        previous: &'a str,
        packet: BulkDataPacket,
        route: &'a [String],
        position: usize,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if position + 1 >= route.len() {
                let matches = route.get(position).is_some_and(|hop| hop == &self.name);
                if !matches {
                    self.export_state(format!(
                        "[FAILURE] forward from [{source}]: reached end of route {route:?} at [{}]",
                        self.name
                    ));
                    return false;
                }
                let Some(controller) = self.parent() else {
                    self.export_state(format!(
                        "[FAILURE] deliver from [{source}]: owning controller is gone"
                    ));
                    return false;
                };
                tracing::debug!(
                    gateway = %self.name,
                    source,
                    packets = packet.len(),
                    "delivering bulk packet"
                );
                self.export_state(format!(
                    "Delivered bulk packet from [{source}] to [{}]",
                    controller.name()
                ));
                controller.receive_bulk_packet(source, previous, packet);
                return true;
            }

            let next_name = &route[position + 1];
            let next = {
                let neighbors = self.neighbors.lock();
                neighbors
                    .get(next_name)
                    .map(|neighbor| (neighbor.gateway.clone(), neighbor.rtt_millis))
            };
            let Some((next, rtt_millis)) = next else {
                self.export_state(format!(
                    "[FAILURE] forward from [{source}]: [{next_name}] is not a neighbor of [{}]",
                    self.name
                ));
                return false;
            };
            let Some(next) = next.upgrade() else {
                self.export_state(format!(
                    "[FAILURE] forward from [{source}]: neighbor [{next_name}] is gone"
                ));
                return false;
            };

            let link = LinkModel::new(rtt_millis, self.wifi_rate_kbps);
            self.clock
                .wait_for(link.one_way(packet.total_size_bytes()))
                .await;
            self.export_state(format!(
                "Forwarding bulk packet from [{source}] to [{next_name}]"
            ));
            next.forward(source, &self.name, packet, route, position + 1)
                .await
        })
    }

    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.export_state("Terminated");
        }
    }

    fn export_state(&self, event: impl Into<String>) {
        self.events.record(self.clock.now(), &self.name, event);
    }
}

impl PartialEq for Gateway {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Gateway {}

impl Hash for Gateway {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("neighbors", &self.neighbor_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(name: &str) -> Arc<Gateway> {
        Gateway::new(name, 2000, SimClock::new(1.0), EventLog::noop())
    }

    #[test]
    fn edges_are_symmetric() {
        let a = gateway("A");
        let b = gateway("B");
        Gateway::connect(&a, &b, 100);
        assert_eq!(a.neighbor_names(), ["B"]);
        assert_eq!(b.neighbor_names(), ["A"]);
    }

    #[test]
    fn self_loops_are_ignored() {
        let a = gateway("A");
        Gateway::connect(&a, &a.clone(), 100);
        assert!(a.neighbor_names().is_empty());
    }

    #[test]
    fn identity_is_by_name() {
        let a = gateway("A");
        let other_a = gateway("A");
        let b = gateway("B");
        assert_eq!(a, other_a);
        assert_ne!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&other_a));
        assert!(!set.contains(&b));
    }
}
