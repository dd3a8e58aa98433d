//! Distance-vector routing table.
//!
//! Each node keeps destination -> (next hop, cost, last update). Peers
//! exchange `RouteUpdate`s; an incoming advertisement integrates at
//! advertised cost + 1, lower cost winning ties. A periodic cleanup drops
//! entries that have not been refreshed within the max age.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: String,
    pub next_hop: String,
    pub cost: u32,
    pub last_update: DateTime<Utc>,
}

/// Advertisement broadcast to peers on insert and delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub destination: String,
    /// Advertising node; becomes the next hop on the receiving side.
    pub via: String,
    /// Advertised cost from `via` to the destination; `None` withdraws
    /// the route.
    pub cost: Option<u32>,
}

pub struct RoutingTable {
    node_id: String,
    routes: RwLock<HashMap<String, RouteEntry>>,
    updates: broadcast::Sender<RouteUpdate>,
    max_age: Duration,
}

impl RoutingTable {
    pub fn new(node_id: impl Into<String>, max_age: std::time::Duration) -> RoutingTable {
        let (updates, _) = broadcast::channel(256);
        RoutingTable {
            node_id: node_id.into(),
            routes: RwLock::new(HashMap::new()),
            updates,
            max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    /// Subscribe to this table's outgoing advertisements.
    pub fn updates(&self) -> broadcast::Receiver<RouteUpdate> {
        self.updates.subscribe()
    }

    pub fn lookup(&self, destination: &str) -> Option<RouteEntry> {
        self.routes.read().get(destination).cloned()
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        let mut all: Vec<RouteEntry> = self.routes.read().values().cloned().collect();
        all.sort_by(|a, b| a.destination.cmp(&b.destination));
        all
    }

    /// Install a directly-known route and advertise it.
    pub fn insert(&self, destination: impl Into<String>, next_hop: impl Into<String>, cost: u32) {
        let destination = destination.into();
        let entry = RouteEntry {
            destination: destination.clone(),
            next_hop: next_hop.into(),
            cost,
            last_update: Utc::now(),
        };
        self.routes.write().insert(destination.clone(), entry);
        let _ = self.updates.send(RouteUpdate {
            destination,
            via: self.node_id.clone(),
            cost: Some(cost),
        });
    }

    pub fn remove(&self, destination: &str) {
        if self.routes.write().remove(destination).is_some() {
            let _ = self.updates.send(RouteUpdate {
                destination: destination.to_string(),
                via: self.node_id.clone(),
                cost: None,
            });
        }
    }

    /// Integrate a peer's advertisement: +1 per hop, lower cost wins
    /// ties; a refresh from the current next hop always lands.
    pub fn integrate(&self, update: &RouteUpdate) {
        if update.destination == self.node_id {
            return;
        }
        let mut routes = self.routes.write();
        match update.cost {
            None => {
                // Withdrawal only applies if we routed through that peer.
                if routes
                    .get(&update.destination)
                    .is_some_and(|entry| entry.next_hop == update.via)
                {
                    routes.remove(&update.destination);
                    debug!(destination = %update.destination, via = %update.via, "route withdrawn");
                }
            }
            Some(advertised) => {
                let cost = advertised.saturating_add(1);
                let install = match routes.get(&update.destination) {
                    Some(existing) => cost < existing.cost || existing.next_hop == update.via,
                    None => true,
                };
                if install {
                    routes.insert(
                        update.destination.clone(),
                        RouteEntry {
                            destination: update.destination.clone(),
                            next_hop: update.via.clone(),
                            cost,
                            last_update: Utc::now(),
                        },
                    );
                }
            }
        }
    }

    /// Drop entries older than the max age; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - self.max_age;
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, entry| entry.last_update >= cutoff);
        before - routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(node: &str) -> RoutingTable {
        RoutingTable::new(node, std::time::Duration::from_secs(300))
    }

    #[test]
    fn integration_adds_one_hop() {
        let routes = table("node_a");
        routes.integrate(&RouteUpdate {
            destination: "node_c".into(),
            via: "node_b".into(),
            cost: Some(2),
        });
        let entry = routes.lookup("node_c").unwrap();
        assert_eq!(entry.cost, 3);
        assert_eq!(entry.next_hop, "node_b");
    }

    #[test]
    fn lower_cost_wins_ties_and_replaces() {
        let routes = table("node_a");
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_b".into(),
            cost: Some(4),
        });
        // Higher-cost alternative from another peer is ignored.
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_c".into(),
            cost: Some(9),
        });
        assert_eq!(routes.lookup("node_d").unwrap().next_hop, "node_b");

        // Cheaper path replaces.
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_c".into(),
            cost: Some(1),
        });
        let entry = routes.lookup("node_d").unwrap();
        assert_eq!(entry.next_hop, "node_c");
        assert_eq!(entry.cost, 2);
    }

    #[test]
    fn refresh_from_current_next_hop_updates_cost() {
        let routes = table("node_a");
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_b".into(),
            cost: Some(2),
        });
        // Same next hop, worse cost: topology changed behind it.
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_b".into(),
            cost: Some(7),
        });
        assert_eq!(routes.lookup("node_d").unwrap().cost, 8);
    }

    #[test]
    fn withdrawals_only_apply_from_the_next_hop() {
        let routes = table("node_a");
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_b".into(),
            cost: Some(2),
        });
        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_c".into(),
            cost: None,
        });
        assert!(routes.lookup("node_d").is_some());

        routes.integrate(&RouteUpdate {
            destination: "node_d".into(),
            via: "node_b".into(),
            cost: None,
        });
        assert!(routes.lookup("node_d").is_none());
    }

    #[test]
    fn inserts_broadcast_updates() {
        let routes = table("node_a");
        let mut updates = routes.updates();
        routes.insert("node_b", "node_b", 1);
        let update = updates.try_recv().unwrap();
        assert_eq!(update.destination, "node_b");
        assert_eq!(update.cost, Some(1));

        routes.remove("node_b");
        let withdrawal = updates.try_recv().unwrap();
        assert_eq!(withdrawal.cost, None);
    }

    #[test]
    fn cleanup_drops_stale_entries() {
        let routes = RoutingTable::new("node_a", std::time::Duration::from_secs(0));
        routes.insert("node_b", "node_b", 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(routes.cleanup(), 1);
        assert!(routes.lookup("node_b").is_none());
    }
}
