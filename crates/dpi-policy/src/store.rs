//! Named policy table registry with lock-free hot-swap and client
//! notification (§4.8 "Client registration", §5 "Policy tables... updated
//! atomically").
//!
//! Grounded on `sase-policy::PolicyStore`'s `ArcSwap<Vec<PolicyRule>>` +
//! version-counter pattern, generalized from one anonymous table to a
//! registry of named tables, each independently swappable, with a list of
//! clients to notify per table.

use crate::rule::PolicyTable;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Notified when a table a client subscribed to is replaced.
pub trait PolicyClient: Send + Sync {
    /// Re-bind this client's view of `table` after an update.
    fn update_client(&self, table: &str);
}

struct TableSlot {
    table: ArcSwap<PolicyTable>,
    version: AtomicU64,
}

/// Registry of named, atomically-swappable policy tables.
pub struct TableStore {
    tables: DashMap<String, Arc<TableSlot>>,
    clients: DashMap<String, Vec<Arc<dyn PolicyClient>>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self { tables: DashMap::new(), clients: DashMap::new() }
    }

    /// Register or replace a named table, bumping its version and notifying
    /// every registered client of that table name.
    pub fn update_table(&self, table: PolicyTable) {
        let name = table.name.clone();
        let slot = self.tables.entry(name.clone()).or_insert_with(|| {
            Arc::new(TableSlot {
                table: ArcSwap::from_pointee(PolicyTable::default()),
                version: AtomicU64::new(0),
            })
        });
        slot.table.store(Arc::new(table));
        slot.version.fetch_add(1, Ordering::Release);
        drop(slot);

        if let Some(clients) = self.clients.get(&name) {
            for client in clients.iter() {
                client.update_client(&name);
            }
        }
    }

    /// Current snapshot of a table, if it exists.
    pub fn get(&self, name: &str) -> Option<Arc<PolicyTable>> {
        self.tables.get(name).map(|slot| slot.table.load_full())
    }

    /// Monotonically increasing version for `name`, or 0 if unknown.
    pub fn version(&self, name: &str) -> u64 {
        self.tables.get(name).map(|slot| slot.version.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// Subscribe `client` to updates on `table_names`.
    pub fn register_client(&self, table_names: &[String], client: Arc<dyn PolicyClient>) {
        for name in table_names {
            self.clients.entry(name.clone()).or_default().push(client.clone());
        }
    }

    /// Remove every registration for `client` across all tables. Client
    /// identity is established by pointer equality of the trait object.
    pub fn deregister_client(&self, client: &Arc<dyn PolicyClient>) {
        for mut entry in self.clients.iter_mut() {
            entry.value_mut().retain(|c| !Arc::ptr_eq(c, client));
        }
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{PolicyAction, PolicyRule};
    use std::sync::atomic::AtomicBool;

    struct Probe(AtomicBool);

    impl PolicyClient for Probe {
        fn update_client(&self, _table: &str) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn update_bumps_version_and_notifies() {
        let store = TableStore::new();
        let probe = Arc::new(Probe(AtomicBool::new(false)));
        store.register_client(&["lan".to_string()], probe.clone());

        assert_eq!(store.version("lan"), 0);
        store.update_table(PolicyTable::new(
            "lan",
            vec![PolicyRule::new("r1", 0, PolicyAction::Allow)],
        ));
        assert_eq!(store.version("lan"), 1);
        assert!(probe.0.load(Ordering::SeqCst));
    }

    #[test]
    fn deregister_stops_notifications() {
        let store = TableStore::new();
        let probe = Arc::new(Probe(AtomicBool::new(false)));
        let dyn_probe: Arc<dyn PolicyClient> = probe.clone();
        store.register_client(&["lan".to_string()], dyn_probe.clone());
        store.deregister_client(&dyn_probe);

        store.update_table(PolicyTable::new("lan", vec![]));
        assert!(!probe.0.load(Ordering::SeqCst));
    }
}
