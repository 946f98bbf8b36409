//! The region-to-primary projection: per-thread replicas and the projector
//! that keeps them current.
//!
//! Table interfaces route writes by asking which machine is primary for a
//! key. That lookup sits on the hot path, so every worker thread holds its
//! own read-only replica of the projection ([`PrimaryStore`]) and the
//! projector pushes rebuilt projections to all of them whenever the table
//! metadata changes.

use std::cell::RefCell;
use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metadata::{MachineId, Role, TableId, TableMap};
use crate::region::RegionMap;
use crate::util::local_pool::LocalPoolHandle;
use crate::util::per_thread::PerThread;
use crate::util::watchable::Watcher;

/// The machine currently serializing writes, for every key range of every
/// table.
pub type PrimaryProjection = BTreeMap<TableId, RegionMap<MachineId>>;

/// Rebuilds the projection from a table-map snapshot.
///
/// Deleted tables are dropped. Tables whose blueprint is in conflict retain
/// whatever `prev` holds for them: the reactor will not move roles while the
/// conflict stands, so the stale mapping beats no mapping. Tables without any
/// primary assignment do not appear.
pub fn build_projection(tables: &TableMap, prev: &PrimaryProjection) -> PrimaryProjection {
    let mut next = PrimaryProjection::new();
    for (table, meta) in tables {
        if meta.deleted {
            continue;
        }
        if meta.blueprint.in_conflict {
            if let Some(retained) = prev.get(table) {
                next.insert(*table, retained.clone());
            }
            continue;
        }
        let mut primaries = RegionMap::new();
        for (machine, roles) in &meta.blueprint.machine_roles {
            for (range, role) in roles.iter() {
                if *role != Role::Primary {
                    continue;
                }
                if let Err(err) = primaries.insert(range.clone(), *machine) {
                    warn!(table = %table, machine = %machine, "dropping primary assignment: {err}");
                }
            }
        }
        if !primaries.is_empty() {
            next.insert(*table, primaries);
        }
    }
    next
}

/// One worker thread's replica of the current projection.
///
/// Reads are plain borrows on the owning thread; writes only ever arrive
/// from the projector, scheduled onto this thread.
#[derive(Debug, Default)]
pub struct PrimaryStore {
    current: RefCell<PrimaryProjection>,
}

impl PrimaryStore {
    pub(crate) fn replace(&self, next: PrimaryProjection) {
        *self.current.borrow_mut() = next;
    }

    /// The machine serializing writes for `key` of `table`, if known.
    pub fn primary_for(&self, table: TableId, key: &[u8]) -> Option<MachineId> {
        self.current
            .borrow()
            .get(&table)
            .and_then(|map| map.lookup(key).copied())
    }

    /// The full range-to-primary map of one table.
    pub fn table(&self, table: TableId) -> Option<RegionMap<MachineId>> {
        self.current.borrow().get(&table).cloned()
    }

    pub fn snapshot(&self) -> PrimaryProjection {
        self.current.borrow().clone()
    }
}

/// Read access to the projection replica of the calling worker thread.
#[derive(Debug, Clone)]
pub struct PrimaryReader {
    stores: PerThread<PrimaryStore>,
}

impl PrimaryReader {
    pub(crate) fn new(stores: PerThread<PrimaryStore>) -> Self {
        Self { stores }
    }

    /// The machine serializing writes for `key` of `table`, if known.
    pub fn primary_for(&self, table: TableId, key: &[u8]) -> Option<MachineId> {
        self.stores.with(|store| store.primary_for(table, key))
    }

    /// The full range-to-primary map of one table.
    pub fn table(&self, table: TableId) -> Option<RegionMap<MachineId>> {
        self.stores.with(|store| store.table(table))
    }

    pub fn snapshot(&self) -> PrimaryProjection {
        self.stores.with(|store| store.snapshot())
    }
}

/// Follows the table map and replicates the rebuilt projection to every
/// worker.
///
/// Replication goes through the workers' ordered sync lane, so each replica
/// applies updates in the order the metadata changes were observed. Runs
/// until cancelled or until the table map is dropped.
pub(crate) async fn run_projector(
    mut tables: Watcher<TableMap>,
    stores: PerThread<PrimaryStore>,
    pool: LocalPoolHandle,
    cancel: CancellationToken,
) {
    let mut prev = PrimaryProjection::new();
    let Ok(mut snapshot) = tables.get() else {
        return;
    };
    loop {
        let next = build_projection(&snapshot, &prev);
        if next != prev {
            trace!(tables = next.len(), "replicating primary projection");
            for worker in pool.workers() {
                let stores = stores.clone();
                let next = next.clone();
                drop(pool.run_sync_on(worker, move || stores.with(|store| store.replace(next))));
            }
            prev = next;
        }
        snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            updated = tables.updated() => match updated {
                Ok(snapshot) => snapshot,
                Err(_) => break,
            },
        };
    }
    debug!("projector stopped");
}
