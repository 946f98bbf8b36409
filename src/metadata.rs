//! The cluster metadata model the repository consumes.
//!
//! Two feeds exist: the *table map* (authoritative per-table blueprints,
//! published through the semilattices) and the *directory* (per-peer
//! advertisements, published through the connectivity layer). The repository
//! never interprets reactor cards; it only projects and forwards them.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::region::RegionMap;
use crate::util::watchable::{Disconnected, Watcher};

macro_rules! opaque_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 16]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

opaque_id!(
    /// Globally unique identifier of a table.
    TableId
);

opaque_id!(
    /// Identifier of a cluster node that can host replicas.
    MachineId
);

opaque_id!(
    /// Identifier of a connected peer process.
    PeerId
);

/// Replica role for one key range of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Serializes writes for the range.
    Primary,
    Secondary,
    Nothing,
}

/// Authoritative machine-to-role assignment for one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blueprint {
    /// Unresolved divergent updates. The reactor makes no role changes while
    /// this is set.
    pub in_conflict: bool,
    pub machine_roles: BTreeMap<MachineId, RegionMap<Role>>,
}

/// One table's entry in the semilattice metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    pub deleted: bool,
    pub blueprint: Blueprint,
}

/// Snapshot of all tables' metadata.
pub type TableMap = BTreeMap<TableId, TableMetadata>;

/// Opaque advertisement a peer publishes for one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReactorCard(pub Bytes);

/// Everything one peer publishes into the directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerDirectory {
    pub reactor_cards: BTreeMap<TableId, ReactorCard>,
}

/// Snapshot of the whole directory.
pub type DirectoryMap = BTreeMap<PeerId, PeerDirectory>;

/// The directory as seen by one table's interface.
pub type ReactorCards = BTreeMap<PeerId, Option<ReactorCard>>;

/// Projects the full directory down to the cards for a single table.
///
/// Every connected peer is present in the result; peers that publish no card
/// for the table map to `None`.
pub fn reactor_cards(directory: &DirectoryMap, table: TableId) -> ReactorCards {
    directory
        .iter()
        .map(|(peer, published)| (*peer, published.reactor_cards.get(&table).cloned()))
        .collect()
}

/// Watches the directory as seen through [`reactor_cards`] for one table.
///
/// This is the view a table interface subscribes to at construction time.
/// It is internally synchronized and may be polled from any thread.
#[derive(Debug, Clone)]
pub struct CardsWatcher {
    table: TableId,
    watcher: Watcher<DirectoryMap>,
}

impl CardsWatcher {
    pub(crate) fn new(watcher: Watcher<DirectoryMap>, table: TableId) -> Self {
        Self { table, watcher }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// The current cards for this table.
    pub fn get(&self) -> Result<ReactorCards, Disconnected> {
        Ok(reactor_cards(&self.watcher.get()?, self.table))
    }

    /// Completes once the directory changes, yielding the projected cards.
    ///
    /// Note the projection is not deduplicated: a directory change that does
    /// not touch this table's cards still yields (the same) value.
    pub async fn updated(&mut self) -> Result<ReactorCards, Disconnected> {
        let directory = self.watcher.updated().await?;
        Ok(reactor_cards(&directory, self.table))
    }
}
