//! A per-process cache of live table routing interfaces.
//!
//! In a cluster of distributed tables, the client object for one table (the
//! "namespace interface") is expensive: it subscribes to directory state,
//! tracks the current primary replica for every key range, and exposes
//! read/write routing. This crate amortizes that cost across many
//! short-lived users:
//!
//! - [`NamespaceRepo`] keeps one interface per `(worker thread, table)`,
//!   constructed exactly once no matter how many callers race for it.
//! - [`TableAccess`] handles reference-count the interface; it survives as
//!   long as any handle exists, plus a fixed idle window
//!   ([`NAMESPACE_INTERFACE_EXPIRATION_MS`]) after the last one is dropped.
//! - A projector follows the cluster's table metadata and replicates the
//!   *table → (key range → primary machine)* mapping to every worker thread,
//!   so routing lookups on the hot path read only thread-local data.
//! - Dropping the repository drains everything: no handle, task, or
//!   interface survives it.
//!
//! The repository is generic over the interface type ([`TableClient`]) and
//! how to build one ([`Connect`]); it manages lifetime only. Metadata comes
//! in through two [`Watchable`]s: the table map (authoritative blueprints)
//! and the directory (per-peer reactor cards).
//!
//! All caller-facing operations are pinned to the repository's worker
//! threads (see [`LocalPoolHandle`]); this is what lets entries and
//! projection replicas go entirely without locks.

pub mod metadata;
pub mod projection;
pub mod region;
pub mod repo;
pub mod util;

pub use metadata::{
    reactor_cards, Blueprint, CardsWatcher, DirectoryMap, MachineId, PeerDirectory, PeerId,
    ReactorCard, ReactorCards, Role, TableId, TableMap, TableMetadata,
};
pub use projection::{build_projection, PrimaryProjection, PrimaryReader, PrimaryStore};
pub use region::{KeyRange, RangeOverlap, RegionMap};
pub use repo::{
    Connect, GetError, NamespaceRepo, RepoConfig, RepoHandle, TableAccess, TableBinding,
    TableClient, NAMESPACE_INTERFACE_EXPIRATION_MS,
};
pub use util::local_pool::{current_worker, spawn_local, LocalPool, LocalPoolHandle, WorkerId};
pub use util::per_thread::PerThread;
pub use util::watchable::{Disconnected, Watchable, Watcher};
