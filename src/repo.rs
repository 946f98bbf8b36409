//! The namespace interface repository.
//!
//! A table interface is expensive: it subscribes to directory state, tracks
//! the primary machine for every key range of its table, and keeps
//! connections warm. The repository caches one per `(worker thread, table)`,
//! constructs it exactly once no matter how many callers race for it, keeps
//! it alive while any [`TableAccess`] exists, tears it down after
//! [`NAMESPACE_INTERFACE_EXPIRATION_MS`] of idleness, and drains everything
//! on shutdown.
//!
//! All entry state is thread-local to the worker that owns it; the only
//! shared mutable state on the hot path is the internally synchronized
//! directory watchable.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

use crate::metadata::{CardsWatcher, DirectoryMap, TableId, TableMap};
use crate::projection::{run_projector, PrimaryReader, PrimaryStore};
use crate::util::local_pool::{self, LocalPool, LocalPoolHandle};
use crate::util::per_thread::PerThread;
use crate::util::watchable::Watchable;

/// How long an unreferenced table interface is retained before it is torn
/// down.
pub const NAMESPACE_INTERFACE_EXPIRATION_MS: u64 = 60 * 1000;

/// A live client interface for one table.
///
/// The repository only manages lifetime; what the interface can do once it
/// is ready is up to the implementation.
pub trait TableClient: 'static {
    /// Resolves once the client has caught up with the cluster far enough to
    /// serve requests.
    fn ready(&self) -> impl Future<Output = ()> + '_;
}

/// Builds a [`TableClient`] from its binding.
///
/// Implementations close over whatever else construction needs, typically
/// the messaging handle and the shared context. Any
/// `Fn(TableBinding) -> C + Send + Sync` qualifies.
pub trait Connect<C: TableClient>: Send + Sync + 'static {
    fn connect(&self, binding: TableBinding) -> C;
}

impl<C, F> Connect<C> for F
where
    C: TableClient,
    F: Fn(TableBinding) -> C + Send + Sync + 'static,
{
    fn connect(&self, binding: TableBinding) -> C {
        (self)(binding)
    }
}

/// Everything the construction of one table client depends on.
#[derive(Debug)]
pub struct TableBinding {
    pub table: TableId,
    /// The calling worker thread's replica of the primary projection.
    pub primaries: PrimaryReader,
    /// The directory, projected down to this table's reactor cards.
    pub cards: CardsWatcher,
}

/// Failure modes of [`RepoHandle::get_namespace_interface`].
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    /// The caller's interruptor fired while waiting for readiness.
    #[error("interrupted while waiting for the table interface")]
    Interrupted,
    /// The repository is being torn down.
    #[error("repository is shutting down")]
    ShuttingDown,
}

/// One-shot, multi-consumer slot the lifecycle task publishes the client
/// through. Pulsing twice is a bug.
struct ReadySlot<T> {
    state: RefCell<SlotState<T>>,
}

struct SlotState<T> {
    value: Option<T>,
    waiters: Vec<Waker>,
}

impl<T: Clone> ReadySlot<T> {
    fn new() -> Self {
        Self {
            state: RefCell::new(SlotState {
                value: None,
                waiters: Vec::new(),
            }),
        }
    }

    fn pulse(&self, value: T) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            assert!(state.value.is_none(), "table interface published twice");
            state.value = Some(value);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn wait(&self) -> SlotWait<'_, T> {
        SlotWait { slot: self }
    }
}

struct SlotWait<'a, T> {
    slot: &'a ReadySlot<T>,
}

impl<T: Clone> Future for SlotWait<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.slot.state.borrow_mut();
        if let Some(value) = &state.value {
            return Poll::Ready(value.clone());
        }
        state.waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

/// One cached table interface on one worker thread.
///
/// Everything in here is owned by that thread; `get` callers and the
/// lifecycle task touch it without any locking.
struct CacheEntry<C> {
    slot: ReadySlot<Rc<C>>,
    ref_count: Cell<usize>,
    /// Pulsed by the `release` that lands the count at zero.
    on_zero: Cell<Option<oneshot::Sender<()>>>,
    /// Pulsed by the `add_ref` that lifts the count off zero.
    on_nonzero: Cell<Option<oneshot::Sender<()>>>,
}

impl<C> CacheEntry<C> {
    fn new() -> Self {
        Self {
            slot: ReadySlot::new(),
            ref_count: Cell::new(0),
            on_zero: Cell::new(None),
            on_nonzero: Cell::new(None),
        }
    }

    fn add_ref(&self) {
        let count = self.ref_count.get() + 1;
        self.ref_count.set(count);
        if count == 1 {
            if let Some(notify) = self.on_nonzero.take() {
                notify.send(()).ok();
            }
        }
    }

    fn release(&self) {
        let count = self.ref_count.get();
        assert!(count > 0, "table access released more often than acquired");
        self.ref_count.set(count - 1);
        if count == 1 {
            if let Some(notify) = self.on_zero.take() {
                notify.send(()).ok();
            }
        }
    }
}

enum Edge {
    Zero,
    NonZero,
}

/// Installs one of the edge-triggered notifiers and clears it again on drop,
/// so a stale trigger can never fire into a later wait.
struct NotifyGuard<'a, C> {
    entry: &'a CacheEntry<C>,
    edge: Edge,
    fired: oneshot::Receiver<()>,
}

impl<'a, C> NotifyGuard<'a, C> {
    fn install(entry: &'a CacheEntry<C>, edge: Edge) -> Self {
        let (notify, fired) = oneshot::channel();
        match edge {
            Edge::Zero => entry.on_zero.set(Some(notify)),
            Edge::NonZero => entry.on_nonzero.set(Some(notify)),
        }
        Self {
            entry,
            edge,
            fired,
        }
    }

    async fn fired(&mut self) {
        (&mut self.fired).await.ok();
    }
}

impl<C> Drop for NotifyGuard<'_, C> {
    fn drop(&mut self) {
        match self.edge {
            Edge::Zero => self.entry.on_zero.set(None),
            Edge::NonZero => self.entry.on_nonzero.set(None),
        }
    }
}

/// Reference-counted access to a live table client.
///
/// Holding one keeps the interface alive; dropping the last one starts the
/// idle-expiry window. The handle is `!Send`: it stays on the worker thread
/// that owns the underlying entry, which is also what makes the unlocked
/// ref-count sound.
pub struct TableAccess<C: TableClient> {
    client: Rc<C>,
    entry: Rc<CacheEntry<C>>,
}

impl<C: TableClient> TableAccess<C> {
    fn new(client: Rc<C>, entry: Rc<CacheEntry<C>>) -> Self {
        entry.add_ref();
        Self { client, entry }
    }
}

impl<C: TableClient> Deref for TableAccess<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C: TableClient> Clone for TableAccess<C> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone(), self.entry.clone())
    }
}

impl<C: TableClient> Drop for TableAccess<C> {
    fn drop(&mut self) {
        self.entry.release();
    }
}

impl<C: TableClient> fmt::Debug for TableAccess<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableAccess")
            .field("ref_count", &self.entry.ref_count.get())
            .finish_non_exhaustive()
    }
}

/// One worker thread's table-to-entry map.
struct TableCache<C> {
    entries: RefCell<HashMap<TableId, Rc<CacheEntry<C>>>>,
}

impl<C> Default for TableCache<C> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }
}

struct Shared<C: TableClient> {
    pool: LocalPoolHandle,
    connector: Box<dyn Connect<C>>,
    directory: Watchable<DirectoryMap>,
    caches: PerThread<TableCache<C>>,
    primaries: PerThread<PrimaryStore>,
    /// Signalled once, when the repository starts tearing down. Every
    /// suspension point of the lifecycle tasks observes it.
    drain: CancellationToken,
    expiration: Duration,
}

/// Construction parameters for [`NamespaceRepo`].
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: &'static str,
    expiration: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            thread_name_prefix: "table-repo",
            expiration: Duration::from_millis(NAMESPACE_INTERFACE_EXPIRATION_MS),
        }
    }
}

impl RepoConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Shrinks the idle-retention window. Tests only.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }
}

/// Brokers access to live table client interfaces.
///
/// Owns the worker pool, the per-thread caches and projection replicas, and
/// the metadata subscription. Cheap access goes through [`RepoHandle`]
/// clones; the repository itself is the owner whose destruction drains
/// everything.
///
/// Dropping the repository blocks until every lifecycle task has torn down
/// its interface and every worker thread has parked; use
/// [`NamespaceRepo::shutdown`] for the non-blocking variant. No
/// [`TableAccess`] may outlive the repository.
pub struct NamespaceRepo<C: TableClient> {
    pool: Option<LocalPool>,
    handle: RepoHandle<C>,
    sub_cancel: CancellationToken,
    sub_done: Option<oneshot::Receiver<()>>,
}

/// A cloneable handle for looking up table interfaces.
pub struct RepoHandle<C: TableClient> {
    shared: Arc<Shared<C>>,
}

impl<C: TableClient> Clone for RepoHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: TableClient> fmt::Debug for RepoHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoHandle").finish_non_exhaustive()
    }
}

impl<C: TableClient> fmt::Debug for NamespaceRepo<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceRepo")
            .field("workers", &self.handle.shared.pool.num_workers())
            .finish_non_exhaustive()
    }
}

impl<C: TableClient> NamespaceRepo<C> {
    /// Starts a repository: brings up the worker pool, replicates the empty
    /// projection and entry maps to every worker, and subscribes to the
    /// table metadata.
    pub async fn spawn(
        tables: Watchable<TableMap>,
        directory: Watchable<DirectoryMap>,
        connector: impl Connect<C>,
        config: RepoConfig,
    ) -> Self {
        let pool = LocalPool::new(local_pool::Config {
            threads: config.workers,
            thread_name_prefix: config.thread_name_prefix,
        });
        let pool_handle = pool.handle().clone();

        let primaries = PerThread::install(&pool_handle, |_| PrimaryStore::default()).await;
        let caches = PerThread::install(&pool_handle, |_| TableCache::<C>::default()).await;

        let shared = Arc::new(Shared {
            pool: pool_handle.clone(),
            connector: Box::new(connector),
            directory,
            caches,
            primaries: primaries.clone(),
            drain: CancellationToken::new(),
            expiration: config.expiration,
        });

        // the projector lives on the first worker; its exit is awaited during
        // shutdown so no fanout can race the entry drain
        let sub_cancel = CancellationToken::new();
        let home = pool_handle.workers().next().expect("pool has no workers");
        let sub_done = {
            let watcher = tables.watch();
            let stores = primaries;
            let fanout = pool_handle.clone();
            let cancel = sub_cancel.clone();
            pool_handle.run_on(home, move || run_projector(watcher, stores, fanout, cancel))
        };

        Self {
            pool: Some(pool),
            handle: RepoHandle { shared },
            sub_cancel,
            sub_done: Some(sub_done),
        }
    }

    pub fn handle(&self) -> &RepoHandle<C> {
        &self.handle
    }

    /// The pool callers schedule their own work onto; every
    /// [`RepoHandle::get_namespace_interface`] call must run on one of its
    /// workers.
    pub fn pool(&self) -> &LocalPoolHandle {
        &self.handle.shared.pool
    }

    /// Tears the repository down: stops the metadata subscription, signals
    /// every lifecycle task and waits for them to destroy their interfaces
    /// and erase their entries, then parks the workers.
    pub async fn shutdown(mut self) {
        self.sub_cancel.cancel();
        if let Some(done) = self.sub_done.take() {
            done.await.ok();
        }
        self.handle.shared.drain.cancel();
        if let Some(pool) = self.pool.take() {
            pool.finish().await;
        }
    }
}

impl<C: TableClient> Drop for NamespaceRepo<C> {
    fn drop(&mut self) {
        self.sub_cancel.cancel();
        self.handle.shared.drain.cancel();
        if let Some(pool) = self.pool.take() {
            pool.shutdown_blocking();
        }
    }
}

impl<C: TableClient> Deref for NamespaceRepo<C> {
    type Target = RepoHandle<C>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<C: TableClient> RepoHandle<C> {
    /// Returns access to the live interface for `table`, constructing it if
    /// this worker thread has none.
    ///
    /// Must be called on a worker of the repository's pool. Waits until the
    /// interface is ready; many concurrent callers for the same table share
    /// one construction. When `interruptor` fires first the call returns
    /// [`GetError::Interrupted`] and leaves the entry's reference count
    /// untouched (the entry itself remains and will expire or drain through
    /// its own task).
    pub async fn get_namespace_interface(
        &self,
        table: TableId,
        interruptor: &CancellationToken,
    ) -> Result<TableAccess<C>, GetError> {
        // Non-suspending section: the entry is discoverable and its
        // lifecycle task registered before the first await.
        let entry = self.shared.caches.with(|cache| {
            let mut entries = cache.entries.borrow_mut();
            if let Some(entry) = entries.get(&table) {
                entry.clone()
            } else {
                let entry = Rc::new(CacheEntry::new());
                entries.insert(table, entry.clone());
                self.spawn_entry_task(table, entry.clone());
                entry
            }
        });

        let client = tokio::select! {
            biased;
            client = entry.slot.wait() => client,
            _ = interruptor.cancelled() => return Err(GetError::Interrupted),
            _ = self.shared.drain.cancelled() => return Err(GetError::ShuttingDown),
        };
        Ok(TableAccess::new(client, entry))
    }

    fn spawn_entry_task(&self, table: TableId, entry: Rc<CacheEntry<C>>) {
        let span = debug_span!("table_interface", table = %table);
        local_pool::spawn_local(entry_task(self.shared.clone(), table, entry).instrument(span));
    }
}

/// Constructs, publishes, keeps alive, and finally destroys one table
/// interface.
///
/// Exactly one such task exists per live cache entry; it removes the entry
/// from its thread's map before returning.
async fn entry_task<C: TableClient>(
    shared: Arc<Shared<C>>,
    table: TableId,
    entry: Rc<CacheEntry<C>>,
) {
    let drain = shared.drain.clone();

    // The card view is internally synchronized; building it here hands the
    // interface the only cross-thread state it will ever touch.
    let cards = CardsWatcher::new(shared.directory.watch(), table);
    let binding = TableBinding {
        table,
        primaries: PrimaryReader::new(shared.primaries.clone()),
        cards,
    };
    trace!("constructing table interface");
    let client = Rc::new(shared.connector.connect(binding));

    let interrupted = tokio::select! {
        biased;
        _ = client.ready() => false,
        _ = drain.cancelled() => true,
    };

    if interrupted {
        // Shutdown before the interface ever became ready: the repository
        // destructor ran, so no access handle can exist.
        debug!("interrupted before initial readiness");
    } else {
        entry.slot.pulse(client.clone());
        debug!("table interface published");

        'live: loop {
            // referenced: wait for the count to fall back to zero
            while entry.ref_count.get() != 0 {
                let mut zero = NotifyGuard::install(&entry, Edge::Zero);
                tokio::select! {
                    _ = zero.fired() => {}
                    _ = drain.cancelled() => break 'live,
                }
            }
            // idle: sit out the expiration window, unless revived
            let mut nonzero = NotifyGuard::install(&entry, Edge::NonZero);
            tokio::select! {
                biased;
                // polled before the timer, so a revival that raced the
                // expiry always wins
                _ = nonzero.fired() => {}
                _ = drain.cancelled() => break 'live,
                _ = tokio::time::sleep(shared.expiration) => {
                    debug!("idle for {:?}, tearing down", shared.expiration);
                    break 'live;
                }
            }
        }
    }

    // Drained or expired; either way no access handle may exist now. Unlink
    // the entry without yielding so no concurrent `get` can observe a
    // half-dead entry; the interface itself unwinds with the task.
    assert_eq!(
        entry.ref_count.get(),
        0,
        "table interface torn down while still referenced"
    );
    shared
        .caches
        .with(|cache| cache.entries.borrow_mut().remove(&table));
    debug!("table interface destroyed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::util::local_pool::WorkerId;

    use super::*;

    /// Observes constructions and destructions, and gates readiness.
    #[derive(Debug)]
    struct Probe {
        built: AtomicUsize,
        dropped: AtomicUsize,
        ready: watch::Sender<bool>,
    }

    impl Probe {
        fn new(ready_now: bool) -> Arc<Self> {
            let (ready, _) = watch::channel(ready_now);
            Arc::new(Self {
                built: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
                ready,
            })
        }

        fn release_ready(&self) {
            self.ready.send_replace(true);
        }

        fn built(&self) -> usize {
            self.built.load(Ordering::SeqCst)
        }

        fn dropped(&self) -> usize {
            self.dropped.load(Ordering::SeqCst)
        }
    }

    fn connector(probe: &Arc<Probe>) -> impl Fn(TableBinding) -> TestClient + Send + Sync + 'static {
        let probe = probe.clone();
        move |binding| {
            probe.built.fetch_add(1, Ordering::SeqCst);
            TestClient {
                binding,
                ready: probe.ready.subscribe(),
                probe: probe.clone(),
            }
        }
    }

    struct TestClient {
        binding: TableBinding,
        ready: watch::Receiver<bool>,
        probe: Arc<Probe>,
    }

    impl TableClient for TestClient {
        fn ready(&self) -> impl Future<Output = ()> + '_ {
            let mut ready = self.ready.clone();
            async move {
                ready.wait_for(|ready| *ready).await.ok();
            }
        }
    }

    impl Drop for TestClient {
        fn drop(&mut self) {
            self.probe.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tid(byte: u8) -> TableId {
        TableId::from_bytes([byte; 16])
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    async fn test_repo(
        workers: usize,
        expiration: Duration,
        probe: &Arc<Probe>,
    ) -> (
        NamespaceRepo<TestClient>,
        Watchable<TableMap>,
        Watchable<DirectoryMap>,
    ) {
        let _ = tracing_subscriber::fmt::try_init();
        let tables = Watchable::new(TableMap::new());
        let directory = Watchable::new(DirectoryMap::new());
        let repo = NamespaceRepo::spawn(
            tables.clone(),
            directory.clone(),
            connector(probe),
            RepoConfig::new(workers).expiration(expiration),
        )
        .await;
        (repo, tables, directory)
    }

    fn entry_count(handle: &RepoHandle<TestClient>) -> usize {
        handle
            .shared
            .caches
            .with(|cache| cache.entries.borrow().len())
    }

    #[tokio::test]
    async fn test_cold_get() {
        let probe = Probe::new(true);
        let (repo, _tables, _directory) = test_repo(2, Duration::from_secs(60), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move {
                let access = handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .expect("cold get failed");
                assert_eq!(access.entry.ref_count.get(), 1);
                assert_eq!(entry_count(&handle), 1);
            })
            .await
            .unwrap();

        assert_eq!(probe.built(), 1);
        repo.shutdown().await;
        assert_eq!(probe.dropped(), 1, "drain destroys the idle interface");
    }

    #[tokio::test]
    async fn test_warm_gets_coalesce() {
        let probe = Probe::new(false);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_secs(60), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        let probe2 = probe.clone();
        repo.pool()
            .run_on(worker, move || async move {
                // issue ten gets before the interface is ready
                let (send, recv) = oneshot::channel();
                let gets = handle.clone();
                local_pool::spawn_local(async move {
                    let accesses = futures_buffered::join_all((0..10).map(|_| {
                        let handle = gets.clone();
                        async move {
                            handle
                                .get_namespace_interface(tid(1), &never())
                                .await
                                .expect("get failed")
                        }
                    }))
                    .await;
                    send.send(accesses).ok();
                });

                // let all ten reach their readiness wait, then release it
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                probe2.release_ready();

                let accesses = recv.await.unwrap();
                assert_eq!(accesses.len(), 10);
                assert_eq!(accesses[0].entry.ref_count.get(), 10);
                assert_eq!(probe2.built(), 1, "one construction for ten callers");
                assert_eq!(entry_count(&handle), 1);

                drop(accesses);
                handle.shared.caches.with(|cache| {
                    let entries = cache.entries.borrow();
                    assert_eq!(entries[&tid(1)].ref_count.get(), 0);
                });
            })
            .await
            .unwrap();

        repo.shutdown().await;
        assert_eq!(probe.dropped(), 1);
    }

    #[tokio::test]
    async fn test_idle_expiry_destroys_and_reconstructs() {
        let probe = Probe::new(true);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_millis(400), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move {
                let access = handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .unwrap();
                drop(access);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move {
                assert_eq!(entry_count(&handle), 0, "idle entry was erased");
            })
            .await
            .unwrap();
        assert_eq!(probe.dropped(), 1);

        // a fresh get builds a fresh interface
        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move {
                handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .unwrap();
            })
            .await
            .unwrap();
        assert_eq!(probe.built(), 2);

        repo.shutdown().await;
        assert_eq!(probe.dropped(), 2);
    }

    #[tokio::test]
    async fn test_expiry_window_resets_on_reuse() {
        let probe = Probe::new(true);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_secs(2), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let get_and_drop = |handle: RepoHandle<TestClient>| {
            repo.pool().run_on(worker, move || async move {
                let access = handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .unwrap();
                drop(access);
            })
        };

        // t ~ 0: first idle window starts, deadline ~2000ms
        get_and_drop(repo.handle().clone()).await.unwrap();

        // t ~ 1000ms: revive mid-window, same interface, fresh window with
        // deadline ~3000ms
        tokio::time::sleep(Duration::from_millis(1000)).await;
        get_and_drop(repo.handle().clone()).await.unwrap();
        assert_eq!(probe.built(), 1, "mid-window get reuses the interface");

        // t ~ 2400ms: past the original deadline but within the fresh window
        tokio::time::sleep(Duration::from_millis(1400)).await;
        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move { entry_count(&handle) })
            .await
            .map(|count| assert_eq!(count, 1, "entry survived the original deadline"))
            .unwrap();
        assert_eq!(probe.dropped(), 0);

        // t ~ 3600ms: the fresh window has elapsed
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move { entry_count(&handle) })
            .await
            .map(|count| assert_eq!(count, 0, "entry expired after the fresh window"))
            .unwrap();
        assert_eq!(probe.dropped(), 1);

        repo.shutdown().await;
    }

    /// Polls until every worker's projection replica reports `expected` as
    /// the primary for table 1, key `a`. Replication is asynchronous.
    async fn expect_primary_on_all_workers(
        pool: &LocalPoolHandle,
        handle: &RepoHandle<TestClient>,
        expected: crate::metadata::MachineId,
    ) {
        for worker in pool.workers() {
            let mut found = None;
            for _ in 0..200 {
                let handle = handle.clone();
                let got = pool
                    .run_on(worker, move || async move {
                        handle
                            .shared
                            .primaries
                            .with(|store| store.primary_for(tid(1), b"a"))
                    })
                    .await
                    .unwrap();
                if got == Some(expected) {
                    found = got;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(found, Some(expected), "projection missing on {worker}");
        }
    }

    #[tokio::test]
    async fn test_projection_reaches_every_worker_and_survives_conflict() {
        use crate::metadata::{Blueprint, MachineId, Role, TableMetadata};
        use crate::region::KeyRange;

        let probe = Probe::new(true);
        let (repo, tables, _directory) = test_repo(2, Duration::from_secs(60), &probe).await;

        let m1 = MachineId::from_bytes([1; 16]);
        let m2 = MachineId::from_bytes([2; 16]);
        let range = KeyRange::bounded(&b"a"[..], &b"b"[..]);

        let meta = |in_conflict: bool, machine: MachineId| TableMetadata {
            deleted: false,
            blueprint: Blueprint {
                in_conflict,
                machine_roles: [(machine, [(range.clone(), Role::Primary)].into_iter().collect())]
                    .into_iter()
                    .collect(),
            },
        };

        tables.set(TableMap::from([(tid(1), meta(false, m1))]));
        expect_primary_on_all_workers(repo.pool(), repo.handle(), m1).await;

        // conflicting blueprint names m2, but the prior mapping is retained
        tables.set(TableMap::from([(tid(1), meta(true, m2))]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        expect_primary_on_all_workers(repo.pool(), repo.handle(), m1).await;

        // conflict resolved: the new assignment goes through
        tables.set(TableMap::from([(tid(1), meta(false, m2))]));
        expect_primary_on_all_workers(repo.pool(), repo.handle(), m2).await;

        repo.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_readiness_wait() {
        let probe = Probe::new(false);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_secs(60), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        let pending_get = repo.pool().run_on(worker, move || async move {
            handle
                .get_namespace_interface(tid(1), &never())
                .await
                .map(|_access| ())
        });

        // let construction start and block on readiness
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.built(), 1);

        repo.shutdown().await;

        let res = pending_get.await.unwrap();
        assert!(
            matches!(res, Err(GetError::ShuttingDown)),
            "got {res:?} instead"
        );
        assert_eq!(probe.dropped(), 1, "half-constructed interface discarded");
    }

    #[tokio::test]
    async fn test_interrupted_get_leaves_entry_untouched() {
        let probe = Probe::new(false);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_secs(60), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        let probe2 = probe.clone();
        repo.pool()
            .run_on(worker, move || async move {
                let interruptor = CancellationToken::new();
                let canceller = interruptor.clone();
                let (res, ()) = tokio::join!(
                    handle.get_namespace_interface(tid(1), &interruptor),
                    async {
                        tokio::task::yield_now().await;
                        canceller.cancel();
                    }
                );
                assert!(matches!(res, Err(GetError::Interrupted)));

                // no side effects beyond the entry's existence
                handle.shared.caches.with(|cache| {
                    let entries = cache.entries.borrow();
                    assert_eq!(entries[&tid(1)].ref_count.get(), 0);
                });

                // the same construction completes for a later caller
                probe2.release_ready();
                let access = handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .unwrap();
                assert_eq!(probe2.built(), 1);
                drop(access);
            })
            .await
            .unwrap();

        repo.shutdown().await;
        assert_eq!(probe.dropped(), 1);
    }

    #[tokio::test]
    async fn test_clone_and_drop_are_balanced() {
        let probe = Probe::new(true);
        let (repo, _tables, _directory) = test_repo(1, Duration::from_secs(60), &probe).await;
        let worker = repo.pool().workers().next().unwrap();

        let handle = repo.handle().clone();
        repo.pool()
            .run_on(worker, move || async move {
                let access = handle
                    .get_namespace_interface(tid(1), &never())
                    .await
                    .unwrap();
                assert_eq!(access.entry.ref_count.get(), 1);

                let clones: Vec<_> = (0..5).map(|_| access.clone()).collect();
                assert_eq!(access.entry.ref_count.get(), 6);

                drop(clones);
                assert_eq!(access.entry.ref_count.get(), 1);
            })
            .await
            .unwrap();

        repo.shutdown().await;
        assert_eq!(probe.built(), 1);
        assert_eq!(probe.dropped(), 1);
    }

    #[tokio::test]
    async fn test_entries_are_per_worker() {
        let probe = Probe::new(true);
        let (repo, _tables, _directory) = test_repo(2, Duration::from_secs(60), &probe).await;
        let workers: Vec<WorkerId> = repo.pool().workers().collect();

        for worker in &workers {
            let handle = repo.handle().clone();
            repo.pool()
                .run_on(*worker, move || async move {
                    let _access = handle
                        .get_namespace_interface(tid(1), &never())
                        .await
                        .unwrap();
                    assert_eq!(entry_count(&handle), 1);
                })
                .await
                .unwrap();
        }

        // one interface per worker, not one per table
        assert_eq!(probe.built(), 2);
        repo.shutdown().await;
        assert_eq!(probe.dropped(), 2);
    }
}
