//! A pool of worker threads for thread-pinned cooperative tasks.
//!
//! Each worker runs a current-thread tokio runtime polling a set of `!Send`
//! futures, so tasks can freely hold `Rc`s and `RefCell`s as long as they
//! stay on their thread. Unlike a generic executor, callers address workers
//! individually: [`LocalPoolHandle::run_on`] and
//! [`LocalPoolHandle::spawn_on`] target one worker, and
//! [`LocalPoolHandle::run_sync_on`] runs a plain closure inline in that
//! worker's loop. Closures sent to the same worker execute in send order,
//! which is what replicated per-thread state relies on.
//!
//! Dropping the pool cancels all tasks immediately (their `Drop` impls still
//! run); [`LocalPool::finish`] and [`LocalPool::shutdown_blocking`] instead
//! let every task run to completion first.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use futures_buffered::FuturesUnordered;
use futures_lite::StreamExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::error;

type BoxedLocalFut = Pin<Box<dyn Future<Output = ()>>>;
type SpawnFn = Box<dyn FnOnce() -> BoxedLocalFut + Send + 'static>;
type SyncFn = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    /// Create a task from the generator and poll it to completion.
    Run(SpawnFn),
    /// Execute the closure inline, before any later message to this worker.
    RunSync(SyncFn),
    /// Stop receiving, drain the remaining tasks, then signal the semaphore.
    Shutdown(Option<Arc<Semaphore>>),
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
    static LOCAL_INJECTOR: RefCell<Option<mpsc::UnboundedSender<BoxedLocalFut>>> =
        const { RefCell::new(None) };
}

/// Identifies one worker thread of a [`LocalPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Returns the id of the pool worker the calling code runs on, if any.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get())
}

/// Spawns a `!Send` future onto the calling worker's task set.
///
/// The task is registered synchronously; it starts running at the worker's
/// next scheduling point.
///
/// # Panics
///
/// Panics when called from a thread that is not a pool worker.
pub fn spawn_local<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    LOCAL_INJECTOR.with(|injector| {
        let injector = injector.borrow();
        let send = injector
            .as_ref()
            .expect("spawn_local called outside a pool worker thread");
        send.send(Box::pin(fut)).ok();
    });
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads.
    pub threads: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            thread_name_prefix: "local-pool",
        }
    }
}

/// A pool of worker threads driving thread-pinned tasks.
#[derive(Debug)]
pub struct LocalPool {
    threads: Vec<std::thread::JoinHandle<()>>,
    cancel: CancellationToken,
    handle: LocalPoolHandle,
}

impl Deref for LocalPool {
    type Target = LocalPoolHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

/// A cheaply cloneable handle to a [`LocalPool`].
#[derive(Debug, Clone)]
pub struct LocalPoolHandle {
    workers: Arc<[flume::Sender<Message>]>,
}

impl LocalPool {
    /// Creates a pool with a single worker thread.
    pub fn single() -> Self {
        Self::new(Config {
            threads: 1,
            ..Default::default()
        })
    }

    /// Creates a pool with the given config.
    pub fn new(config: Config) -> Self {
        let Config {
            threads,
            thread_name_prefix,
        } = config;
        assert!(threads > 0, "pool needs at least one worker");
        let cancel = CancellationToken::new();
        let mut senders = Vec::with_capacity(threads);
        let handles = (0..threads)
            .map(|index| {
                let (send, recv) = flume::unbounded();
                senders.push(send);
                spawn_worker(
                    format!("{thread_name_prefix}-{index}"),
                    WorkerId(index),
                    recv,
                    cancel.clone(),
                )
            })
            .collect::<std::io::Result<Vec<_>>>()
            .expect("invalid thread name");
        Self {
            threads: handles,
            cancel,
            handle: LocalPoolHandle {
                workers: senders.into(),
            },
        }
    }

    /// Returns a cloneable handle to the pool.
    pub fn handle(&self) -> &LocalPoolHandle {
        &self.handle
    }

    /// Lets every worker run its remaining tasks to completion, then waits
    /// for all of them to finish.
    pub async fn finish(self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(0));
        let workers: u32 = self
            .handle
            .workers
            .len()
            .try_into()
            .expect("invalid number of workers");
        for sender in self.handle.workers.iter() {
            sender
                .send(Message::Shutdown(Some(semaphore.clone())))
                .expect("worker channel closed");
        }
        let wait_for_completion = async move {
            let _ = semaphore
                .acquire_many(workers)
                .await
                .expect("semaphore closed");
        };
        // in case somebody cancels the pool while it is shutting down
        futures_lite::future::race(wait_for_completion, self.cancel.cancelled()).await;
    }

    /// Blocking variant of [`LocalPool::finish`]: drains every worker and
    /// joins the threads before returning.
    pub fn shutdown_blocking(mut self) {
        for sender in self.handle.workers.iter() {
            sender.send(Message::Shutdown(None)).ok();
        }
        for handle in self.threads.drain(..) {
            if let Err(cause) = handle.join() {
                error!("error joining worker thread: {:?}", cause);
            }
        }
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in self.threads.drain(..) {
            if let Err(cause) = handle.join() {
                error!("error joining worker thread: {:?}", cause);
            }
        }
    }
}

impl LocalPoolHandle {
    /// Number of worker threads in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// All worker ids of the pool.
    pub fn workers(&self) -> impl Iterator<Item = WorkerId> {
        (0..self.workers.len()).map(WorkerId)
    }

    /// Runs a task on the given worker and returns a receiver for its result.
    ///
    /// Dropping the receiver cancels the task.
    pub fn run_on<T, F, Fut>(&self, worker: WorkerId, gen: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (mut send_res, recv_res) = oneshot::channel();
        self.spawn_on(worker, move || async move {
            let fut = gen();
            tokio::select! {
                res = fut => { send_res.send(res).ok(); }
                _ = send_res.closed() => {}
            }
        });
        recv_res
    }

    /// Runs a detached task on the given worker.
    pub fn spawn_on<F, Fut>(&self, worker: WorkerId, gen: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let gen: SpawnFn = Box::new(move || Box::pin(gen()));
        self.send(worker, Message::Run(gen));
    }

    /// Runs a plain closure inline in the worker's loop.
    ///
    /// Closures sent to the same worker run in send order, and never
    /// interleave with that worker's tasks. The receiver resolves once the
    /// closure ran; it can be dropped to fire and forget.
    pub fn run_sync_on<T, F>(&self, worker: WorkerId, f: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (send_res, recv_res) = oneshot::channel();
        self.send(
            worker,
            Message::RunSync(Box::new(move || {
                send_res.send(f()).ok();
            })),
        );
        recv_res
    }

    fn send(&self, worker: WorkerId, msg: Message) {
        self.workers[worker.0]
            .send(msg)
            .expect("worker channel closed");
    }
}

fn spawn_worker(
    name: String,
    id: WorkerId,
    recv: flume::Receiver<Message>,
    cancel: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new().name(name).spawn(move || {
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_worker(id, recv, &cancel)
        }));
        if let Err(payload) = res {
            // one dead worker leaves the pool unusable, take it all down
            cancel.cancel();
            error!("pool worker panicked: {:?}", payload);
            std::panic::resume_unwind(payload);
        }
    })
}

fn run_worker(id: WorkerId, recv: flume::Receiver<Message>, cancel: &CancellationToken) {
    CURRENT_WORKER.with(|c| c.set(Some(id)));
    let (inject_send, mut inject_recv) = mpsc::unbounded_channel();
    LOCAL_INJECTOR.with(|injector| *injector.borrow_mut() = Some(inject_send));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let mut tasks: FuturesUnordered<BoxedLocalFut> = FuturesUnordered::new();

    let sem_opt = rt.block_on(async {
        loop {
            tokio::select! {
                _ = tasks.next(), if !tasks.is_empty() => {}
                Some(fut) = inject_recv.recv() => tasks.push(fut),
                _ = cancel.cancelled() => break None,
                msg = recv.recv_async() => {
                    match msg {
                        Ok(Message::Run(gen)) => tasks.push(gen()),
                        Ok(Message::RunSync(f)) => f(),
                        Ok(Message::Shutdown(sem_opt)) => break sem_opt,
                        Err(flume::RecvError::Disconnected) => break None,
                    }
                }
            }
        }
    });

    // poll the remaining tasks to completion, unless the pool is cancelled
    rt.block_on(async {
        loop {
            while let Ok(fut) = inject_recv.try_recv() {
                tasks.push(fut);
            }
            if tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tasks.next() => {}
                Some(fut) = inject_recv.recv() => tasks.push(fut),
            }
        }
    });
    if let Some(sem) = sem_opt {
        sem.add_permits(1);
    }
}
