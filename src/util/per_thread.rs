//! One value per pool worker thread.
//!
//! [`PerThread`] replicates a value across every worker of a [`LocalPool`]:
//! the constructor runs *on* each worker, the value never leaves its thread,
//! and access goes through [`PerThread::with`] which only works on the owning
//! thread. This is what makes lock-free per-thread state (entry maps, region
//! map replicas) possible: the handle itself is `Send + Sync` even when the
//! replicated value is not.
//!
//! Instances live until their worker thread exits; the pool owns thread
//! lifetime, so tearing down the pool reclaims them.
//!
//! [`LocalPool`]: super::local_pool::LocalPool

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::local_pool::{LocalPoolHandle, WorkerId};

thread_local! {
    static INSTANCES: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(0);

/// A handle to one instance of `T` on every worker thread of a pool.
pub struct PerThread<T> {
    id: u64,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Clone for PerThread<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _ty: PhantomData,
        }
    }
}

impl<T> fmt::Debug for PerThread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerThread")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> PerThread<T> {
    /// Constructs one instance on every worker of the pool and waits until
    /// all of them are in place.
    pub async fn install<F>(pool: &LocalPoolHandle, ctor: F) -> Self
    where
        F: Fn(WorkerId) -> T + Send + Sync + 'static,
    {
        let id = NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed);
        let ctor = Arc::new(ctor);
        let acks: Vec<_> = pool
            .workers()
            .map(|worker| {
                let ctor = ctor.clone();
                pool.run_sync_on(worker, move || {
                    INSTANCES.with(|instances| {
                        instances
                            .borrow_mut()
                            .insert(id, Rc::new(ctor(worker)) as Rc<dyn Any>);
                    });
                })
            })
            .collect();
        for ack in acks {
            ack.await.expect("worker exited during install");
        }
        Self {
            id,
            _ty: PhantomData,
        }
    }

    /// Gives access to the calling worker thread's instance.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread the value was not installed on, in
    /// particular from outside the pool.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let instance = INSTANCES
            .with(|instances| instances.borrow().get(&self.id).cloned())
            .expect("no per-thread instance installed on this thread");
        let instance = instance
            .downcast::<T>()
            .expect("per-thread instance type mismatch");
        f(&instance)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::super::local_pool::{Config, LocalPool};
    use super::*;

    #[tokio::test]
    async fn test_one_instance_per_worker() {
        let pool = LocalPool::new(Config {
            threads: 3,
            ..Default::default()
        });
        let counters = PerThread::install(pool.handle(), |worker| {
            (worker, Cell::new(0u32))
        })
        .await;

        // bump each worker's counter a distinct number of times
        for (i, worker) in pool.workers().enumerate() {
            for _ in 0..=i {
                let counters = counters.clone();
                pool.run_sync_on(worker, move || {
                    counters.with(|(_, count)| count.set(count.get() + 1));
                })
                .await
                .unwrap();
            }
        }

        for (i, worker) in pool.workers().enumerate() {
            let counters = counters.clone();
            let (owner, count) = pool
                .run_on(worker, move || async move {
                    counters.with(|(owner, count)| (*owner, count.get()))
                })
                .await
                .unwrap();
            assert_eq!(owner, worker, "constructor saw the owning worker");
            assert_eq!(count, i as u32 + 1, "counters are independent");
        }
        pool.finish().await;
    }
}
