//! Observable values.
//!
//! A [`Watchable`] tracks a value that changes over time and lets any number
//! of [`Watcher`]s read or await the **latest** value. Intermediate values
//! may be skipped by a slow observer; every observer is guaranteed to learn
//! about the most recent one.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{self, Poll, Waker};

use futures_lite::stream::Stream;

/// Error for a [`Watcher`] whose underlying [`Watchable`] was dropped.
#[derive(thiserror::Error, Debug)]
#[error("watcher lost its connection to the underlying watchable")]
pub struct Disconnected;

#[derive(Debug)]
struct Shared<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    value: T,
    /// Bumped on every effective [`Watchable::set`]. Watchers compare their
    /// own epoch against this to decide whether they are behind.
    epoch: u64,
    watchers: VecDeque<Waker>,
}

impl<T: Clone> Shared<T> {
    fn get(&self) -> T {
        self.inner.lock().expect("poisoned").value.clone()
    }

    fn poll_updated(&self, cx: &mut task::Context<'_>, last_epoch: u64) -> Poll<(u64, T)> {
        let mut inner = self.inner.lock().expect("poisoned");
        if last_epoch < inner.epoch {
            return Poll::Ready((inner.epoch, inner.value.clone()));
        }
        inner.watchers.push_back(cx.waker().clone());
        Poll::Pending
    }
}

/// A value whose changes over time can be observed.
#[derive(Debug)]
pub struct Watchable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Watchable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Eq> Watchable<T> {
    /// Creates a watchable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    value,
                    epoch: 1,
                    watchers: VecDeque::new(),
                }),
            }),
        }
    }

    /// Replaces the value, waking all watchers.
    ///
    /// Returns whether the value actually changed. Watchers are only notified
    /// for effective changes.
    pub fn set(&self, value: T) -> bool {
        let watchers = {
            let mut inner = self.shared.inner.lock().expect("poisoned");
            if inner.value == value {
                return false;
            }
            inner.value = value;
            inner.epoch += 1;
            std::mem::take(&mut inner.watchers)
        };
        for watcher in watchers {
            watcher.wake();
        }
        true
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        self.shared.get()
    }

    /// Creates a watcher tracking changes from this point on.
    pub fn watch(&self) -> Watcher<T> {
        Watcher {
            epoch: self.shared.inner.lock().expect("poisoned").epoch,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// An observer of a [`Watchable`].
///
/// Only the most recent value is accessible; earlier values are gone.
#[derive(Debug, Clone)]
pub struct Watcher<T> {
    epoch: u64,
    shared: Weak<Shared<T>>,
}

impl<T: Clone + Eq> Watcher<T> {
    /// Returns the current value.
    pub fn get(&self) -> Result<T, Disconnected> {
        let shared = self.shared.upgrade().ok_or(Disconnected)?;
        Ok(shared.get())
    }

    /// Completes once a value newer than the last one seen by this watcher
    /// is set, yielding it.
    pub fn updated(&mut self) -> Updated<'_, T> {
        Updated { watcher: self }
    }

    /// Converts into a stream yielding the current value first, then every
    /// later one observed. Ends when the watchable is dropped.
    pub fn stream(mut self) -> WatcherStream<T> {
        debug_assert!(self.epoch > 0);
        // back up one epoch so the first poll yields the present value
        self.epoch -= 1;
        WatcherStream { watcher: self }
    }
}

/// Future for the next value of a [`Watcher`], see [`Watcher::updated`].
#[derive(Debug)]
pub struct Updated<'a, T> {
    watcher: &'a mut Watcher<T>,
}

impl<T: Clone + Eq> Future for Updated<'_, T> {
    type Output = Result<T, Disconnected>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let Some(shared) = self.watcher.shared.upgrade() else {
            return Poll::Ready(Err(Disconnected));
        };
        match shared.poll_updated(cx, self.watcher.epoch) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((epoch, value)) => {
                self.watcher.epoch = epoch;
                Poll::Ready(Ok(value))
            }
        }
    }
}

/// Stream over the values of a [`Watcher`], see [`Watcher::stream`].
#[derive(Debug, Clone)]
pub struct WatcherStream<T> {
    watcher: Watcher<T>,
}

impl<T: Clone + Eq> Stream for WatcherStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(shared) = self.watcher.shared.upgrade() else {
            return Poll::Ready(None);
        };
        match shared.poll_updated(cx, self.watcher.epoch) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((epoch, value)) => {
                self.watcher.epoch = epoch;
                Poll::Ready(Some(value))
            }
        }
    }
}
