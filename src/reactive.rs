//! In-process publish/subscribe primitive: `Observable`, `Subject`,
//! `BehaviorSubject`, `Subscription`.
//!
//! Delivery on `next`/`error`/`complete` iterates over a snapshot of the
//! observer list taken under the lock, so an observer unsubscribing from
//! inside its own callback (or from another thread, concurrently) never
//! panics and never observes a value delivered after it unsubscribed.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::{Error, Result};

type NextFn<T> = Box<dyn Fn(&T) + Send + 'static>;
type ErrorFn = Box<dyn Fn(&Error) + Send + 'static>;
type CompleteFn = Box<dyn FnMut() + Send + 'static>;

/// Observer callbacks: `on_next`, `on_error`, `on_complete`, all optional.
#[derive(Default)]
pub struct Observer<T> {
    pub on_next: Option<NextFn<T>>,
    pub on_error: Option<ErrorFn>,
    pub on_complete: Option<CompleteFn>,
}

impl<T> Observer<T> {
    pub fn on_next(f: impl Fn(&T) + Send + 'static) -> Self {
        Self {
            on_next: Some(Box::new(f)),
            on_error: None,
            on_complete: None,
        }
    }
}

struct Inner<T> {
    next_key: u64,
    observers: Vec<(u64, Observer<T>)>,
    completed: bool,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            next_key: 0,
            observers: Vec::new(),
            completed: false,
        }
    }
}

/// A handle returned by `subscribe`. `unsubscribe` is idempotent: calling
/// it twice (or after the subject itself is dropped) is a no-op.
pub struct Subscription<T> {
    key: u64,
    subject: std::sync::Weak<Mutex<Inner<T>>>,
    closed: bool,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(subject) = self.subject.upgrade() {
            if let Ok(mut inner) = subject.lock() {
                inner.observers.retain(|(k, _)| *k != self.key);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Multicasting subject. Subscribing the same observer object twice (by
/// constructing two `Observer`s with the same closures) yields two
/// independent `Subscription`s, each removable on its own.
pub struct Subject<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Subject<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription<T> {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("subject lock poisoned, returning an already-closed subscription");
            return Subscription {
                key: 0,
                subject: std::sync::Weak::new(),
                closed: true,
            };
        };
        let key = inner.next_key;
        inner.next_key += 1;
        inner.observers.push((key, observer));
        Subscription {
            key,
            subject: Arc::downgrade(&self.inner),
            closed: false,
        }
    }

    /// Number of currently-registered observers.
    pub fn observed(&self) -> bool {
        let Ok(inner) = self.inner.lock() else {
            warn!("subject lock poisoned, reporting no observers");
            return false;
        };
        !inner.observers.is_empty()
    }

    pub fn next(&self, value: T) -> Result<()> {
        let lock_err = || Error::Poisoned("subject lock poisoned");
        let snapshot_completed = {
            let inner = self.inner.lock().map_err(|_| lock_err())?;
            inner.completed
        };
        if snapshot_completed {
            return Err(Error::SubjectAlreadyCompleted);
        }
        // Iterate by index rather than holding the lock across the whole
        // delivery: an observer's own callback may call subscribe/unsubscribe,
        // which needs the lock too. Re-checking len() each iteration means a
        // concurrent unsubscribe just shrinks the remaining range instead of
        // panicking on an out-of-bounds index.
        let mut i = 0;
        loop {
            let inner = self.inner.lock().map_err(|_| lock_err())?;
            let Some((_, observer)) = inner.observers.get(i) else {
                break;
            };
            let callback = observer.on_next.as_ref().map(|_| i);
            drop(inner);
            if callback.is_some() {
                let inner = self.inner.lock().map_err(|_| lock_err())?;
                if let Some((_, observer)) = inner.observers.get(i) {
                    if let Some(f) = &observer.on_next {
                        f(&value);
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }

    pub fn error(&self, error: Error) -> Result<()> {
        let lock_err = || Error::Poisoned("subject lock poisoned");
        {
            let inner = self.inner.lock().map_err(|_| lock_err())?;
            if inner.completed {
                return Err(Error::SubjectAlreadyCompleted);
            }
        }
        let count = self.inner.lock().map_err(|_| lock_err())?.observers.len();
        for i in 0..count {
            let inner = self.inner.lock().map_err(|_| lock_err())?;
            if let Some((_, observer)) = inner.observers.get(i) {
                if let Some(f) = &observer.on_error {
                    f(&error);
                }
            }
        }
        Ok(())
    }

    pub fn complete(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Poisoned("subject lock poisoned"))?;
        if inner.completed {
            return Err(Error::SubjectAlreadyCompleted);
        }
        inner.completed = true;
        for (_, observer) in inner.observers.iter_mut() {
            if let Some(f) = &mut observer.on_complete {
                f();
            }
        }
        Ok(())
    }
}

/// A `Subject` that retains the last emitted value and replays it
/// synchronously to new subscribers.
pub struct BehaviorSubject<T: Clone> {
    subject: Subject<T>,
    value: Arc<Mutex<T>>,
}

impl<T: Clone> BehaviorSubject<T> {
    pub fn new(initial: T) -> Self {
        Self {
            subject: Subject::new(),
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Poisoning recovers the last-written value rather than panicking or
    /// degrading to a made-up default (`T` carries no `Default` bound here).
    pub fn value(&self) -> T {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn next(&self, value: T) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| Error::Poisoned("behavior subject lock poisoned"))?;
        *guard = value.clone();
        drop(guard);
        self.subject.next(value)
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription<T> {
        if let Some(f) = &observer.on_next {
            f(&self.value());
        }
        self.subject.subscribe(observer)
    }
}
