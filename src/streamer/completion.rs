//! Completion handles.
//!
//! A [`Completion`] is a cloneable, resolve-once result slot. Callers await it
//! or attach listeners; the streamer resolves it from whichever task learns
//! the outcome first. [`CompoundCompletion`] joins a dynamically growing set
//! of children into one handle.

use crate::error::{Result, StreamerError};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

static NEXT_COMPLETION_ID: AtomicU64 = AtomicU64::new(1);

type Listener<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Result<T>),
}

struct Inner<T> {
    id: u64,
    state: Mutex<State<T>>,
    notify: Notify,
}

pub struct Completion<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Completion<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Completion<T> {}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Completion")
            .field("id", &self.inner.id)
            .field("done", &done)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Completion {
            inner: Arc::new(Inner {
                id: NEXT_COMPLETION_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    /// Process-unique identity of this handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Resolves the handle. Only the first call has any effect; returns
    /// whether this call was it. Listeners run on the calling task.
    pub fn complete(&self, result: Result<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            let listeners = match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => std::mem::take(listeners),
            };
            *state = State::Done(result.clone());
            listeners
        };
        self.inner.notify.notify_waiters();
        for listener in listeners {
            listener(&result);
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, err: StreamerError) -> bool {
        self.complete(Err(err))
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// The outcome, if resolved.
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.inner.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Runs `f` once the handle resolves, or right away if it already has.
    pub fn listen(&self, f: impl FnOnce(&Result<T>) + Send + 'static) {
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(f));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        f(&done);
    }

    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Waits at most `timeout`; `None` if still pending afterwards.
    pub async fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[derive(Default)]
struct CompoundState {
    pending: usize,
    initialized: bool,
    first_error: Option<StreamerError>,
}

impl CompoundState {
    fn outcome(&self) -> Option<Result<()>> {
        if !self.initialized || self.pending > 0 {
            return None;
        }
        Some(match &self.first_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        })
    }
}

/// Join over child handles.
///
/// Children may be added until [`mark_initialized`](Self::mark_initialized);
/// after that the compound resolves once every child has, with the first
/// child error if any. A fail-fast compound resolves on the first error.
#[derive(Clone)]
pub struct CompoundCompletion {
    result: Completion<()>,
    state: Arc<Mutex<CompoundState>>,
    fail_fast: bool,
}

impl Default for CompoundCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl CompoundCompletion {
    pub fn new() -> Self {
        CompoundCompletion {
            result: Completion::new(),
            state: Arc::new(Mutex::new(CompoundState::default())),
            fail_fast: false,
        }
    }

    pub fn fail_fast() -> Self {
        CompoundCompletion {
            fail_fast: true,
            ..Self::new()
        }
    }

    pub fn add<T: Clone + Send + 'static>(&self, child: &Completion<T>) {
        self.state.lock().pending += 1;

        let state = self.state.clone();
        let result = self.result.clone();
        let fail_fast = self.fail_fast;
        child.listen(move |outcome| {
            let resolved = {
                let mut st = state.lock();
                st.pending -= 1;
                match outcome {
                    Err(e) if fail_fast => Some(Err(e.clone())),
                    Err(e) => {
                        if st.first_error.is_none() {
                            st.first_error = Some(e.clone());
                        }
                        st.outcome()
                    }
                    Ok(_) => st.outcome(),
                }
            };
            if let Some(resolved) = resolved {
                result.complete(resolved);
            }
        });
    }

    /// No more children will be added.
    pub fn mark_initialized(&self) {
        let resolved = {
            let mut st = self.state.lock();
            st.initialized = true;
            st.outcome()
        };
        if let Some(resolved) = resolved {
            self.result.complete(resolved);
        }
    }

    pub fn completion(&self) -> &Completion<()> {
        &self.result
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub async fn wait(&self) -> Result<()> {
        self.result.wait().await
    }
}

/// Client-visible operations that have not resolved yet.
#[derive(Default)]
pub(crate) struct ActiveOperations {
    ops: Mutex<AHashMap<u64, Completion<()>>>,
}

impl ActiveOperations {
    pub(crate) fn insert(&self, completion: &Completion<()>) {
        self.ops.lock().insert(completion.id(), completion.clone());
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.ops.lock().remove(&id).is_some()
    }

    pub(crate) fn snapshot(&self) -> Vec<Completion<()>> {
        self.ops.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.lock().len()
    }
}
