//! Single-task ownership of mutable control tables.
//!
//! Each component keeps its records inside a [`StateOwner`]: one spawned task
//! owns the value and applies jobs sent over a channel, one at a time. No
//! component ever holds a lock on another component's tables.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::bridge::BlockingOperation;
use crate::error::{ControlError, ControlResult};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

pub struct StateOwner<S> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for StateOwner<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<S> std::fmt::Debug for StateOwner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateOwner")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> StateOwner<S> {
    /// Spawn the owning task on the current runtime.
    pub fn spawn(name: &'static str, state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        tokio::spawn(async move {
            let mut state = state;
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                    error!("{name}: state job panicked; request dropped");
                }
            }
            debug!("{name}: owner stopped");
        });
        Self { name, tx }
    }

    /// Run `f` against the owned state and wait for its result.
    pub async fn call<R, F>(&self, f: F) -> ControlResult<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |state| {
            let _ = reply_tx.send(f(state));
        });
        self.tx.send(job).map_err(|_| ControlError::Unavailable)?;
        reply_rx.await.map_err(|_| ControlError::Unavailable)
    }

    /// Fire-and-forget mutation. Jobs from one sender apply in send order.
    pub fn cast<F>(&self, f: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.tx.send(Box::new(f)).is_err() {
            warn!("{}: owner stopped, update dropped", self.name);
        }
    }
}

/// Convenience for the common "look up or fail with NotFound" pattern.
pub(crate) fn found<T>(value: Option<T>, kind: &'static str, id: impl ToString) -> ControlResult<T> {
    value.ok_or_else(|| ControlError::not_found(kind, id))
}

/// Helper for building engine operations that capture a cloned handle.
pub(crate) fn engine_op<E, T, F>(description: impl Into<String>, engine: &E, f: F) -> BlockingOperation<T>
where
    E: Clone + Send + 'static,
    F: FnOnce(E) -> anyhow::Result<T> + Send + 'static,
{
    let engine = engine.clone();
    BlockingOperation::new(description, move || f(engine))
}
