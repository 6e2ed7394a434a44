use std::any::Any;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::task::JoinError;
use tracing::{debug, error};

use super::metrics::{METRICS, Occupancy};
use crate::error::{ControlError, ControlResult};

type BlockingCall<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>;

/// One blocking call: the callable with its arguments captured, an optional
/// timeout override and a description used in logs and errors.
pub struct BlockingOperation<T> {
    description: String,
    timeout: Option<Duration>,
    call: BlockingCall<T>,
}

impl<T> BlockingOperation<T> {
    pub fn new<F>(description: impl Into<String>, call: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            description: description.into(),
            timeout: None,
            call: Box::new(call),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn invoke(self) -> anyhow::Result<T> {
        (self.call)()
    }
}

impl<T> fmt::Debug for BlockingOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingOperation")
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runs engine calls on the runtime's blocking pool so the scheduler thread
/// never waits on native code.
///
/// A timeout only ends the caller's wait. The worker keeps running the
/// native call to completion and stays counted in [`super::in_flight`].
#[derive(Debug, Clone)]
pub struct BlockingBridge {
    default_timeout: Duration,
    pool_size: usize,
}

impl BlockingBridge {
    pub fn new(default_timeout: Duration, pool_size: usize) -> Self {
        Self {
            default_timeout,
            pool_size: pool_size.max(1),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub async fn run<T: Send + 'static>(&self, op: BlockingOperation<T>) -> ControlResult<T> {
        let timeout = op.timeout.unwrap_or(self.default_timeout);
        self.run_with_timeout(op, timeout).await
    }

    #[tracing::instrument(
        name = "blocking_call",
        skip(self, op),
        fields(description = %op.description, timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn run_with_timeout<T: Send + 'static>(
        &self,
        op: BlockingOperation<T>,
        timeout: Duration,
    ) -> ControlResult<T> {
        let description = op.description.clone();
        METRICS.calls_started.add(1, &[]);
        let started = Instant::now();

        let occupancy = Occupancy::enter(self.pool_size);
        let handle = tokio::task::spawn_blocking(move || {
            let _occupancy = occupancy;
            op.invoke()
        });

        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(ControlError::OperationFailure {
                description: description.clone(),
                message: format!("{err:#}"),
            }),
            Ok(Err(join_err)) => Err(ControlError::OperationFailure {
                description: description.clone(),
                message: join_error_message(join_err),
            }),
            Err(_) => Err(ControlError::Timeout {
                description: description.clone(),
                timeout,
            }),
        };

        let elapsed = started.elapsed().as_secs_f64() * 1_000.0;
        METRICS.call_latency_ms.record(elapsed, &[]);
        match &outcome {
            Ok(_) => {
                METRICS.calls_succeeded.add(1, &[]);
                debug!("{description} completed in {elapsed:.1} ms");
            }
            Err(ControlError::Timeout { .. }) => {
                METRICS.calls_timed_out.add(1, &[]);
                error!("{description} exceeded {}ms timeout", timeout.as_millis());
            }
            Err(err) => {
                METRICS.calls_failed.add(1, &[]);
                error!("{err}");
            }
        }
        outcome
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("worker panicked: {}", panic_message(err.into_panic().as_ref()))
    } else {
        "worker was cancelled".to_string()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
