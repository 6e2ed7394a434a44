use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, warn};

use super::blocking::{BlockingOperation, panic_message};
use super::metrics::{METRICS, Occupancy};
use crate::error::ControlError;

/// Positional results of a batch run plus the per-operation failures that
/// produced `None` slots.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<Option<T>>,
    pub warnings: Vec<String>,
}

impl<T> BatchOutcome<T> {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    pub fn partial_failure(&self) -> Option<ControlError> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(ControlError::PartialFailure {
                warnings: self.warnings.clone(),
            })
        }
    }
}

struct BatchSlots<T> {
    values: Vec<Option<T>>,
    errors: Vec<String>,
    abandoned: bool,
}

/// Runs many independent engine calls in contiguous batches, one worker per
/// batch, yielding to the scheduler between batches.
#[derive(Debug, Clone)]
pub struct BatchBridge {
    batch_size: usize,
    timeout_per_batch: Duration,
    pool_size: usize,
}

impl BatchBridge {
    pub fn new(batch_size: usize, timeout_per_batch: Duration, pool_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            timeout_per_batch,
            pool_size: pool_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn run_batch<T: Send + 'static>(
        &self,
        description: &str,
        operations: Vec<BlockingOperation<T>>,
    ) -> BatchOutcome<T> {
        self.run_batch_with(description, operations, self.batch_size, self.timeout_per_batch)
            .await
    }

    /// Output slot `i` always belongs to operation `i`. A failing or timed out
    /// operation leaves `None` and never aborts the remaining batches.
    pub async fn run_batch_with<T: Send + 'static>(
        &self,
        description: &str,
        operations: Vec<BlockingOperation<T>>,
        batch_size: usize,
        timeout_per_batch: Duration,
    ) -> BatchOutcome<T> {
        let batch_size = batch_size.max(1);
        let total = operations.len();
        let mut results: Vec<Option<T>> = Vec::with_capacity(total);
        let mut warnings = Vec::new();
        let mut pending = operations.into_iter();

        loop {
            let batch: Vec<BlockingOperation<T>> = pending.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let start = results.len();
            let end = start + batch.len();
            METRICS.calls_started.add(batch.len() as u64, &[]);

            let slots = Arc::new(Mutex::new(BatchSlots {
                values: (0..batch.len()).map(|_| None).collect(),
                errors: Vec::new(),
                abandoned: false,
            }));
            let worker_slots = Arc::clone(&slots);
            let occupancy = Occupancy::enter(self.pool_size);
            let handle = tokio::task::spawn_blocking(move || {
                let _occupancy = occupancy;
                for (index, op) in batch.into_iter().enumerate() {
                    if worker_slots.lock().unwrap_or_else(PoisonError::into_inner).abandoned {
                        break;
                    }
                    let op_description = op.description().to_string();
                    let outcome = catch_unwind(AssertUnwindSafe(move || op.invoke()));
                    let mut slots = worker_slots.lock().unwrap_or_else(PoisonError::into_inner);
                    if slots.abandoned {
                        break;
                    }
                    match outcome {
                        Ok(Ok(value)) => slots.values[index] = Some(value),
                        Ok(Err(err)) => slots.errors.push(format!("{op_description}: {err:#}")),
                        Err(payload) => slots.errors.push(format!(
                            "{op_description}: worker panicked: {}",
                            panic_message(payload.as_ref())
                        )),
                    }
                }
            });

            let timed_out = match tokio::time::timeout(timeout_per_batch, handle).await {
                Ok(Ok(())) => false,
                Ok(Err(join_err)) => {
                    error!("{description} batch {start}-{end} worker failed: {join_err}");
                    false
                }
                Err(_) => true,
            };

            // the guard must be gone before the yield below
            let values = {
                let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                if timed_out {
                    slots.abandoned = true;
                    METRICS.calls_timed_out.add(1, &[]);
                    let msg = format!(
                        "{description} batch {start}-{end} exceeded {}ms timeout",
                        timeout_per_batch.as_millis()
                    );
                    error!("{msg}");
                    warnings.push(msg);
                }
                for err in slots.errors.drain(..) {
                    warn!("Batch operation failed: {err}");
                    METRICS.calls_failed.add(1, &[]);
                    warnings.push(err);
                }
                std::mem::take(&mut slots.values)
            };
            METRICS
                .calls_succeeded
                .add(values.iter().filter(|v| v.is_some()).count() as u64, &[]);
            results.extend(values);

            tokio::task::yield_now().await;
        }

        debug_assert_eq!(results.len(), total);
        BatchOutcome { results, warnings }
    }
}
