use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use tracing::warn;

/// Counters for every call that crosses into the engine worker pool.
pub struct BridgeMetrics {
    pub calls_started: Counter<u64>,
    pub calls_succeeded: Counter<u64>,
    pub calls_failed: Counter<u64>,
    pub calls_timed_out: Counter<u64>,
    pub call_latency_ms: Histogram<f64>,
    pub workers_busy: UpDownCounter<i64>,
}

pub static METRICS: Lazy<BridgeMetrics> = Lazy::new(|| {
    let meter = global::meter("rackctl-bridge");
    BridgeMetrics {
        calls_started: meter
            .u64_counter("blocking_calls_started")
            .with_description("Blocking engine calls handed to the worker pool")
            .build(),
        calls_succeeded: meter.u64_counter("blocking_calls_succeeded").build(),
        calls_failed: meter.u64_counter("blocking_calls_failed").build(),
        calls_timed_out: meter
            .u64_counter("blocking_calls_timed_out")
            .with_description("Calls whose caller stopped waiting; the worker may still be busy")
            .build(),
        call_latency_ms: meter
            .f64_histogram("blocking_call_latency_ms")
            .with_unit("ms")
            .build(),
        workers_busy: meter
            .i64_up_down_counter("blocking_workers_busy")
            .with_description("Workers currently executing an engine call")
            .build(),
    }
});

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Number of engine calls currently occupying a worker, including calls
/// whose caller already gave up after a timeout.
pub fn in_flight() -> usize {
    IN_FLIGHT.load(Ordering::SeqCst)
}

/// Held by a worker for as long as its engine call runs.
pub(crate) struct Occupancy;

impl Occupancy {
    pub(crate) fn enter(pool_size: usize) -> Self {
        let busy = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        METRICS.workers_busy.add(1, &[]);
        if busy > pool_size {
            warn!(
                busy,
                pool_size, "engine calls exceed worker pool size; timed out calls may be leaking workers"
            );
        }
        Occupancy
    }
}

impl Drop for Occupancy {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        METRICS.workers_busy.add(-1, &[]);
    }
}
