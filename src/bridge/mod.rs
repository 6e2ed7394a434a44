//! Bridges between the cooperative scheduler and the blocking engine API.

mod batch;
mod blocking;
mod metrics;

pub use batch::{BatchBridge, BatchOutcome};
pub use blocking::{BlockingBridge, BlockingOperation};
pub use metrics::{BridgeMetrics, METRICS, in_flight};
