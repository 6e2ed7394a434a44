//! Long-lived parameter automation, morphing and recording.
//!
//! Processes run as background tasks that outlive the request which started
//! them. Every engine write goes through the bridges, so a stuck engine call
//! only stalls the process that issued it.

mod curve;
mod engine;
mod params;
mod process;
mod recording;

pub use curve::{Curve, CurveKind, CurveSampler};
pub use engine::{AutomationEngine, STEP_RESOLUTION, StartedAutomation};
pub use params::{ParameterChange, RandomizeReport, StartedMorph};
pub use process::{AutomationProcess, AutomationTarget, ProcessKind, ProcessState};
pub use recording::{RecordingSession, RecordingStatus, RecordingSummary, Sample};
