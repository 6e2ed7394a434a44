use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::ParameterInfo;
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    Linear,
    Exponential,
    Sine,
    RandomWalk,
}

impl FromStr for CurveKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(CurveKind::Linear),
            "exponential" => Ok(CurveKind::Exponential),
            "sine" => Ok(CurveKind::Sine),
            "random_walk" | "random-walk" => Ok(CurveKind::RandomWalk),
            other => Err(ControlError::invalid(format!("unknown automation type `{other}`"))),
        }
    }
}

impl fmt::Display for CurveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CurveKind::Linear => "linear",
            CurveKind::Exponential => "exponential",
            CurveKind::Sine => "sine",
            CurveKind::RandomWalk => "random_walk",
        })
    }
}

/// A curve with all of its endpoints resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Curve {
    Linear { start: f64, end: f64 },
    Exponential { start: f64, end: f64 },
    Sine { min: f64, max: f64, frequency: f64 },
    RandomWalk { start: f64, min: f64, max: f64 },
}

impl Curve {
    /// Build a curve from caller keyframes, falling back to the parameter's
    /// range and current value where keyframes are absent.
    ///
    /// Keyframes are `[start, end]` for linear/exponential and
    /// `[min, max, frequency?]` for sine. Random walk ignores keyframes.
    pub fn resolve(kind: CurveKind, keyframes: Option<&[f64]>, info: &ParameterInfo) -> ControlResult<Self> {
        let keys = keyframes.unwrap_or(&[]);
        check_keyframes(keys)?;
        let pair = if keys.len() >= 2 { Some((keys[0], keys[1])) } else { None };

        let curve = match kind {
            CurveKind::Linear => {
                let (start, end) = pair.unwrap_or((info.current, info.max));
                Curve::Linear { start, end }
            }
            CurveKind::Exponential => {
                let (start, end) = pair.unwrap_or((info.min, info.max));
                Curve::Exponential { start, end }
            }
            CurveKind::Sine => {
                let (min, max) = pair.unwrap_or((info.min, info.max));
                let frequency = if pair.is_some() {
                    keys.get(2).copied().unwrap_or(1.0)
                } else {
                    1.0
                };
                if frequency <= 0.0 {
                    return Err(ControlError::invalid("sine frequency must be positive"));
                }
                Curve::Sine { min, max, frequency }
            }
            CurveKind::RandomWalk => Curve::RandomWalk {
                start: info.current.clamp(info.min, info.max),
                min: info.min,
                max: info.max,
            },
        };
        Ok(curve)
    }

    pub fn kind(&self) -> CurveKind {
        match self {
            Curve::Linear { .. } => CurveKind::Linear,
            Curve::Exponential { .. } => CurveKind::Exponential,
            Curve::Sine { .. } => CurveKind::Sine,
            Curve::RandomWalk { .. } => CurveKind::RandomWalk,
        }
    }

    pub fn sampler(&self) -> CurveSampler {
        let current = match *self {
            Curve::RandomWalk { start, .. } => start,
            _ => 0.0,
        };
        CurveSampler {
            curve: *self,
            current,
            rng: StdRng::from_os_rng(),
        }
    }

    /// First values the curve will produce, for display. Random walks are
    /// not previewed beyond their starting point.
    pub fn preview(&self, steps: usize, resolution_secs: f64, limit: usize) -> Vec<f64> {
        if let Curve::RandomWalk { start, .. } = self {
            return vec![*start];
        }
        let mut sampler = self.sampler();
        (0..steps.min(limit))
            .map(|i| round3(sampler.value_at(i, steps, i as f64 * resolution_secs)))
            .collect()
    }
}

pub fn check_keyframes(keys: &[f64]) -> ControlResult<()> {
    match keys.iter().find(|v| !v.is_finite()) {
        Some(bad) => Err(ControlError::invalid(format!("keyframe value {bad} is not finite"))),
        None => Ok(()),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Step-by-step value source for one automation run. Random walk carries
/// its position across steps.
pub struct CurveSampler {
    curve: Curve,
    current: f64,
    rng: StdRng,
}

impl CurveSampler {
    pub fn value_at(&mut self, step: usize, steps: usize, elapsed_secs: f64) -> f64 {
        let progress = if steps == 0 { 0.0 } else { step as f64 / steps as f64 };
        match self.curve {
            Curve::Linear { start, end } => start + (end - start) * progress,
            Curve::Exponential { start, end } => start + (end - start) * progress * progress,
            Curve::Sine { min, max, frequency } => {
                min + (max - min) * (0.5 + 0.5 * (2.0 * PI * frequency * elapsed_secs).sin())
            }
            Curve::RandomWalk { min, max, .. } => {
                let step_size = (max - min) * 0.05;
                let delta = if step_size > 0.0 {
                    self.rng.random_range(-step_size..=step_size)
                } else {
                    0.0
                };
                self.current = (self.current + delta).clamp(min, max);
                self.current
            }
        }
    }
}
