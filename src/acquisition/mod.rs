//! Acquisition controllers
//!
//! One controller per instrument family. Both share the block decoder and the
//! scaling engine and differ only in how they sequence the instrument:
//!
//! - [`SpectrumController`]: configure, single sweep or hold-mode
//!   accumulation, read back span and point count, fetch one ASCII trace,
//!   restore continuous sweep.
//! - [`ScopeController`]: one-time trigger setup, then per capture arm,
//!   poll for trigger, configure once and cache the preamble, fetch one
//!   binary curve.
//!
//! ## Error Policy
//!
//! Controllers decide per step whether an error is fatal or degrades:
//! out-of-range settings and a failed point-count read-back are logged and
//! replaced; a failed frequency read-back is fatal; any oscilloscope capture
//! failure ends the batch but keeps what was already captured.

pub mod scope;
pub mod spectrum;

pub use scope::{Channel, ScopeController, ScopeParams, Slope, TriggerSettings};
pub use spectrum::{SpectrumController, SpectrumParams, TraceIndex, TraceMode};

use crate::clock::Clock;
use crate::error::{AcqError, AcqResult};
use crate::scaling::PhysicalTrace;
use crate::session::InstrumentSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Instrument class a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentFamily {
    /// Swept spectrum analyser (ASCII trace data).
    SpectrumAnalyzer,
    /// Digital storage oscilloscope (binary curve data).
    Oscilloscope,
}

impl fmt::Display for InstrumentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentFamily::SpectrumAnalyzer => f.write_str("spectrum_analyzer"),
            InstrumentFamily::Oscilloscope => f.write_str("oscilloscope"),
        }
    }
}

impl FromStr for InstrumentFamily {
    type Err = AcqError;

    fn from_str(s: &str) -> AcqResult<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "spectrum_analyzer" | "spectrum" | "sa" => Ok(InstrumentFamily::SpectrumAnalyzer),
            "oscilloscope" | "scope" => Ok(InstrumentFamily::Oscilloscope),
            other => Err(AcqError::ConfigurationRejected(format!(
                "Unknown instrument family '{}'",
                other
            ))),
        }
    }
}

/// Traces produced by one controller run.
#[derive(Debug, Default)]
pub struct TraceBatch {
    /// Successfully captured traces, in capture order.
    pub traces: Vec<PhysicalTrace>,
    /// Number of traces the caller asked for.
    pub requested: usize,
    /// Error that ended the batch early, if any.
    pub stop_reason: Option<AcqError>,
}

impl TraceBatch {
    /// Empty batch expecting `requested` traces.
    pub fn new(requested: usize) -> Self {
        Self {
            traces: Vec::with_capacity(requested),
            requested,
            stop_reason: None,
        }
    }

    /// Whether every requested trace was captured.
    pub fn is_complete(&self) -> bool {
        self.stop_reason.is_none() && self.traces.len() == self.requested
    }

    /// Number of captured traces.
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    /// True when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Independent axis shared by every trace in the batch.
    pub fn x(&self) -> Option<&[f64]> {
        self.traces.first().map(PhysicalTrace::x)
    }
}

/// Common capability of both controller families.
///
/// `run` is the full sequence; the individual steps are exposed so callers and
/// tests can drive them one at a time.
pub trait AcquisitionController {
    /// Family this controller drives.
    fn family(&self) -> InstrumentFamily;

    /// One-time instrument configuration before any capture.
    fn configure(&mut self, session: &mut InstrumentSession) -> AcqResult<()>;

    /// Bring the instrument to a state where fresh data is ready.
    fn acquire(&mut self, session: &mut InstrumentSession) -> AcqResult<()>;

    /// Fetch, decode and scale one trace.
    fn fetch(&mut self, session: &mut InstrumentSession) -> AcqResult<PhysicalTrace>;

    /// Full acquisition sequence.
    fn run(&mut self, session: &mut InstrumentSession) -> AcqResult<TraceBatch>;
}

/// Build the controller for `family`.
pub fn build_controller(
    family: InstrumentFamily,
    spectrum: &SpectrumParams,
    scope: &ScopeParams,
    clock: Arc<dyn Clock>,
) -> Box<dyn AcquisitionController> {
    match family {
        InstrumentFamily::SpectrumAnalyzer => {
            Box::new(SpectrumController::new(spectrum.clone(), clock))
        }
        InstrumentFamily::Oscilloscope => Box::new(ScopeController::new(scope.clone(), clock)),
    }
}
