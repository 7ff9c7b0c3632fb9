//! Spectrum analyser acquisition (Rigol DSA800 command set)
//!
//! Sequence for one trace:
//!
//! 1. Configure frequency range, reference level, point count, trace mode and
//!    ASCII trace format. Settings left unset keep the instrument's value.
//! 2. Hold modes accumulate with continuous sweep for `hold_duration`; every
//!    other mode runs exactly one sweep and waits for operation complete.
//! 3. Read back start/stop (or center/span) and the sweep point count.
//! 4. Fetch `:TRACe:DATA? TRACE<n>`, decode the ASCII list and scale it.
//! 5. Re-enable continuous sweep, whatever happened before.

use super::{AcquisitionController, InstrumentFamily, TraceBatch};
use crate::block::{self, BlockFormat};
use crate::clock::Clock;
use crate::error::{AcqError, AcqResult};
use crate::scaling::{self, PhysicalTrace, Preamble};
use crate::session::InstrumentSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// Smallest sweep point count the analyser accepts.
pub const POINTS_MIN: usize = 101;

/// Largest sweep point count the analyser accepts.
pub const POINTS_MAX: usize = 3001;

/// Point count assumed when `:SWEep:POINts?` cannot be read.
pub const DEFAULT_POINTS: usize = 601;

/// Trace display/update mode (`:TRACe<n>:MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TraceMode {
    /// Clear/write: every sweep overwrites the trace.
    Write,
    /// Keep the maximum seen across sweeps.
    MaxHold,
    /// Keep the minimum seen across sweeps.
    MinHold,
    /// Freeze the current trace.
    View,
    /// Disable the trace.
    Blank,
    /// Logarithmic (video) average across sweeps.
    VideoAverage,
    /// Linear (power) average across sweeps.
    PowerAverage,
}

impl TraceMode {
    /// SCPI keyword for `:TRACe<n>:MODE`.
    pub fn scpi(self) -> &'static str {
        match self {
            TraceMode::Write => "WRITe",
            TraceMode::MaxHold => "MAXHold",
            TraceMode::MinHold => "MINHold",
            TraceMode::View => "VIEW",
            TraceMode::Blank => "BLANk",
            TraceMode::VideoAverage => "VIDeoavg",
            TraceMode::PowerAverage => "POWeravg",
        }
    }

    /// Whether the mode accumulates an extremum over several sweeps.
    pub fn is_hold(self) -> bool {
        matches!(self, TraceMode::MaxHold | TraceMode::MinHold)
    }
}

impl fmt::Display for TraceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

impl FromStr for TraceMode {
    type Err = AcqError;

    fn from_str(s: &str) -> AcqResult<Self> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "write" | "writ" | "clearwrite" => Ok(TraceMode::Write),
            "maxhold" | "maxh" => Ok(TraceMode::MaxHold),
            "minhold" | "minh" => Ok(TraceMode::MinHold),
            "view" => Ok(TraceMode::View),
            "blank" | "blan" => Ok(TraceMode::Blank),
            "videoavg" | "vid" | "videoaverage" => Ok(TraceMode::VideoAverage),
            "poweravg" | "pow" | "poweraverage" => Ok(TraceMode::PowerAverage),
            _ => Err(AcqError::ConfigurationRejected(format!(
                "Invalid trace mode '{}'. Valid options: WRITe, MAXHold, MINHold, VIEW, BLANk, VIDeoavg, POWeravg",
                s.trim()
            ))),
        }
    }
}

impl TryFrom<String> for TraceMode {
    type Error = AcqError;

    fn try_from(value: String) -> AcqResult<Self> {
        value.parse()
    }
}

impl From<TraceMode> for String {
    fn from(mode: TraceMode) -> Self {
        mode.scpi().to_string()
    }
}

/// Directly settable trace number (1..=3; trace 4 is the math trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TraceIndex(u8);

impl TraceIndex {
    /// Validate a trace number.
    pub fn new(index: u8) -> AcqResult<Self> {
        match index {
            1..=3 => Ok(Self(index)),
            4 => Err(AcqError::ConfigurationRejected(
                "Trace 4 is the math trace and cannot be acquired directly".into(),
            )),
            other => Err(AcqError::ConfigurationRejected(format!(
                "Trace number {} out of range (1-3)",
                other
            ))),
        }
    }

    /// Trace number.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Label used by `:TRACe:DATA?`, e.g. `TRACE1`.
    pub fn label(self) -> String {
        format!("TRACE{}", self.0)
    }
}

impl Default for TraceIndex {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for TraceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for TraceIndex {
    type Error = AcqError;

    fn try_from(value: u8) -> AcqResult<Self> {
        Self::new(value)
    }
}

impl From<TraceIndex> for u8 {
    fn from(index: TraceIndex) -> Self {
        index.0
    }
}

/// Frequency range request, after precedence is resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrequencySetting {
    /// `:FREQuency:STARt` / `:FREQuency:STOP`.
    StartStop {
        /// Start frequency in Hz.
        start_hz: f64,
        /// Stop frequency in Hz.
        stop_hz: f64,
    },
    /// `:FREQuency:CENTer` / `:FREQuency:SPAN`.
    CenterSpan {
        /// Center frequency in Hz.
        center_hz: f64,
        /// Span in Hz.
        span_hz: f64,
    },
}

/// Requested analyser settings for one trace.
///
/// Every `None` keeps the instrument's current setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumParams {
    /// Start frequency in Hz (used together with `stop_hz`).
    #[serde(default)]
    pub start_hz: Option<f64>,
    /// Stop frequency in Hz.
    #[serde(default)]
    pub stop_hz: Option<f64>,
    /// Center frequency in Hz (used with `span_hz` when start/stop is unset).
    #[serde(default)]
    pub center_hz: Option<f64>,
    /// Span in Hz.
    #[serde(default)]
    pub span_hz: Option<f64>,
    /// Reference level in dBm.
    #[serde(default)]
    pub reference_level_dbm: Option<f64>,
    /// Sweep points, accepted in `POINTS_MIN..=POINTS_MAX`.
    #[serde(default)]
    pub points: Option<usize>,
    /// Trace to configure and fetch.
    #[serde(default)]
    pub trace: TraceIndex,
    /// Trace mode.
    #[serde(default)]
    pub mode: Option<TraceMode>,
    /// Accumulation time for hold modes.
    #[serde(default = "default_hold_duration", with = "humantime_serde")]
    pub hold_duration: Duration,
}

fn default_hold_duration() -> Duration {
    Duration::from_secs(10)
}

impl Default for SpectrumParams {
    fn default() -> Self {
        Self {
            start_hz: None,
            stop_hz: None,
            center_hz: None,
            span_hz: None,
            reference_level_dbm: None,
            points: None,
            trace: TraceIndex::default(),
            mode: None,
            hold_duration: default_hold_duration(),
        }
    }
}

impl SpectrumParams {
    /// Frequency range to program. Start/stop wins over center/span.
    pub fn frequency_setting(&self) -> Option<FrequencySetting> {
        match (self.start_hz, self.stop_hz, self.center_hz, self.span_hz) {
            (Some(start_hz), Some(stop_hz), _, _) => {
                Some(FrequencySetting::StartStop { start_hz, stop_hz })
            }
            (_, _, Some(center_hz), Some(span_hz)) => {
                Some(FrequencySetting::CenterSpan { center_hz, span_hz })
            }
            _ => None,
        }
    }
}

/// Check a requested sweep point count against the analyser bounds.
pub fn validate_points(points: usize) -> AcqResult<usize> {
    if (POINTS_MIN..=POINTS_MAX).contains(&points) {
        Ok(points)
    } else {
        Err(AcqError::ConfigurationRejected(format!(
            "Point count {} is out of range ({}-{})",
            points, POINTS_MIN, POINTS_MAX
        )))
    }
}

/// Read back the displayed frequency range as `(start, stop)` in Hz.
///
/// Falls back to center/span; if that fails too the error is fatal.
pub fn read_frequency_span(session: &mut InstrumentSession) -> AcqResult<(f64, f64)> {
    let start_stop = session
        .query_f64(":FREQuency:STARt?")
        .and_then(|start| Ok((start, session.query_f64(":FREQuency:STOP?")?)));
    let first_err = match start_stop {
        Ok(range) => return Ok(range),
        Err(e) => e,
    };
    warn!("Could not get start/stop frequency: {}. Trying center/span", first_err);

    let center_span = session
        .query_f64(":FREQuency:CENTer?")
        .and_then(|center| Ok((center, session.query_f64(":FREQuency:SPAN?")?)));
    match center_span {
        Ok((center, span)) => Ok((center - span / 2.0, center + span / 2.0)),
        Err(second_err) => Err(AcqError::FrequencyQueryFailed(format!(
            "start/stop: {}; center/span: {}",
            first_err, second_err
        ))),
    }
}

/// Read back the sweep point count.
pub fn read_point_count(session: &mut InstrumentSession) -> AcqResult<usize> {
    let value = session
        .query_f64(":SWEep:POINts?")
        .map_err(|e| AcqError::PointCountQueryFailed(e.to_string()))?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(AcqError::PointCountQueryFailed(format!(
            "instrument reported {} points",
            value
        )))
    }
}

/// Controller for the swept spectrum analyser family.
pub struct SpectrumController {
    params: SpectrumParams,
    clock: Arc<dyn Clock>,
}

impl SpectrumController {
    /// Create a controller for `params`.
    pub fn new(params: SpectrumParams, clock: Arc<dyn Clock>) -> Self {
        Self { params, clock }
    }

    /// Requested settings.
    pub fn params(&self) -> &SpectrumParams {
        &self.params
    }

    fn accumulate(&self, session: &mut InstrumentSession, mode: TraceMode) -> AcqResult<()> {
        info!(
            "Enabling continuous sweep for {:?} to accumulate {} data",
            self.params.hold_duration, mode
        );
        session.write(":INIT:CONT ON")?;
        self.clock.sleep(self.params.hold_duration);
        info!("Wait complete. Stopping continuous sweep");
        session.write(":INIT:CONT OFF")
    }

    fn single_sweep(&self, session: &mut InstrumentSession) -> AcqResult<()> {
        info!("Starting single sweep");
        session.write(":INIT:CONT OFF")?;
        session.write(":INIT")?;
        let response = session.query("*OPC?")?;
        if response.trim() != "1" {
            return Err(AcqError::UnexpectedResponse {
                command: "*OPC?".into(),
                response,
            });
        }
        Ok(())
    }

    /// Re-enable continuous sweep whatever the outcome, unless the session is gone.
    fn restore(&self, session: &mut InstrumentSession, outcome: Option<&AcqError>) {
        if session.is_closed() {
            warn!("Not restoring continuous sweep: session already closed");
            return;
        }
        if let Some(err) = outcome.filter(|e| e.is_link_failure()) {
            warn!("Not restoring continuous sweep after connection failure: {}", err);
            return;
        }
        if let Err(e) = session.write(":INIT:CONT ON") {
            warn!("Failed to restore continuous sweep: {}", e);
        }
    }

    fn sequence(&mut self, session: &mut InstrumentSession) -> AcqResult<PhysicalTrace> {
        self.configure(session)?;
        self.acquire(session)?;
        self.fetch(session)
    }
}

impl AcquisitionController for SpectrumController {
    fn family(&self) -> InstrumentFamily {
        InstrumentFamily::SpectrumAnalyzer
    }

    fn configure(&mut self, session: &mut InstrumentSession) -> AcqResult<()> {
        match self.params.frequency_setting() {
            Some(FrequencySetting::StartStop { start_hz, stop_hz }) => {
                info!(
                    "Setting frequency range: {:.3} MHz to {:.3} MHz",
                    start_hz / 1e6,
                    stop_hz / 1e6
                );
                session.write(&format!(":FREQuency:STARt {}", start_hz))?;
                session.write(&format!(":FREQuency:STOP {}", stop_hz))?;
            }
            Some(FrequencySetting::CenterSpan { center_hz, span_hz }) => {
                info!(
                    "Setting center frequency: {:.3} MHz, span: {:.3} MHz",
                    center_hz / 1e6,
                    span_hz / 1e6
                );
                session.write(&format!(":FREQuency:CENTer {}", center_hz))?;
                session.write(&format!(":FREQuency:SPAN {}", span_hz))?;
            }
            None => debug!("Frequency range left at instrument setting"),
        }

        if let Some(level) = self.params.reference_level_dbm {
            info!("Setting reference level: {} dBm", level);
            session.write(&format!(":DISPlay:WINdow:TRACe:Y:SCALe:RLEVel {}", level))?;
        }

        if let Some(points) = self.params.points {
            match validate_points(points) {
                Ok(points) => {
                    info!("Setting number of points: {}", points);
                    session.write(&format!(":SWEep:POINts {}", points))?;
                }
                Err(e) => warn!("{}. Using current instrument setting", e),
            }
        }

        if let Some(mode) = self.params.mode {
            info!("Setting trace {} mode: {}", self.params.trace, mode);
            session.write(&format!(":TRACe{}:MODE {}", self.params.trace, mode.scpi()))?;
        }

        session.write(":FORMat:TRACe:DATA ASCii")
    }

    fn acquire(&mut self, session: &mut InstrumentSession) -> AcqResult<()> {
        match self.params.mode {
            Some(mode) if mode.is_hold() => self.accumulate(session, mode),
            _ => self.single_sweep(session),
        }
    }

    fn fetch(&mut self, session: &mut InstrumentSession) -> AcqResult<PhysicalTrace> {
        let (start_hz, stop_hz) = read_frequency_span(session)?;
        let reported_points = match read_point_count(session) {
            Ok(points) => Some(points),
            Err(e) => {
                warn!("{}. Assuming {} points", e, DEFAULT_POINTS);
                None
            }
        };
        info!(
            "Frequency range: {:.3} MHz to {:.3} MHz, {} points",
            start_hz / 1e6,
            stop_hz / 1e6,
            reported_points.unwrap_or(DEFAULT_POINTS)
        );

        let label = self.params.trace.label();
        info!("Acquiring trace data from {}", label);
        let response = session.query(&format!(":TRACe:DATA? {}", label))?;
        let samples = block::decode(response.as_bytes(), BlockFormat::Ascii)?;
        debug!("Parsed {} data points", samples.len());

        let points = match reported_points {
            Some(points) => points,
            None if samples.len() != DEFAULT_POINTS => {
                warn!(
                    "Decoded {} points with unknown sweep setting; using decoded count",
                    samples.len()
                );
                samples.len()
            }
            None => DEFAULT_POINTS,
        };
        scaling::scale(samples, &Preamble::spectrum(start_hz, stop_hz, points))
    }

    fn run(&mut self, session: &mut InstrumentSession) -> AcqResult<TraceBatch> {
        let span = info_span!(
            "spectrum_acquisition",
            trace = %self.params.trace,
            mode = ?self.params.mode
        );
        let _enter = span.enter();

        let result = self.sequence(session);
        self.restore(session, result.as_ref().err());
        let trace = result?;

        if let (Some(first), Some(last), Some((lo, hi))) =
            (trace.x().first(), trace.x().last(), trace.y_range())
        {
            info!(
                "Trace acquired: {} points, {:.6} to {:.6} MHz, amplitude {:.3} to {:.3} dBm",
                trace.len(),
                first / 1e6,
                last / 1e6,
                lo,
                hi
            );
        }

        let mut batch = TraceBatch::new(1);
        batch.traces.push(trace);
        Ok(batch)
    }
}
