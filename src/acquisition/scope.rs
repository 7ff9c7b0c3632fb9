//! Oscilloscope acquisition (Tektronix TBS1000C command set)
//!
//! A batch starts with one-time setup: response headers off, informational
//! scale queries and the edge trigger. Each capture then arms a single
//! sequence, polls `ACQuire:STATE?` until the scope reports stopped, and
//! fetches `CURVe?` as a 16-bit big-endian binary block.
//!
//! The data source, record window and encoding are programmed on the first
//! capture only; the `WFMOutpre?` preamble read at that point is cached and
//! reused for the rest of the batch. Every fetch still checks the decoded
//! sample count against the cached preamble, so a record length that drifts
//! mid-batch ends the batch with `LengthMismatch`.

use super::{AcquisitionController, InstrumentFamily, TraceBatch};
use crate::block::{self, BlockFormat, SampleEncoding};
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

/// Record length requested when no point count is configured.
pub const DEFAULT_RECORD_POINTS: usize = 10_000;

/// Captures between progress log lines.
const PROGRESS_EVERY: usize = 10;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Analog input channel (1..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    /// Validate a channel number.
    pub fn new(channel: u8) -> AcqResult<Self> {
        if (1..=4).contains(&channel) {
            Ok(Self(channel))
        } else {
            Err(AcqError::ConfigurationRejected(format!(
                "Channel {} out of range (1-4)",
                channel
            )))
        }
    }

    /// Channel number.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

impl TryFrom<u8> for Channel {
    type Error = AcqError;

    fn try_from(value: u8) -> AcqResult<Self> {
        Self::new(value)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Edge trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Slope {
    /// Rising edge.
    #[default]
    Rise,
    /// Falling edge.
    Fall,
}

impl Slope {
    /// SCPI keyword for `TRIGger:A:EDGE:SLOpe`.
    pub fn scpi(self) -> &'static str {
        match self {
            Slope::Rise => "RISE",
            Slope::Fall => "FALL",
        }
    }
}

impl fmt::Display for Slope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

impl FromStr for Slope {
    type Err = AcqError;

    fn from_str(s: &str) -> AcqResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RISE" | "RISING" => Ok(Slope::Rise),
            "FALL" | "FALLING" => Ok(Slope::Fall),
            other => Err(AcqError::ConfigurationRejected(format!(
                "Invalid trigger slope '{}' (RISE or FALL)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Slope {
    type Error = AcqError;

    fn try_from(value: String) -> AcqResult<Self> {
        value.parse()
    }
}

impl From<Slope> for String {
    fn from(slope: Slope) -> Self {
        slope.scpi().to_string()
    }
}

/// Edge trigger configuration, applied once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Trigger source channel.
    #[serde(default)]
    pub channel: Channel,
    /// Trigger level in volts.
    #[serde(default)]
    pub level_volts: f64,
    /// Edge slope.
    #[serde(default)]
    pub slope: Slope,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            level_volts: 0.0,
            slope: Slope::Rise,
        }
    }
}

/// Requested oscilloscope batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeParams {
    /// Channel whose curve is fetched.
    #[serde(default)]
    pub channel: Channel,
    /// Record points per capture; `None` requests the full record.
    #[serde(default)]
    pub points: Option<usize>,
    /// Edge trigger.
    #[serde(default)]
    pub trigger: TriggerSettings,
    /// Number of captures in the batch.
    #[serde(default = "default_captures")]
    pub captures: usize,
    /// Longest wait for one trigger.
    #[serde(default = "default_trigger_timeout", with = "humantime_serde")]
    pub trigger_timeout: Duration,
    /// Interval between `ACQuire:STATE?` polls.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

fn default_captures() -> usize {
    1
}

fn default_trigger_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

impl Default for ScopeParams {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            points: None,
            trigger: TriggerSettings::default(),
            captures: default_captures(),
            trigger_timeout: default_trigger_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn is_stopped(state: &str) -> bool {
    // Tolerates a leading header if HEADer OFF was not honoured.
    state.split_whitespace().last() == Some("0")
}

/// Poll `ACQuire:STATE?` until the scope reports a stopped acquisition.
///
/// Returns `TriggerTimeout` once `timeout` has elapsed on `clock` without a
/// stop, never earlier. The last sleep is shortened so the final poll lands
/// exactly on the deadline.
pub fn wait_for_trigger(
    session: &mut InstrumentSession,
    clock: &dyn Clock,
    timeout: Duration,
    poll_interval: Duration,
) -> AcqResult<()> {
    let step = poll_interval.max(MIN_POLL_INTERVAL);
    let start = clock.now();
    let mut polls = 0usize;
    loop {
        let state = session.query("ACQuire:STATE?")?;
        polls += 1;
        if is_stopped(&state) {
            debug!("Triggered after {} polls", polls);
            return Ok(());
        }
        let waited = clock.now().saturating_duration_since(start);
        if waited >= timeout {
            return Err(AcqError::TriggerTimeout { waited });
        }
        clock.sleep(step.min(timeout - waited));
    }
}

/// Controller for the oscilloscope family.
pub struct ScopeController {
    params: ScopeParams,
    clock: Arc<dyn Clock>,
    preamble: Option<Preamble>,
}

impl ScopeController {
    /// Create a controller for `params`.
    pub fn new(params: ScopeParams, clock: Arc<dyn Clock>) -> Self {
        Self {
            params,
            clock,
            preamble: None,
        }
    }

    /// Requested settings.
    pub fn params(&self) -> &ScopeParams {
        &self.params
    }

    /// Preamble cached by the first capture of the batch.
    pub fn cached_preamble(&self) -> Option<&Preamble> {
        self.preamble.as_ref()
    }

    fn log_scales(&self, session: &mut InstrumentSession) {
        let vertical = format!("{}:SCAle?", self.params.channel);
        match session.query(&vertical) {
            Ok(scale) => info!("Vertical scale {}: {}", self.params.channel, scale),
            Err(e) => warn!("Could not read vertical scale: {}", e),
        }
        match session.query("HORizontal:SCAle?") {
            Ok(scale) => info!("Horizontal scale: {}", scale),
            Err(e) => warn!("Could not read horizontal scale: {}", e),
        }
    }

    fn setup_trigger(&self, session: &mut InstrumentSession) -> AcqResult<()> {
        let trigger = self.params.trigger;
        session.write("TRIGger:A:TYPE EDGE")?;
        session.write(&format!("TRIGger:A:EDGE:SOUrce {}", trigger.channel))?;
        session.write(&format!(
            "TRIGger:A:LEVel:{} {}",
            trigger.channel, trigger.level_volts
        ))?;
        session.write(&format!("TRIGger:A:EDGE:SLOpe {}", trigger.slope))?;
        session.write("TRIGger:A:MODe NORMAL")?;
        info!(
            "Trigger set: {}, {}V, {} edge",
            trigger.channel, trigger.level_volts, trigger.slope
        );
        Ok(())
    }

    /// Program the data source and read the preamble, or reuse the cached one.
    fn preamble(&mut self, session: &mut InstrumentSession) -> AcqResult<Preamble> {
        if let Some(preamble) = &self.preamble {
            return Ok(preamble.clone());
        }
        let points = self.params.points.unwrap_or(DEFAULT_RECORD_POINTS);
        session.write(&format!("DATa:SOUrce {}", self.params.channel))?;
        session.write("DATa:STARt 1")?;
        session.write(&format!("DATa:STOP {}", points))?;
        session.write("DATa:ENCdg RPBinary")?;
        session.write("DATa:WIDth 2")?;
        let preamble = Preamble::parse_wfmoutpre(&session.query("WFMOutpre?")?)?;
        debug!("Cached waveform preamble: {:?}", preamble);
        self.preamble = Some(preamble.clone());
        Ok(preamble)
    }

    fn capture(&mut self, session: &mut InstrumentSession) -> AcqResult<PhysicalTrace> {
        self.acquire(session)?;
        self.fetch(session)
    }
}

impl AcquisitionController for ScopeController {
    fn family(&self) -> InstrumentFamily {
        InstrumentFamily::Oscilloscope
    }

    fn configure(&mut self, session: &mut InstrumentSession) -> AcqResult<()> {
        session.write("HEADer OFF")?;
        self.preamble = None;
        self.log_scales(session);
        self.setup_trigger(session)
    }

    fn acquire(&mut self, session: &mut InstrumentSession) -> AcqResult<()> {
        session.write("ACQuire:STATE RUN")?;
        session.write("ACQuire:STOPAfter SEQUENCE")?;
        wait_for_trigger(
            session,
            self.clock.as_ref(),
            self.params.trigger_timeout,
            self.params.poll_interval,
        )
    }

    fn fetch(&mut self, session: &mut InstrumentSession) -> AcqResult<PhysicalTrace> {
        let preamble = self.preamble(session)?;
        let raw = session.query_raw("CURVe?")?;
        let samples = block::decode(&raw, BlockFormat::Binary(SampleEncoding::I16_BE))?;
        scaling::scale(samples, &preamble)
    }

    fn run(&mut self, session: &mut InstrumentSession) -> AcqResult<TraceBatch> {
        let captures = self.params.captures;
        let span = info_span!(
            "scope_batch",
            channel = %self.params.channel,
            captures = captures
        );
        let _enter = span.enter();

        self.configure(session)?;
        info!(
            "Capturing {} traces from {} ({} points each)",
            captures,
            self.params.channel,
            self.params.points.unwrap_or(DEFAULT_RECORD_POINTS)
        );

        let mut batch = TraceBatch::new(captures);
        let start = self.clock.now();
        for i in 0..captures {
            match self.capture(session) {
                Ok(trace) => {
                    batch.traces.push(trace);
                    if (i + 1) % PROGRESS_EVERY == 0 {
                        let elapsed = self.clock.now().saturating_duration_since(start);
                        info!(
                            "Progress: {}/{} traces ({:.1} traces/sec)",
                            i + 1,
                            captures,
                            rate(i + 1, elapsed)
                        );
                    }
                }
                Err(e) => {
                    match &e {
                        AcqError::TriggerTimeout { .. } => {
                            warn!("Timeout! No trigger received for trace {}", i + 1)
                        }
                        other => warn!("Error capturing trace {}: {}", i + 1, other),
                    }
                    batch.stop_reason = Some(e);
                    break;
                }
            }
        }

        let elapsed = self.clock.now().saturating_duration_since(start);
        info!(
            "Capture complete: {}/{} traces in {:.2?} ({:.1} traces/sec)",
            batch.len(),
            captures,
            elapsed,
            rate(batch.len(), elapsed)
        );
        Ok(batch)
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::clock::ManualClock;

    fn preamble_reply(points: usize) -> String {
        format!(
            "2;16;BIN;RP;MSB;\"Ch1, DC coupling, 1.0E0 V/div, 1.0E-6 s/div, {points} points, Sample mode\";{points};Y;\"s\";1.0E-8;-5.0E-6;0;\"V\";4.0E-2;0.0E0;0.0E0"
        )
    }

    fn curve(samples: &[i16]) -> Vec<u8> {
        let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_be_bytes()).collect();
        let len = payload.len().to_string();
        let mut block = format!("#{}{}", len.len(), len).into_bytes();
        block.extend_from_slice(&payload);
        block.push(b'\n');
        block
    }

    fn session(mock: &MockAdapter) -> InstrumentSession {
        InstrumentSession::from_transport(mock.clone()).unwrap()
    }

    #[test]
    fn test_channel_and_slope() {
        assert_eq!(Channel::new(4).unwrap().to_string(), "CH4");
        assert!(Channel::new(0).is_err());
        assert!(Channel::new(5).is_err());
        assert_eq!("fall".parse::<Slope>().unwrap(), Slope::Fall);
        assert!("either".parse::<Slope>().is_err());
    }

    #[test]
    fn test_wait_for_trigger_after_polls() {
        let mock = MockAdapter::new()
            .with_response("ACQuire:STATE?", "1")
            .with_response("ACQuire:STATE?", "1")
            .with_response("ACQuire:STATE?", "0");
        let mut s = session(&mock);
        let clock = ManualClock::new();
        wait_for_trigger(&mut s, &clock, Duration::from_secs(1), Duration::from_millis(10)).unwrap();
        assert_eq!(mock.count("query: ACQuire:STATE?"), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_timeout_exactly_at_deadline() {
        let mock = MockAdapter::new().with_response("ACQuire:STATE?", "1");
        let mut s = session(&mock);
        let clock = ManualClock::new();
        let timeout = Duration::from_millis(95);
        let err = wait_for_trigger(&mut s, &clock, timeout, Duration::from_millis(10)).unwrap_err();
        match err {
            AcqError::TriggerTimeout { waited } => assert_eq!(waited, timeout),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(clock.elapsed(), timeout);
        assert_eq!(*clock.sleeps().last().unwrap(), Duration::from_millis(5));
    }

    #[test]
    fn test_trigger_seen_on_final_poll_is_not_a_timeout() {
        let mock = MockAdapter::new();
        for _ in 0..10 {
            mock.add_response("ACQuire:STATE?", "1");
        }
        mock.add_response("ACQuire:STATE?", "0");
        let mut s = session(&mock);
        let clock = ManualClock::new();
        wait_for_trigger(&mut s, &clock, Duration::from_millis(100), Duration::from_millis(10)).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_configure_sets_up_trigger_once() {
        let mock = MockAdapter::new()
            .with_response("CH3:SCAle?", "1.0E0")
            .with_response("HORizontal:SCAle?", "1.0E-6");
        let mut s = session(&mock);
        let params = ScopeParams {
            channel: Channel::new(3).unwrap(),
            trigger: TriggerSettings {
                channel: Channel::new(2).unwrap(),
                level_volts: 1.5,
                slope: Slope::Fall,
            },
            ..Default::default()
        };
        let mut ctrl = ScopeController::new(params, Arc::new(ManualClock::new()));
        ctrl.configure(&mut s).unwrap();
        assert_eq!(
            mock.writes(),
            vec![
                "HEADer OFF",
                "TRIGger:A:TYPE EDGE",
                "TRIGger:A:EDGE:SOUrce CH2",
                "TRIGger:A:LEVel:CH2 1.5",
                "TRIGger:A:EDGE:SLOpe FALL",
                "TRIGger:A:MODe NORMAL",
            ]
        );
    }

    #[test]
    fn test_scale_query_failures_are_not_fatal() {
        let mock = MockAdapter::new();
        let mut s = session(&mock);
        let mut ctrl = ScopeController::new(ScopeParams::default(), Arc::new(ManualClock::new()));
        assert!(ctrl.configure(&mut s).is_ok());
    }

    #[test]
    fn test_fetch_programs_source_once_and_caches_preamble() {
        let mock = MockAdapter::new()
            .with_response("WFMOutpre?", preamble_reply(4))
            .with_raw_read(curve(&[0, 25, -25, 100]))
            .with_raw_read(curve(&[1, 2, 3, 4]));
        let mut s = session(&mock);
        let params = ScopeParams {
            points: Some(4),
            ..Default::default()
        };
        let mut ctrl = ScopeController::new(params, Arc::new(ManualClock::new()));

        let first = ctrl.fetch(&mut s).unwrap();
        assert_eq!(first.len(), 4);
        assert!((first.y()[1] - 1.0).abs() < 1e-12);
        assert!((first.y()[2] + 1.0).abs() < 1e-12);
        assert!((first.x()[0] + 5.0e-6).abs() < 1e-18);
        assert!(ctrl.cached_preamble().is_some());

        ctrl.fetch(&mut s).unwrap();
        assert_eq!(mock.count("query: WFMOutpre?"), 1);
        assert_eq!(mock.count("write: DATa:STOP 4"), 1);
        assert_eq!(mock.count("write: CURVe?"), 2);
    }

    #[test]
    fn test_full_record_when_points_unset() {
        let mock = MockAdapter::new()
            .with_response("WFMOutpre?", preamble_reply(2))
            .with_raw_read(curve(&[7, 8]));
        let mut s = session(&mock);
        let mut ctrl = ScopeController::new(ScopeParams::default(), Arc::new(ManualClock::new()));
        ctrl.fetch(&mut s).unwrap();
        assert_eq!(mock.count("write: DATa:STOP 10000"), 1);
        assert_eq!(mock.count("write: DATa:ENCdg RPBinary"), 1);
        assert_eq!(mock.count("write: DATa:WIDth 2"), 1);
    }

    #[test]
    fn test_rate_handles_zero_elapsed() {
        assert_eq!(rate(5, Duration::ZERO), 0.0);
        assert_eq!(rate(10, Duration::from_secs(2)), 5.0);
    }
}
