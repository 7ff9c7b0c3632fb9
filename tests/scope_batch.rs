//! Oscilloscope batch capture against a scripted instrument.

use std::sync::Arc;
use std::time::Duration;
use trace_capture::acquisition::{Channel, ScopeController, ScopeParams, Slope, TriggerSettings};
use trace_capture::adapters::MockAdapter;
use trace_capture::clock::ManualClock;
use trace_capture::{AcqError, AcquisitionController, InstrumentSession, TraceBatch};

const TEK_IDN: &str = "TEKTRONIX,TBS1052C,C010000,CF:91.1CT FV:v1.27.21";

fn preamble(points: usize) -> String {
    format!(
        "2;16;BIN;RP;MSB;\"Ch1, DC coupling, 5.0E-1 V/div, 1.0E-6 s/div, {points} points, Sample mode\";{points};Y;\"s\";1.0E-8;-2.0E-6;0;\"V\";2.0E-2;0.0E0;0.0E0"
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

fn scope(points: usize) -> MockAdapter {
    MockAdapter::new()
        .with_response("*IDN?", TEK_IDN)
        .with_response("CH1:SCAle?", "5.0E-1")
        .with_response("HORizontal:SCAle?", "1.0E-6")
        .with_response("ACQuire:STATE?", "0")
        .with_response("WFMOutpre?", preamble(points))
}

fn params(captures: usize) -> ScopeParams {
    ScopeParams {
        channel: Channel::new(1).unwrap(),
        points: Some(3),
        trigger: TriggerSettings {
            channel: Channel::new(2).unwrap(),
            level_volts: 1.5,
            slope: Slope::Rise,
        },
        captures,
        trigger_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    }
}

fn run_batch(mock: &MockAdapter, params: ScopeParams) -> (Result<TraceBatch, AcqError>, ScopeController, ManualClock) {
    let clock = ManualClock::new();
    let mut controller = ScopeController::new(params, Arc::new(clock.clone()));
    let session = InstrumentSession::from_transport(mock.clone()).unwrap();
    let result = session.scoped(|s| controller.run(s));
    (result, controller, clock)
}

#[test]
fn batch_caches_preamble_and_scales_every_capture() {
    let mock = scope(3);
    for i in 0..20i16 {
        mock.add_raw_read(curve(&[i, -i, 50]));
    }

    let (result, controller, _) = run_batch(&mock, params(20));
    let batch = result.unwrap();

    assert!(batch.is_complete());
    assert_eq!(batch.len(), 20);
    assert_eq!(mock.count("query: WFMOutpre?"), 1);
    assert_eq!(mock.count("write: DATa:SOUrce CH1"), 1);
    assert_eq!(mock.count("write: DATa:STOP 3"), 1);
    assert_eq!(mock.count("write: CURVe?"), 20);
    assert_eq!(mock.count("write: ACQuire:STATE RUN"), 20);
    assert_eq!(mock.count("write: TRIGger:A:TYPE EDGE"), 1);
    assert!(controller.cached_preamble().is_some());

    let last = &batch.traces[19];
    assert_eq!(last.y(), &[19.0 * 0.02, -19.0 * 0.02, 1.0]);
    assert_eq!(batch.x(), Some(&[-2.0e-6, 1.0e-8 - 2.0e-6, 2.0e-8 - 2.0e-6][..]));
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn trigger_setup_precedes_first_arm() {
    let mock = scope(3).with_raw_read(curve(&[1, 2, 3]));

    let (result, _, _) = run_batch(&mock, params(1));
    result.unwrap();

    let writes = mock.writes();
    let arm = writes.iter().position(|w| w == "ACQuire:STATE RUN").unwrap();
    let expected = [
        "HEADer OFF",
        "TRIGger:A:TYPE EDGE",
        "TRIGger:A:EDGE:SOUrce CH2",
        "TRIGger:A:LEVel:CH2 1.5",
        "TRIGger:A:EDGE:SLOpe RISE",
        "TRIGger:A:MODe NORMAL",
    ];
    assert_eq!(&writes[..arm], &expected[..]);
    assert_eq!(writes[arm + 1], "ACQuire:STOPAfter SEQUENCE");
}

#[test]
fn trigger_timeout_keeps_captured_traces() {
    let mock = scope(3)
        .with_raw_read(curve(&[1, 2, 3]))
        .with_raw_read(curve(&[4, 5, 6]));
    mock.add_response("ACQuire:STATE?", "0");
    mock.add_response("ACQuire:STATE?", "1");

    let (result, _, clock) = run_batch(&mock, params(5));
    let batch = result.unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.requested, 5);
    assert!(!batch.is_complete());
    assert!(matches!(
        batch.stop_reason,
        Some(AcqError::TriggerTimeout { waited }) if waited == Duration::from_millis(100)
    ));
    assert_eq!(clock.elapsed(), Duration::from_millis(100));
    assert_eq!(mock.count("write: CURVe?"), 2);
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn record_length_drift_stops_the_batch() {
    let mock = scope(3)
        .with_raw_read(curve(&[1, 2, 3]))
        .with_raw_read(curve(&[1, 2, 3, 4]))
        .with_raw_read(curve(&[1, 2, 3]));

    let (result, _, _) = run_batch(&mock, params(3));
    let batch = result.unwrap();

    assert_eq!(batch.len(), 1);
    assert!(matches!(
        batch.stop_reason,
        Some(AcqError::LengthMismatch {
            declared: 3,
            actual: 4
        })
    ));
    assert_eq!(mock.count("query: WFMOutpre?"), 1);
}

#[test]
fn truncated_curve_stops_the_batch() {
    let mut short = curve(&[1, 2, 3]);
    short.truncate(short.len() - 3);
    let mock = scope(3).with_raw_read(short);

    let (result, _, _) = run_batch(&mock, params(2));
    let batch = result.unwrap();

    assert!(batch.is_empty());
    assert!(batch.stop_reason.as_ref().is_some_and(AcqError::is_decode_error));
}

#[test]
fn read_failure_ends_batch_and_still_closes() {
    let mock = scope(3)
        .with_raw_read(curve(&[1, 2, 3]))
        .with_raw_failure("VI_ERROR_TMO");

    let (result, _, _) = run_batch(&mock, params(4));
    let batch = result.unwrap();

    assert_eq!(batch.len(), 1);
    assert!(matches!(batch.stop_reason, Some(AcqError::Transport(_))));
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn failed_trigger_setup_aborts_before_capture() {
    let mock = scope(3).with_write_failure("TRIGger:A:MODe NORMAL", "timeout");

    let (result, _, _) = run_batch(&mock, params(2));

    assert!(matches!(result, Err(AcqError::Transport(_))));
    assert_eq!(mock.count("write: ACQuire:STATE RUN"), 0);
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn full_record_requested_when_points_unset() {
    let mock = scope(3).with_raw_read(curve(&[7, 8, 9]));
    let mut p = params(1);
    p.points = None;

    let (result, _, _) = run_batch(&mock, p);
    result.unwrap();

    assert_eq!(mock.count("write: DATa:STOP 10000"), 1);
}
