//! Spectrum analyser acquisition against a scripted instrument.

use std::sync::Arc;
use std::time::Duration;
use trace_capture::acquisition::{SpectrumController, SpectrumParams, TraceIndex, TraceMode};
use trace_capture::adapters::MockAdapter;
use trace_capture::clock::ManualClock;
use trace_capture::scaling::AxisUnit;
use trace_capture::{AcqError, AcquisitionController, InstrumentSession};

const RIGOL_IDN: &str = "Rigol Technologies,DSA832,DSA8A000000001,00.01.19.00.02";

fn analyser() -> MockAdapter {
    MockAdapter::new().with_response("*IDN?", RIGOL_IDN)
}

fn max_hold_params() -> SpectrumParams {
    SpectrumParams {
        start_hz: Some(2e9),
        stop_hz: Some(3e9),
        reference_level_dbm: Some(0.0),
        points: Some(5),
        trace: TraceIndex::new(1).unwrap(),
        mode: Some(TraceMode::MaxHold),
        hold_duration: Duration::from_secs(10),
        ..Default::default()
    }
}

fn run(mock: &MockAdapter, params: SpectrumParams) -> (Result<trace_capture::TraceBatch, AcqError>, ManualClock) {
    let clock = ManualClock::new();
    let mut controller = SpectrumController::new(params, Arc::new(clock.clone()));
    let session = InstrumentSession::from_transport(mock.clone()).unwrap();
    let result = session.scoped(|s| controller.run(s));
    (result, clock)
}

#[test]
fn max_hold_acquisition_end_to_end() {
    let mock = analyser()
        .with_response(":FREQuency:STARt?", "2.000000000e+09")
        .with_response(":FREQuency:STOP?", "3.000000000e+09")
        .with_response(":SWEep:POINts?", "5")
        .with_response(
            ":TRACe:DATA? TRACE1",
            "#9000000049-8.1e+01, -7.5e+01, -3.2e+01, -7.7e+01, -8.0e+01\n",
        );

    let (result, clock) = run(&mock, max_hold_params());
    let batch = result.unwrap();

    assert!(batch.is_complete());
    let trace = &batch.traces[0];
    assert_eq!(trace.x(), &[2.0e9, 2.25e9, 2.5e9, 2.75e9, 3.0e9]);
    assert_eq!(trace.y(), &[-81.0, -75.0, -32.0, -77.0, -80.0]);
    assert_eq!(trace.x_unit(), AxisUnit::Hertz);
    assert_eq!(trace.y_unit(), AxisUnit::Dbm);
    assert_eq!(trace.y_range(), Some((-81.0, -32.0)));

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
    assert_eq!(
        mock.writes(),
        vec![
            ":FREQuency:STARt 2000000000",
            ":FREQuency:STOP 3000000000",
            ":DISPlay:WINdow:TRACe:Y:SCALe:RLEVel 0",
            ":SWEep:POINts 5",
            ":TRACe1:MODE MAXHold",
            ":FORMat:TRACe:DATA ASCii",
            ":INIT:CONT ON",
            ":INIT:CONT OFF",
            ":INIT:CONT ON",
        ]
    );
    assert_eq!(mock.call_log().last().map(String::as_str), Some("close"));
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn single_sweep_with_center_span_read_back() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_query_failure(":FREQuency:STARt?", "-113,\"Undefined header\"")
        .with_response(":FREQuency:CENTer?", "1.5e9")
        .with_response(":FREQuency:SPAN?", "1e9")
        .with_response(":SWEep:POINts?", "3")
        .with_response(":TRACe:DATA? TRACE2", "-90.0,-45.5,-90.0");

    let params = SpectrumParams {
        trace: TraceIndex::new(2).unwrap(),
        mode: Some(TraceMode::Write),
        ..Default::default()
    };
    let (result, clock) = run(&mock, params);
    let trace = &result.unwrap().traces[0];

    assert_eq!(trace.x(), &[1.0e9, 1.5e9, 2.0e9]);
    assert!(clock.sleeps().is_empty());
    assert_eq!(mock.count("query: *OPC?"), 1);
    assert_eq!(mock.writes().last().map(String::as_str), Some(":INIT:CONT ON"));
}

#[test]
fn out_of_range_points_still_acquires() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_response(":FREQuency:STARt?", "1e6")
        .with_response(":FREQuency:STOP?", "3e6")
        .with_response(":SWEep:POINts?", "3")
        .with_response(":TRACe:DATA? TRACE1", "1,2,3");

    let params = SpectrumParams {
        points: Some(50),
        ..Default::default()
    };
    let (result, _) = run(&mock, params);

    assert_eq!(result.unwrap().traces[0].len(), 3);
    assert!(!mock.writes().iter().any(|w| w.starts_with(":SWEep:POINts")));
}

#[test]
fn frequency_failure_is_fatal_but_restores_and_closes() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_response(":FREQuency:STARt?", "garbage")
        .with_response(":FREQuency:CENTer?", "also garbage");

    let (result, _) = run(&mock, SpectrumParams::default());

    assert!(matches!(result, Err(AcqError::FrequencyQueryFailed(_))));
    assert_eq!(mock.writes().last().map(String::as_str), Some(":INIT:CONT ON"));
    assert_eq!(mock.count("query: :TRACe:DATA? TRACE1"), 0);
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn decode_failure_restores_continuous_sweep() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_response(":FREQuency:STARt?", "1e6")
        .with_response(":FREQuency:STOP?", "3e6")
        .with_response(":SWEep:POINts?", "3")
        .with_response(":TRACe:DATA? TRACE1", "   ");

    let (result, _) = run(&mock, SpectrumParams::default());

    assert!(matches!(result, Err(AcqError::EmptyPayload)));
    assert_eq!(mock.writes().last().map(String::as_str), Some(":INIT:CONT ON"));
}

#[test]
fn trace_read_timeout_still_restores_continuous_sweep() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_response(":FREQuency:STARt?", "1e6")
        .with_response(":FREQuency:STOP?", "3e6")
        .with_response(":SWEep:POINts?", "3")
        .with_query_failure(":TRACe:DATA? TRACE1", "VI_ERROR_TMO (timeout expired)");

    let (result, _) = run(&mock, SpectrumParams::default());

    assert!(matches!(result, Err(AcqError::Transport(_))));
    assert_eq!(mock.count("write: :INIT:CONT ON"), 1);
    assert_eq!(mock.writes().last().map(String::as_str), Some(":INIT:CONT ON"));
    assert_eq!(mock.close_count(), 1);
}

#[test]
fn failed_restore_write_does_not_mask_the_error() {
    let mock = analyser()
        .with_response("*OPC?", "1")
        .with_query_failure(":FREQuency:STARt?", "timeout")
        .with_query_failure(":FREQuency:CENTer?", "timeout")
        .with_write_failure(":INIT:CONT ON", "timeout");

    let (result, _) = run(&mock, SpectrumParams::default());

    assert!(matches!(result, Err(AcqError::FrequencyQueryFailed(_))));
    assert_eq!(mock.count("write: :INIT:CONT ON"), 1);
}

#[test]
fn incomplete_sweep_is_reported() {
    let mock = analyser().with_response("*OPC?", "0");

    let (result, _) = run(&mock, SpectrumParams::default());

    assert!(matches!(
        result,
        Err(AcqError::UnexpectedResponse { ref command, .. }) if command == "*OPC?"
    ));
    assert_eq!(mock.writes().last().map(String::as_str), Some(":INIT:CONT ON"));
}
