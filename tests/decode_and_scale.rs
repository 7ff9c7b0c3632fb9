//! Block decoder and scaling engine behaviour seen from the public API.

use trace_capture::block::{self, BlockFormat, RawSamples, SampleEncoding};
use trace_capture::scaling::{self, frequency_axis, scale_amplitude, time_axis, Preamble};
use trace_capture::AcqError;

fn binary_block(samples: &[i16], terminator: bool) -> Vec<u8> {
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_be_bytes()).collect();
    let len = payload.len().to_string();
    let mut buf = format!("#{}{}", len.len(), len).into_bytes();
    buf.extend_from_slice(&payload);
    if terminator {
        buf.push(b'\n');
    }
    buf
}

fn scope_preamble(points: usize) -> Preamble {
    Preamble::parse_wfmoutpre(&format!(
        "2;16;BIN;RP;MSB;\"Ch1, DC coupling\";{points};Y;\"s\";1.0E-9;0.0E0;0;\"V\";2.0E0;1.0E2;5.0E0"
    ))
    .unwrap()
}

#[test]
fn ascii_list_rejoins_to_same_values() {
    let values = [-87.25, -3.5e1, 0.0, 12.125, -1.0e-3];
    let joined = values
        .iter()
        .map(|v| format!("{:e}", v))
        .collect::<Vec<_>>()
        .join(", ");

    let decoded = block::decode(joined.as_bytes(), BlockFormat::Ascii).unwrap().into_f64();
    let rejoined = decoded
        .iter()
        .map(|v| format!("{:e}", v))
        .collect::<Vec<_>>()
        .join(", ");
    let again = block::decode(rejoined.as_bytes(), BlockFormat::Ascii).unwrap().into_f64();

    assert_eq!(decoded.len(), values.len());
    for ((a, b), c) in values.iter().zip(&decoded).zip(&again) {
        assert!((a - b).abs() < 1e-12);
        assert!((b - c).abs() < 1e-12);
    }
}

#[test]
fn binary_block_recovers_every_sample() {
    let samples: Vec<i16> = (0..601).map(|i| ((i * 97) % 65_536 - 32_768) as i16).collect();
    for terminator in [false, true] {
        let buf = binary_block(&samples, terminator);
        match block::decode(&buf, BlockFormat::Binary(SampleEncoding::I16_BE)).unwrap() {
            RawSamples::Integer(decoded) => assert_eq!(decoded, samples),
            other => panic!("expected integer samples, got {:?}", other),
        }
    }
}

#[test]
fn amplitude_scaling_example() {
    assert_eq!(scale_amplitude(&[150.0], 2.0, 100.0, 5.0), vec![105.0]);
}

#[test]
fn frequency_axis_example() {
    assert_eq!(
        frequency_axis(2e9, 3e9, 5).unwrap(),
        vec![2.0e9, 2.25e9, 2.5e9, 2.75e9, 3.0e9]
    );
    assert!(matches!(
        frequency_axis(2e9, 3e9, 1),
        Err(AcqError::InvalidPointCount(1))
    ));
}

#[test]
fn time_axis_example() {
    assert_eq!(time_axis(1e-9, 0.0, 3), vec![0.0, 1e-9, 2e-9]);
}

#[test]
fn preamble_count_must_match_curve() {
    let buf = binary_block(&[0i16; 600], true);
    let raw = block::decode(&buf, BlockFormat::Binary(SampleEncoding::I16_BE)).unwrap();
    assert_eq!(raw.len(), 600);
    assert!(matches!(
        scaling::scale(raw, &scope_preamble(601)),
        Err(AcqError::LengthMismatch {
            declared: 601,
            actual: 600
        })
    ));
}

#[test]
fn scope_curve_scales_to_volts_and_seconds() {
    let buf = binary_block(&[100, 150, 50], true);
    let raw = block::decode(&buf, BlockFormat::Binary(SampleEncoding::I16_BE)).unwrap();
    let trace = scaling::scale(raw, &scope_preamble(3)).unwrap();
    assert_eq!(trace.y(), &[5.0, 105.0, -95.0]);
    assert_eq!(trace.x(), &[0.0, 1e-9, 2e-9]);
}

#[test]
fn empty_ascii_payload() {
    for payload in ["", "   ", "\r\n"] {
        assert!(matches!(
            block::decode(payload.as_bytes(), BlockFormat::Ascii),
            Err(AcqError::EmptyPayload)
        ));
    }
}

#[test]
fn decode_errors_are_classified() {
    let err = block::decode(b"1.0, abc", BlockFormat::Ascii).unwrap_err();
    assert!(err.is_decode_error());
    assert!(matches!(err, AcqError::NumericParseError { ref token } if token == "abc"));

    let err = block::decode(b"#2", BlockFormat::Binary(SampleEncoding::I16_BE)).unwrap_err();
    assert!(err.is_decode_error());
}
