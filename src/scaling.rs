//! Conversion of raw samples into physical units.
//!
//! A [`Preamble`] carries everything needed to turn decoded sample codes into
//! a [`PhysicalTrace`]: how to build the independent axis and the linear
//! amplitude transform `(raw - offset) * multiplier + zero`. The oscilloscope
//! reports these numbers itself (`WFMOutpre?`); for the spectrum analyser the
//! controller assembles a preamble from the read-back frequency span and
//! point count with an identity amplitude transform.

use crate::block::RawSamples;
use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};

/// Unit attached to an axis of a [`PhysicalTrace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisUnit {
    /// Frequency in hertz.
    Hertz,
    /// Time in seconds.
    Seconds,
    /// Power in dBm.
    Dbm,
    /// Voltage in volts.
    Volts,
}

impl AxisUnit {
    /// Short unit symbol used in archive headers and logs.
    pub fn symbol(self) -> &'static str {
        match self {
            AxisUnit::Hertz => "Hz",
            AxisUnit::Seconds => "s",
            AxisUnit::Dbm => "dBm",
            AxisUnit::Volts => "V",
        }
    }
}

/// How the independent axis is generated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum XAxis {
    /// Evenly spaced points between `start` and `stop`, both inclusive.
    Linear {
        /// Value of the first point.
        start: f64,
        /// Value of the last point.
        stop: f64,
    },
    /// `x[i] = i * increment + zero`.
    Incremental {
        /// Spacing between samples.
        increment: f64,
        /// Value of sample 0.
        zero: f64,
    },
}

/// Scaling parameters for one acquisition configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preamble {
    /// Independent axis description.
    pub x_axis: XAxis,
    /// Unit of the independent axis.
    pub x_unit: AxisUnit,
    /// Amplitude multiplier per raw code.
    pub y_multiplier: f64,
    /// Raw code subtracted before multiplying.
    pub y_offset: f64,
    /// Physical value added after multiplying.
    pub y_zero: f64,
    /// Unit of the dependent axis.
    pub y_unit: AxisUnit,
    /// Number of samples the data block must contain.
    pub points: usize,
}

/// Number of `;` separated fields in an oscilloscope `WFMOutpre?` reply.
pub const WFMOUTPRE_FIELDS: usize = 16;

const NR_PT: usize = 6;
const XINCR: usize = 9;
const XZERO: usize = 10;
const YMULT: usize = 13;
const YOFF: usize = 14;
const YZERO: usize = 15;

fn field<T: std::str::FromStr>(fields: &[&str], index: usize) -> AcqResult<T> {
    let token = fields[index].trim();
    token.parse::<T>().map_err(|_| AcqError::NumericParseError {
        token: token.to_string(),
    })
}

impl Preamble {
    /// Preamble for a spectrum trace: linear frequency axis, amplitude already in dBm.
    pub fn spectrum(start_hz: f64, stop_hz: f64, points: usize) -> Self {
        Self {
            x_axis: XAxis::Linear {
                start: start_hz,
                stop: stop_hz,
            },
            x_unit: AxisUnit::Hertz,
            y_multiplier: 1.0,
            y_offset: 0.0,
            y_zero: 0.0,
            y_unit: AxisUnit::Dbm,
            points,
        }
    }

    /// Parse an oscilloscope waveform preamble.
    ///
    /// Field layout: `BYT_NR;BIT_NR;ENCDG;BN_FMT;BYT_OR;WFID;NR_PT;PT_FMT;XUNIT;
    /// XINCR;XZERO;PT_OFF;YUNIT;YMULT;YOFF;YZERO`. Only the point count and the
    /// five scaling numbers are consumed.
    pub fn parse_wfmoutpre(response: &str) -> AcqResult<Self> {
        let fields: Vec<&str> = response.trim().split(';').collect();
        if fields.len() < WFMOUTPRE_FIELDS {
            return Err(AcqError::MalformedBlock(format!(
                "waveform preamble has {} fields, expected {}",
                fields.len(),
                WFMOUTPRE_FIELDS
            )));
        }
        Ok(Self {
            x_axis: XAxis::Incremental {
                increment: field(&fields, XINCR)?,
                zero: field(&fields, XZERO)?,
            },
            x_unit: AxisUnit::Seconds,
            y_multiplier: field(&fields, YMULT)?,
            y_offset: field(&fields, YOFF)?,
            y_zero: field(&fields, YZERO)?,
            y_unit: AxisUnit::Volts,
            points: field(&fields, NR_PT)?,
        })
    }

    /// Same scaling with a different expected sample count.
    pub fn with_points(mut self, points: usize) -> Self {
        self.points = points;
        self
    }

    /// Generate the independent axis for `self.points` samples.
    pub fn x_values(&self) -> AcqResult<Vec<f64>> {
        match self.x_axis {
            XAxis::Linear { start, stop } => frequency_axis(start, stop, self.points),
            XAxis::Incremental { increment, zero } => Ok(time_axis(increment, zero, self.points)),
        }
    }
}

/// Apply `(raw - offset) * multiplier + zero` to every sample.
pub fn scale_amplitude(raw: &[f64], multiplier: f64, offset: f64, zero: f64) -> Vec<f64> {
    raw.iter().map(|r| (r - offset) * multiplier + zero).collect()
}

/// `count` evenly spaced points from `start` to `stop` inclusive.
///
/// Fewer than two points cannot span an interval and yield `InvalidPointCount`.
pub fn frequency_axis(start: f64, stop: f64, count: usize) -> AcqResult<Vec<f64>> {
    if count < 2 {
        return Err(AcqError::InvalidPointCount(count));
    }
    let step = (stop - start) / (count - 1) as f64;
    let mut axis: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
    axis[count - 1] = stop;
    Ok(axis)
}

/// `t[i] = i * increment + zero` for `i` in `0..count`.
pub fn time_axis(increment: f64, zero: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| i as f64 * increment + zero).collect()
}

/// Scale raw samples with `preamble`.
///
/// The decoded sample count must equal the preamble's declared count.
pub fn scale(raw: RawSamples, preamble: &Preamble) -> AcqResult<PhysicalTrace> {
    if raw.len() != preamble.points {
        return Err(AcqError::LengthMismatch {
            declared: preamble.points,
            actual: raw.len(),
        });
    }
    let y = scale_amplitude(
        &raw.into_f64(),
        preamble.y_multiplier,
        preamble.y_offset,
        preamble.y_zero,
    );
    let x = preamble.x_values()?;
    Ok(PhysicalTrace {
        x,
        y,
        x_unit: preamble.x_unit,
        y_unit: preamble.y_unit,
    })
}

/// Final, immutable result of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalTrace {
    x: Vec<f64>,
    y: Vec<f64>,
    x_unit: AxisUnit,
    y_unit: AxisUnit,
}

impl PhysicalTrace {
    /// Build a trace from aligned axes.
    pub fn new(x: Vec<f64>, y: Vec<f64>, x_unit: AxisUnit, y_unit: AxisUnit) -> AcqResult<Self> {
        if x.len() != y.len() {
            return Err(AcqError::LengthMismatch {
                declared: x.len(),
                actual: y.len(),
            });
        }
        Ok(Self {
            x,
            y,
            x_unit,
            y_unit,
        })
    }

    /// Independent axis (Hz or s).
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// Dependent axis (dBm or V).
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// Unit of [`PhysicalTrace::x`].
    pub fn x_unit(&self) -> AxisUnit {
        self.x_unit
    }

    /// Unit of [`PhysicalTrace::y`].
    pub fn y_unit(&self) -> AxisUnit {
        self.y_unit
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// True for a trace without points.
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Minimum and maximum of the dependent axis.
    pub fn y_range(&self) -> Option<(f64, f64)> {
        self.y.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Split into `(x, y)` vectors.
    pub fn into_parts(self) -> (Vec<f64>, Vec<f64>) {
        (self.x, self.y)
    }
}
