//! Core library for the trace_capture tool.
//!
//! Acquires spectrum and waveform traces from SCPI bench instruments and
//! turns the raw instrument payloads into physically scaled traces:
//!
//! - [`adapters`]: byte transports (raw socket, VISA, scripted mock)
//! - [`session`]: one open, identified connection with guaranteed release
//! - [`block`]: IEEE 488.2 definite-length block and ASCII list decoding
//! - [`scaling`]: raw samples plus preamble into physical units
//! - [`acquisition`]: per-family controllers sequencing the instruments
//! - [`storage`]: CSV trace archives
//!
//! The ambient modules ([`config`], [`logging`], [`error`], [`clock`]) are
//! shared by all of the above and by the `trace_capture` binary.

pub mod acquisition;
pub mod adapters;
pub mod block;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod scaling;
pub mod session;
pub mod storage;

pub use acquisition::{build_controller, AcquisitionController, InstrumentFamily, TraceBatch};
pub use error::{AcqError, AcqResult};
pub use scaling::PhysicalTrace;
pub use session::{with_session, ConnectionDescriptor, InstrumentSession};
