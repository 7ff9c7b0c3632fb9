//! Instrument transport adapters
//!
//! This module defines the [`Transport`] trait, the byte-stream seam between
//! the acquisition controllers and a physical link, and its implementations:
//!
//! - [`SocketAdapter`]: raw SCPI over TCP (port 5025 on most LAN instruments)
//! - `VisaAdapter`: VISA resources through visa-rs (feature `instrument_visa`)
//! - [`MockAdapter`]: scripted fake used by the test suites
//!
//! All adapters are blocking. There is exactly one caller per session, so
//! none of them lock internally.

pub mod mock;
pub mod socket_adapter;
#[cfg(feature = "instrument_visa")]
pub mod visa_adapter;

pub use mock::MockAdapter;
pub use socket_adapter::SocketAdapter;
#[cfg(feature = "instrument_visa")]
pub use visa_adapter::VisaAdapter;

use crate::error::AcqResult;
use std::time::Duration;

/// Blocking command/response link to one instrument.
pub trait Transport: Send {
    /// Send a command that produces no response.
    fn write(&mut self, command: &str) -> AcqResult<()>;

    /// Send a query and return its text response with the terminator trimmed.
    fn query(&mut self, command: &str) -> AcqResult<String>;

    /// Read one complete response as opaque bytes (block header and terminator included).
    fn read_raw(&mut self) -> AcqResult<Vec<u8>>;

    /// Current I/O timeout.
    fn timeout(&self) -> Duration;

    /// Change the I/O timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()>;

    /// Release the underlying handle. Calling it twice is not an error.
    fn close(&mut self) -> AcqResult<()>;

    /// Whether the handle is still open.
    fn is_open(&self) -> bool;

    /// Short adapter kind, e.g. `"socket"` or `"visa"`.
    fn adapter_type(&self) -> &str;

    /// Human readable description for logs.
    fn info(&self) -> String;

    /// Query the universal identification string.
    fn identify(&mut self) -> AcqResult<String> {
        self.query("*IDN?").map(|idn| idn.trim().to_string())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, command: &str) -> AcqResult<()> {
        (**self).write(command)
    }

    fn query(&mut self, command: &str) -> AcqResult<String> {
        (**self).query(command)
    }

    fn read_raw(&mut self) -> AcqResult<Vec<u8>> {
        (**self).read_raw()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()> {
        (**self).set_timeout(timeout)
    }

    fn close(&mut self) -> AcqResult<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn adapter_type(&self) -> &str {
        (**self).adapter_type()
    }

    fn info(&self) -> String {
        (**self).info()
    }

    fn identify(&mut self) -> AcqResult<String> {
        (**self).identify()
    }
}
