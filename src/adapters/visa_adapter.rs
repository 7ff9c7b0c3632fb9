//! VISA adapter for GPIB/USB/Ethernet instruments
//!
//! Wraps a visa-rs [`Instrument`] session. Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1AB1::0x0960::DSA8A000000::INSTR" (USBTMC)
//! - "TCPIP0::192.168.1.100::INSTR" (VXI-11 / LXI)
//!
//! VISA reads stop at the END indicator, so a binary block arrives in one or
//! more chunks that are concatenated until the device signals completion or
//! the declared block length has been received.

use super::Transport;
use crate::block::BlockHeader;
use crate::error::{AcqError, AcqResult};
use std::ffi::CString;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::{debug, info};
use visa_rs::prelude::*;

const READ_CHUNK: usize = 64 * 1024;

/// VISA adapter for instrument communication
pub struct VisaAdapter {
    resource_string: String,
    timeout: Duration,
    line_terminator: String,
    instrument: Option<Instrument>,
}

fn visa_err(context: &str, e: impl std::fmt::Display) -> AcqError {
    AcqError::Transport(format!("{}: {}", context, e))
}

impl VisaAdapter {
    /// Create a new VISA adapter with default settings
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            instrument: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Open the VISA resource through the default resource manager.
    pub fn connect(&mut self) -> AcqResult<()> {
        let rm = DefaultRM::new()
            .map_err(|e| AcqError::ConnectionFailure(format!("VISA resource manager: {}", e)))?;
        let c_string = CString::new(self.resource_string.as_str()).map_err(|e| {
            AcqError::ConnectionFailure(format!("Invalid resource {}: {}", self.resource_string, e))
        })?;
        let visa_string = VisaString::from(c_string);
        let instrument = rm
            .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| {
                AcqError::ConnectionFailure(format!("Failed to open {}: {}", self.resource_string, e))
            })?;
        self.instrument = Some(instrument);
        self.apply_timeout()?;
        info!("Opened VISA resource {}", self.resource_string);
        Ok(())
    }

    fn instrument(&self) -> AcqResult<&Instrument> {
        self.instrument
            .as_ref()
            .ok_or_else(|| AcqError::Transport("VISA instrument not connected".into()))
    }

    fn apply_timeout(&self) -> AcqResult<()> {
        let Some(instrument) = self.instrument.as_ref() else {
            return Ok(());
        };
        let millis = u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = attribute::AttrTmoValue::new_checked(millis)
            .ok_or_else(|| AcqError::Transport(format!("Timeout {}ms out of range", millis)))?;
        instrument
            .set_attr(attr)
            .map_err(|e| visa_err("Failed to set VISA timeout", e))
    }
}

impl Transport for VisaAdapter {
    fn write(&mut self, command: &str) -> AcqResult<()> {
        let line = format!("{}{}", command, self.line_terminator);
        let mut instrument = self.instrument()?;
        instrument.write_all(line.as_bytes())?;
        debug!("VISA write sent: {}", command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> AcqResult<String> {
        self.write(command)?;
        let mut reader = BufReader::new(self.instrument()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let response = line.trim().to_string();
        debug!("VISA query '{}' -> '{}'", command, response);
        Ok(response)
    }

    fn read_raw(&mut self) -> AcqResult<Vec<u8>> {
        let mut instrument = self.instrument()?;
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = instrument.read(&mut chunk)?;
            buf.extend_from_slice(&chunk[..n]);
            if n < chunk.len() {
                break;
            }
            if let Some(BlockHeader {
                header_len,
                payload_len: Some(len),
            }) = BlockHeader::parse(&buf)?
            {
                if buf.len() >= header_len + len {
                    break;
                }
            }
        }
        debug!("VISA raw read: {} bytes", buf.len());
        Ok(buf)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()> {
        self.timeout = timeout;
        self.apply_timeout()
    }

    fn close(&mut self) -> AcqResult<()> {
        // Dropping the session handle calls viClose.
        if self.instrument.take().is_some() {
            debug!("VISA resource {} closed", self.resource_string);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.instrument.is_some()
    }

    fn adapter_type(&self) -> &str {
        "visa"
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::1::INSTR");
        assert_eq!(adapter.adapter_type(), "visa");
        assert!(!adapter.is_open());
        assert!(adapter.info().contains("GPIB0::1::INSTR"));
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("USB0::0x1AB1::0x0960::DSA8A000000::INSTR")
            .with_timeout(Duration::from_millis(3000))
            .with_line_terminator("\r\n");
        assert_eq!(adapter.timeout(), Duration::from_millis(3000));
        assert_eq!(adapter.line_terminator, "\r\n");
    }

    #[test]
    fn test_io_before_connect_fails() {
        let mut adapter = VisaAdapter::new("TCPIP0::192.168.1.100::INSTR");
        assert!(matches!(adapter.write("*CLS"), Err(AcqError::Transport(_))));
        assert!(adapter.close().is_ok());
    }
}
