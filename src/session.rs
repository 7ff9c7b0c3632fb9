//! Instrument sessions.
//!
//! A session is one open connection to one instrument: the transport that
//! carries it plus the identity string it answered on connect. Sessions are
//! created from a [`ConnectionDescriptor`] by an explicit factory instead of a
//! process-wide resource manager, and they release the transport on every
//! exit path: [`InstrumentSession::close`] on the normal path and `Drop` on
//! early returns and unwinding.

use crate::adapters::{SocketAdapter, Transport};
use crate::error::{AcqError, AcqResult};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// Raw SCPI socket, e.g. `TCPIP0::192.168.1.50::5025::SOCKET` or `192.168.1.50:5025`.
    Socket {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Any other VISA resource string, opened through visa-rs.
    Visa {
        /// Full resource string, e.g. `USB0::0x1AB1::0x0960::DSA8A000000::INSTR`.
        resource: String,
    },
}

impl FromStr for ConnectionDescriptor {
    type Err = AcqError;

    fn from_str(s: &str) -> AcqResult<Self> {
        let resource = s.trim();
        if resource.is_empty() {
            return Err(AcqError::ConnectionFailure("Empty resource string".into()));
        }

        let parts: Vec<&str> = resource.split("::").collect();
        if parts.len() > 1 {
            let is_socket = parts.len() == 4
                && parts[0].to_ascii_uppercase().starts_with("TCPIP")
                && parts[3].eq_ignore_ascii_case("SOCKET");
            if !is_socket {
                return Ok(ConnectionDescriptor::Visa {
                    resource: resource.to_string(),
                });
            }
            let port = parse_port(parts[2], resource)?;
            return Ok(ConnectionDescriptor::Socket {
                host: parts[1].to_string(),
                port,
            });
        }

        match resource.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(ConnectionDescriptor::Socket {
                host: host.to_string(),
                port: parse_port(port, resource)?,
            }),
            _ => Err(AcqError::ConnectionFailure(format!(
                "Unrecognised resource string '{}'",
                resource
            ))),
        }
    }
}

fn parse_port(port: &str, resource: &str) -> AcqResult<u16> {
    port.parse().map_err(|_| {
        AcqError::ConnectionFailure(format!("Invalid port '{}' in resource '{}'", port, resource))
    })
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDescriptor::Socket { host, port } => {
                write!(f, "TCPIP0::{}::{}::SOCKET", host, port)
            }
            ConnectionDescriptor::Visa { resource } => f.write_str(resource),
        }
    }
}

#[cfg(feature = "instrument_visa")]
fn open_visa(resource: &str, timeout: Duration) -> AcqResult<Box<dyn Transport>> {
    let mut adapter = crate::adapters::VisaAdapter::new(resource).with_timeout(timeout);
    adapter.connect()?;
    Ok(Box::new(adapter))
}

#[cfg(not(feature = "instrument_visa"))]
fn open_visa(resource: &str, _timeout: Duration) -> AcqResult<Box<dyn Transport>> {
    Err(AcqError::ConnectionFailure(format!(
        "Cannot open '{}': VISA support not enabled. Rebuild with --features instrument_visa",
        resource
    )))
}

fn as_connection_failure(err: AcqError) -> AcqError {
    match err {
        AcqError::ConnectionFailure(_) => err,
        other => AcqError::ConnectionFailure(other.to_string()),
    }
}

/// One exclusively owned, open instrument connection.
pub struct InstrumentSession {
    transport: Box<dyn Transport>,
    identity: String,
    closed: bool,
}

impl fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("transport", &self.transport.info())
            .field("identity", &self.identity)
            .field("closed", &self.closed)
            .finish()
    }
}

impl InstrumentSession {
    /// Open a transport for `descriptor` and identify the instrument.
    pub fn open(descriptor: &ConnectionDescriptor, timeout: Duration) -> AcqResult<Self> {
        info!("Opening instrument session to {}", descriptor);
        let transport: Box<dyn Transport> = match descriptor {
            ConnectionDescriptor::Socket { host, port } => {
                let mut adapter = SocketAdapter::new(host.clone(), *port).with_timeout(timeout);
                adapter.connect().map_err(as_connection_failure)?;
                Box::new(adapter)
            }
            ConnectionDescriptor::Visa { resource } => {
                open_visa(resource, timeout).map_err(as_connection_failure)?
            }
        };
        Self::from_transport(transport)
    }

    /// Wrap an already connected transport and identify the instrument.
    ///
    /// The transport is closed again if identification fails.
    pub fn from_transport(transport: impl Transport + 'static) -> AcqResult<Self> {
        let mut transport: Box<dyn Transport> = Box::new(transport);
        match transport.identify() {
            Ok(identity) if !identity.is_empty() => {
                info!("Connected to {} via {}", identity, transport.adapter_type());
                Ok(Self {
                    transport,
                    identity,
                    closed: false,
                })
            }
            Ok(_) => {
                let _ = transport.close();
                Err(AcqError::ConnectionFailure(
                    "Instrument returned an empty identification".into(),
                ))
            }
            Err(e) => {
                let _ = transport.close();
                Err(as_connection_failure(e))
            }
        }
    }

    /// Identification string answered on connect.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current transport timeout.
    pub fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    /// Change the transport timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()> {
        self.live()?.set_timeout(timeout)
    }

    /// Whether [`close`](Self::close) has already run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn live(&mut self) -> AcqResult<&mut Box<dyn Transport>> {
        if self.closed {
            return Err(AcqError::Transport("Session closed".into()));
        }
        Ok(&mut self.transport)
    }

    /// Send a command without a response.
    pub fn write(&mut self, command: &str) -> AcqResult<()> {
        self.live()?.write(command)
    }

    /// Send a query and return the trimmed text response.
    pub fn query(&mut self, command: &str) -> AcqResult<String> {
        self.live()?.query(command)
    }

    /// Send a query whose response is a single number.
    pub fn query_f64(&mut self, command: &str) -> AcqResult<f64> {
        let response = self.query(command)?;
        let token = response.trim();
        token.parse::<f64>().map_err(|_| AcqError::NumericParseError {
            token: token.to_string(),
        })
    }

    /// Read one raw response.
    pub fn read_raw(&mut self) -> AcqResult<Vec<u8>> {
        self.live()?.read_raw()
    }

    /// Send `command`, then read its response as raw bytes.
    pub fn query_raw(&mut self, command: &str) -> AcqResult<Vec<u8>> {
        self.write(command)?;
        self.read_raw()
    }

    /// Release the transport. Later calls are no-ops.
    pub fn close(&mut self) -> AcqResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing session to {}", self.identity);
        self.transport.close()
    }

    /// Run `f` against this session and close it afterwards, whatever `f` returns.
    pub fn scoped<T, E, F>(mut self, f: F) -> Result<T, E>
    where
        E: From<AcqError>,
        F: FnOnce(&mut InstrumentSession) -> Result<T, E>,
    {
        let result = f(&mut self);
        let closed = self.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close session to {}: {}", self.identity, e);
        }
    }
}

/// Open a session, run `f` with it, and always close it.
pub fn with_session<T, E, F>(
    descriptor: &ConnectionDescriptor,
    timeout: Duration,
    f: F,
) -> Result<T, E>
where
    E: From<AcqError>,
    F: FnOnce(&mut InstrumentSession) -> Result<T, E>,
{
    InstrumentSession::open(descriptor, timeout)?.scoped(f)
}
