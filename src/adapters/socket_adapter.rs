//! Raw SCPI socket adapter
//!
//! Talks to LAN instruments over a plain TCP socket (the `::SOCKET` resource
//! class, usually port 5025). Commands are newline terminated, text responses
//! are read up to the next newline, and binary block responses are read
//! exactly as long as their `#<n><len>` header declares, since the payload
//! itself may contain newline bytes. An indefinite `#0` block has no length
//! and a raw socket carries no end-of-message signal, so it is read until
//! the instrument goes quiet.

use super::Transport;
use crate::block::{length_digit_count, parse_length_digits, BLOCK_MARKER};
use crate::error::{AcqError, AcqResult};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

/// Default SCPI raw socket port.
pub const DEFAULT_PORT: u16 = 5025;

/// Default I/O timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// How long to wait for a terminator after a binary block payload.
const TERMINATOR_GRACE: Duration = Duration::from_millis(50);

/// Blocking SCPI client over TCP.
pub struct SocketAdapter {
    host: String,
    port: u16,
    timeout: Duration,
    line_terminator: String,
    stream: Option<BufReader<TcpStream>>,
}

impl SocketAdapter {
    /// Create an unconnected adapter for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            line_terminator: "\n".to_string(),
            stream: None,
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

    /// Open the TCP connection.
    pub fn connect(&mut self) -> AcqResult<()> {
        let target = format!("{}:{}", self.host, self.port);
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| AcqError::ConnectionFailure(format!("Invalid address {}: {}", target, e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    // Disable Nagle's algorithm for low latency
                    stream.set_nodelay(true)?;
                    info!("Connected to {} over raw socket", target);
                    self.stream = Some(BufReader::new(stream));
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(AcqError::ConnectionFailure(match last_err {
            Some(e) => format!("Failed to connect to {}: {}", target, e),
            None => format!("No addresses resolved for {}", target),
        }))
    }

    fn stream(&mut self) -> AcqResult<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| AcqError::Transport("Socket not connected".into()))
    }

    fn read_line_bytes(&mut self, buf: &mut Vec<u8>) -> AcqResult<()> {
        let n = self.stream()?.read_until(b'\n', buf)?;
        if n == 0 {
            return Err(AcqError::Transport("Connection closed by device".into()));
        }
        Ok(())
    }

    /// Run `read` with the short grace timeout, treating a timeout as "nothing more to read".
    fn with_grace<F>(&mut self, read: F) -> AcqResult<()>
    where
        F: FnOnce(&mut BufReader<TcpStream>) -> std::io::Result<()>,
    {
        let timeout = self.timeout;
        let stream = self.stream()?;
        stream.get_ref().set_read_timeout(Some(TERMINATOR_GRACE))?;
        let result = read(stream);
        stream.get_ref().set_read_timeout(Some(timeout))?;
        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume a trailing terminator if the instrument sends one promptly.
    fn read_terminator(&mut self, buf: &mut Vec<u8>) -> AcqResult<()> {
        self.with_grace(|stream| stream.read_until(b'\n', buf).map(|_| ()))
    }

    /// Read everything the instrument sends until the link goes idle or closes.
    fn read_until_idle(&mut self, buf: &mut Vec<u8>) -> AcqResult<()> {
        self.with_grace(|stream| loop {
            let chunk = stream.fill_buf()?;
            if chunk.is_empty() {
                return Ok(());
            }
            let n = chunk.len();
            buf.extend_from_slice(chunk);
            stream.consume(n);
        })
    }
}

impl Transport for SocketAdapter {
    fn write(&mut self, command: &str) -> AcqResult<()> {
        let line = format!("{}{}", command, self.line_terminator);
        debug!("SCPI write: {:?}", command);
        let stream = self.stream()?.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> AcqResult<String> {
        self.write(command)?;
        let mut buf = Vec::new();
        self.read_line_bytes(&mut buf)?;
        let response = String::from_utf8_lossy(&buf).trim().to_string();
        debug!("SCPI response: {:?}", response);
        Ok(response)
    }

    fn read_raw(&mut self) -> AcqResult<Vec<u8>> {
        let mut first = [0u8; 1];
        self.stream()?.read_exact(&mut first)?;
        let mut buf = vec![first[0]];

        if first[0] == b'\n' {
            return Ok(buf);
        }
        if first[0] != BLOCK_MARKER {
            self.read_line_bytes(&mut buf)?;
            return Ok(buf);
        }

        let mut digit = [0u8; 1];
        self.stream()?.read_exact(&mut digit)?;
        buf.push(digit[0]);
        let n = length_digit_count(digit[0])?;
        if n == 0 {
            // Payload may hold newline bytes; only silence ends the block.
            self.read_until_idle(&mut buf)?;
            debug!("SCPI raw read: indefinite block, {} bytes", buf.len());
            return Ok(buf);
        }

        let mut digits = vec![0u8; n];
        self.stream()?.read_exact(&mut digits)?;
        let len = parse_length_digits(&digits)?;
        buf.extend_from_slice(&digits);

        let start = buf.len();
        buf.resize(start + len, 0);
        self.stream()?.read_exact(&mut buf[start..])?;
        self.read_terminator(&mut buf)?;
        debug!("SCPI raw read: {} payload bytes", len);
        Ok(buf)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()> {
        self.timeout = timeout;
        if let Some(stream) = self.stream.as_ref() {
            stream.get_ref().set_read_timeout(Some(timeout))?;
            stream.get_ref().set_write_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        if let Some(stream) = self.stream.take() {
            // Peer may already have gone away; the handle is released either way.
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            debug!("Socket {}:{} closed", self.host, self.port);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn adapter_type(&self) -> &str {
        "socket"
    }

    fn info(&self) -> String {
        format!(
            "SocketAdapter({}:{} @ {}ms timeout)",
            self.host,
            self.port,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Spawn a one-shot fake instrument that answers each received line with the next reply.
    fn fake_instrument(replies: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut received = Vec::new();
            let mut replies = replies.into_iter();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim().to_string();
                let is_query = line.ends_with('?');
                received.push(line);
                if is_query {
                    if let Some(reply) = replies.next() {
                        writer.write_all(&reply).unwrap();
                    }
                }
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_socket_adapter_creation() {
        let adapter = SocketAdapter::new("192.168.1.100", DEFAULT_PORT)
            .with_timeout(Duration::from_millis(3000))
            .with_line_terminator("\r\n");
        assert_eq!(adapter.adapter_type(), "socket");
        assert!(!adapter.is_open());
        assert_eq!(adapter.line_terminator, "\r\n");
        let info = adapter.info();
        assert!(info.contains("192.168.1.100:5025"));
        assert!(info.contains("3000ms"));
    }

    #[test]
    fn test_write_before_connect_fails() {
        let mut adapter = SocketAdapter::new("127.0.0.1", 1);
        assert!(matches!(adapter.write("*CLS"), Err(AcqError::Transport(_))));
    }

    #[test]
    fn test_query_and_binary_block_with_embedded_newline() {
        let mut block = b"#14".to_vec();
        block.extend_from_slice(&[0x00, 0x0a, 0xff, 0xf6]);
        block.push(b'\n');
        let (port, server) = fake_instrument(vec![b"TEST,FAKE,0,1.0\n".to_vec(), block.clone()]);

        let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        adapter.connect().unwrap();
        assert_eq!(adapter.identify().unwrap(), "TEST,FAKE,0,1.0");
        adapter.write("CURVe?").unwrap();
        assert_eq!(adapter.read_raw().unwrap(), block);
        adapter.close().unwrap();
        assert!(!adapter.is_open());

        let received = server.join().unwrap();
        assert_eq!(received, vec!["*IDN?".to_string(), "CURVe?".to_string()]);
    }

    #[test]
    fn test_indefinite_block_keeps_embedded_newline() {
        let mut block = b"#0".to_vec();
        block.extend_from_slice(&[0x01, 0x0a, 0x02, 0x0a, 0x03]);
        block.push(b'\n');
        let (port, server) = fake_instrument(vec![block.clone(), b"1\n".to_vec()]);

        let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        adapter.connect().unwrap();
        adapter.write("CURVe?").unwrap();
        assert_eq!(adapter.read_raw().unwrap(), block);
        // Normal timeout is back in force for the next exchange.
        assert_eq!(adapter.query("*OPC?").unwrap(), "1");
        adapter.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn test_bare_newline_raw_read_returns_immediately() {
        let (port, server) =
            fake_instrument(vec![b"\n".to_vec(), b"TEST,FAKE,0,1.0\n".to_vec()]);

        let mut adapter = SocketAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        adapter.connect().unwrap();
        adapter.write("CURVe?").unwrap();
        assert_eq!(adapter.read_raw().unwrap(), b"\n".to_vec());
        assert_eq!(adapter.identify().unwrap(), "TEST,FAKE,0,1.0");
        adapter.close().unwrap();

        let received = server.join().unwrap();
        assert_eq!(received, vec!["CURVe?".to_string(), "*IDN?".to_string()]);
    }
}
