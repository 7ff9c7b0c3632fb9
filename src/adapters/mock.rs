//! Mock transport for testing
//!
//! Simulates an instrument without hardware. It provides:
//! - Scripted query responses, queued per command
//! - Scripted raw reads for block transfers
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! Clones share all state, so a test can keep one handle while the session
//! owns another.

use super::Transport;
use crate::error::{AcqError, AcqResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Identification string answered to `*IDN?` unless overridden.
pub const MOCK_IDN: &str = "MOCK,Instrument,SN0000,1.0";

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

#[derive(Default)]
struct Script {
    queries: HashMap<String, VecDeque<Reply>>,
    raw_reads: VecDeque<Result<Vec<u8>, String>>,
    write_failures: HashMap<String, String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted instrument link
///
/// # Example
///
/// ```
/// use trace_capture::adapters::{MockAdapter, Transport};
///
/// let mut adapter = MockAdapter::new().with_response(":SWEep:POINts?", "601");
/// assert_eq!(adapter.query(":SWEep:POINts?").unwrap(), "601");
/// assert_eq!(adapter.call_log(), vec!["query: :SWEep:POINts?"]);
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    open: Arc<AtomicBool>,
    close_count: Arc<AtomicUsize>,
    should_fail_next: Arc<AtomicBool>,
    script: Arc<Mutex<Script>>,
    call_log: Arc<Mutex<Vec<String>>>,
    timeout: Duration,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create an open mock that answers `*IDN?`.
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
            close_count: Arc::new(AtomicUsize::new(0)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            script: Arc::new(Mutex::new(Script::default())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            timeout: Duration::from_secs(5),
        }
    }

    fn push_reply(&self, command: &str, reply: Reply) {
        lock(&self.script)
            .queries
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a response for `command`. The last queued response repeats.
    pub fn with_response(self, command: &str, response: impl Into<String>) -> Self {
        self.push_reply(command, Reply::Text(response.into()));
        self
    }

    /// Queue a failing response for `command`.
    pub fn with_query_failure(self, command: &str, message: impl Into<String>) -> Self {
        self.push_reply(command, Reply::Fail(message.into()));
        self
    }

    /// Make every write of `command` fail.
    pub fn with_write_failure(self, command: &str, message: impl Into<String>) -> Self {
        lock(&self.script)
            .write_failures
            .insert(command.to_string(), message.into());
        self
    }

    /// Queue the bytes returned by the next `read_raw`.
    pub fn with_raw_read(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.add_raw_read(bytes);
        self
    }

    /// Queue a failing `read_raw`.
    pub fn with_raw_failure(self, message: impl Into<String>) -> Self {
        lock(&self.script).raw_reads.push_back(Err(message.into()));
        self
    }

    /// Queue a response on a shared handle.
    pub fn add_response(&self, command: &str, response: impl Into<String>) {
        self.push_reply(command, Reply::Text(response.into()));
    }

    /// Queue a raw read on a shared handle.
    pub fn add_raw_read(&self, bytes: impl Into<Vec<u8>>) {
        lock(&self.script).raw_reads.push_back(Ok(bytes.into()));
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Commands sent with `write`, in order.
    pub fn writes(&self) -> Vec<String> {
        self.call_log()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("write: ").map(str::to_string))
            .collect()
    }

    /// Number of logged calls whose text equals `entry`.
    pub fn count(&self, entry: &str) -> usize {
        lock(&self.call_log).iter().filter(|e| *e == entry).count()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    /// How many times `close` released the handle.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn log_call(&self, call: String) {
        lock(&self.call_log).push(call);
    }

    fn ensure_open(&self) -> AcqResult<()> {
        if self.check_failure() {
            return Err(AcqError::Transport("Injected failure".into()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(AcqError::Transport("Not connected".into()));
        }
        Ok(())
    }
}

impl Transport for MockAdapter {
    fn write(&mut self, command: &str) -> AcqResult<()> {
        self.log_call(format!("write: {}", command));
        self.ensure_open()?;
        match lock(&self.script).write_failures.get(command) {
            Some(message) => Err(AcqError::Transport(message.clone())),
            None => Ok(()),
        }
    }

    fn query(&mut self, command: &str) -> AcqResult<String> {
        self.log_call(format!("query: {}", command));
        self.ensure_open()?;
        let mut script = lock(&self.script);
        let Some(queue) = script.queries.get_mut(command) else {
            if command == "*IDN?" {
                return Ok(MOCK_IDN.to_string());
            }
            return Err(AcqError::Transport(format!("No scripted response for {}", command)));
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(AcqError::Transport(message)),
            None => Err(AcqError::Transport(format!("No scripted response for {}", command))),
        }
    }

    fn read_raw(&mut self) -> AcqResult<Vec<u8>> {
        self.log_call("read_raw".to_string());
        self.ensure_open()?;
        match lock(&self.script).raw_reads.pop_front() {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(message)) => Err(AcqError::Transport(message)),
            None => Err(AcqError::Transport("No scripted raw read".into())),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> AcqResult<()> {
        self.log_call(format!("set_timeout: {}ms", timeout.as_millis()));
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        self.log_call("close".to_string());
        if self.open.swap(false, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn adapter_type(&self) -> &str {
        "mock"
    }

    fn info(&self) -> String {
        "MockAdapter".to_string()
    }
}
