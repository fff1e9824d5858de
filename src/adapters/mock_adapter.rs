//! Mock byte transport for testing
//!
//! This adapter stands in for a real instrument port. It provides:
//! - Scripted replies per command (queued, so repeated queries can differ)
//! - Unsolicited data pushed by the test (for instruments that stream)
//! - Simulated latency on every read and write
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! Clones share state, so a test keeps one handle while the driver owns another.

use super::Adapter;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    pending: VecDeque<u8>,
    call_log: Vec<String>,
    short_write_next: bool,
}

/// Mock hardware adapter for testing
///
/// # Example
///
/// ```
/// use rust_measure::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new();
/// adapter.on("*IDN?", "ACME,DMM-1,0001,1.0\n");
/// assert!(adapter.is_connected());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    connected: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    should_fail_next: Arc<AtomicBool>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a connected mock with no scripted replies and no latency
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            connected: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set simulated latency in milliseconds, applied to every read and write
    pub fn with_latency(self, ms: u64) -> Self {
        self.latency_ms.store(ms, Ordering::SeqCst);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a text reply for the next time `command` is written.
    ///
    /// `command` is matched without its line terminator. Replies queued for the
    /// same command are consumed in order; once one reply is left it is reused.
    pub fn on(&self, command: &str, reply: &str) {
        self.on_bytes(command, reply.as_bytes());
    }

    /// Queue a raw byte reply (binary blocks) for `command`.
    pub fn on_bytes(&self, command: &str, reply: &[u8]) {
        self.lock()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_vec());
    }

    /// Make bytes available to the reader without any command being written.
    pub fn push_bytes(&self, data: &[u8]) {
        self.lock().pending.extend(data.iter().copied());
    }

    /// Inject a failure for the next read or write
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the next write report that only part of the data was sent
    pub fn inject_short_write(&self) {
        self.lock().short_write_next = true;
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Commands written so far, without terminators
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn ensure_connected(&self) -> io::Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "mock port closed"))
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn write(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        if self.check_failure() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected failure"));
        }

        let command = String::from_utf8_lossy(data)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        let mut state = self.lock();
        if std::mem::take(&mut state.short_write_next) {
            state.call_log.push(command);
            return Ok(data.len().saturating_sub(1));
        }

        let reply = match state.replies.get_mut(&command) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        if let Some(reply) = reply {
            state.pending.extend(reply);
        }
        state.call_log.push(command);
        Ok(data.len())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        if self.check_failure() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected failure"));
        }

        let mut state = self.lock();
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn flush_input(&mut self) -> io::Result<()> {
        self.lock().pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_scripted_reply_follows_command() {
        let mut adapter = MockAdapter::new();
        adapter.on("*IDN?", "ACME,PSU\n");

        adapter.write(b"*IDN?\n", T).await.unwrap();
        let mut buf = [0u8; 32];
        let n = adapter.read(&mut buf, T).await.unwrap();
        assert_eq!(&buf[..n], b"ACME,PSU\n");
        assert_eq!(adapter.call_log(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    async fn test_queued_replies_are_consumed_in_order() {
        let mut adapter = MockAdapter::new();
        adapter.on("V1?", "V1 1.000\n");
        adapter.on("V1?", "V1 2.000\n");

        let mut buf = [0u8; 32];
        for expected in ["V1 1.000\n", "V1 2.000\n", "V1 2.000\n"] {
            adapter.write(b"V1?\n", T).await.unwrap();
            let n = adapter.read(&mut buf, T).await.unwrap();
            assert_eq!(&buf[..n], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_unknown_command_gives_silence() {
        let mut adapter = MockAdapter::new();
        adapter.write(b"OP1 1\n", T).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(adapter.read(&mut buf, T).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let mut adapter = MockAdapter::new();
        adapter.inject_next_failure();
        assert!(adapter.write(b"X\n", T).await.is_err());
        assert!(adapter.write(b"X\n", T).await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_is_simulated() {
        let mut adapter = MockAdapter::new().with_latency(20);
        let start = std::time::Instant::now();
        adapter.write(b"X\n", T).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_close_is_shared_between_clones() {
        let handle = MockAdapter::new();
        let mut owned = handle.clone();
        owned.close().await.unwrap();
        assert!(!handle.is_connected());
        assert!(owned.write(b"X\n", T).await.is_err());
    }
}
