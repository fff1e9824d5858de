//! Byte transports underneath an instrument [`Connection`](crate::instrument::Connection).
//!
//! An [`Adapter`] moves raw bytes and nothing else: no line terminators, no
//! request/response pairing. Every read and write carries its own deadline so a
//! silent instrument can never block a caller forever.
//!
//! Implementations:
//! - [`StreamAdapter`] over any tokio byte stream; [`open_tcp`] builds one for `host:port`
//! - [`SerialAdapter`] for local serial ports (feature `instrument_serial`)
//! - [`MockAdapter`] with scripted replies, for tests

pub mod mock_adapter;
pub mod serial_adapter;
pub mod stream_adapter;

pub use mock_adapter::MockAdapter;
pub use serial_adapter::{
    available_serial_ports, check_serial_port, interval_timeout, SerialAdapter, SerialPortEntry,
};
pub use stream_adapter::{open_tcp, StreamAdapter, DIAL_TIMEOUT};

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Raw byte transport to one instrument.
#[async_trait]
pub trait Adapter: Send {
    /// Short transport name used in log lines ("tcp", "serial", "mock").
    fn name(&self) -> &str;

    /// Write all of `data`, giving up after `timeout`.
    ///
    /// Returns the number of bytes accepted by the transport.
    async fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Read whatever arrives within `timeout` into `buf`.
    ///
    /// Returns `Ok(0)` when nothing arrived before the deadline.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard any input that has been received but not yet read.
    async fn flush_input(&mut self) -> io::Result<()>;

    /// Release the underlying port or socket.
    async fn close(&mut self) -> io::Result<()>;
}
