//! Serial adapter for RS-232 / USB-serial instruments, plus port discovery.
//!
//! The port is opened through `tokio-serial`, so reads and writes are native
//! async I/O. A read returns once the line has been idle for one character
//! period after the first byte, which is how replies without a terminator are
//! delimited.

use super::Adapter;
use crate::error::{AppResult, MeasureError};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Lower bound for the inter-character gap; timer resolution is ~1 ms.
const MIN_INTERVAL: Duration = Duration::from_millis(2);

/// Bits on the wire per character: start + 8 data + parity slot + stop.
const BITS_PER_CHAR: f64 = 11.0;

/// Idle time that ends a serial read: one character period at `baud_rate`.
pub fn interval_timeout(baud_rate: u32) -> Duration {
    let baud = f64::from(baud_rate.max(1));
    Duration::from_secs_f64(BITS_PER_CHAR / baud).max(MIN_INTERVAL)
}

/// One entry from the serial port enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortEntry {
    /// Port name as passed to open ("COM3", "/dev/ttyUSB0")
    pub name: String,
    /// Human readable description, empty when the OS gives none
    pub description: String,
    /// True for Bluetooth virtual ports, which are never instruments
    pub bluetooth: bool,
}

/// Serial adapter for RS-232 communication.
pub struct SerialAdapter {
    port_name: String,
    baud_rate: u32,
    interval: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Option<SerialStream>,
}

impl SerialAdapter {
    /// Open `port_name` at `baud_rate`, 8N1 without flow control.
    ///
    /// # Errors
    /// Returns an I/O error if the port does not exist or is already in use.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, baud_rate: u32) -> AppResult<Self> {
        let port = tokio_serial::new(port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| MeasureError::Connection {
                address: port_name.to_string(),
                source: io::Error::from(e),
            })?;

        debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            interval: interval_timeout(baud_rate),
            port: Some(port),
        })
    }

    /// Serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(port_name: &str, baud_rate: u32) -> AppResult<Self> {
        let _ = (port_name, baud_rate);
        Err(MeasureError::SerialFeatureDisabled)
    }

    /// Port name this adapter was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Inter-character idle time that ends a read.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&mut self) -> io::Result<&mut SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Adapter for SerialAdapter {
    fn name(&self) -> &str {
        "serial"
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        match tokio::time::timeout(timeout, port.write_all(data)).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("serial write timed out after {:?}", timeout),
            )),
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let interval = self.interval;
        let port = self.port()?;

        let mut filled = match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(0),
        };

        // Keep collecting until the line goes idle for one character period.
        while filled > 0 && filled < buf.len() {
            match tokio::time::timeout(interval, port.read(&mut buf[filled..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(filled)
    }

    async fn flush_input(&mut self) -> io::Result<()> {
        let port = self.port()?;
        port.clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Adapter for SerialAdapter {
    fn name(&self) -> &str {
        "serial"
    }

    async fn write(&mut self, _data: &[u8], _timeout: Duration) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "serial feature disabled"))
    }

    async fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "serial feature disabled"))
    }

    async fn flush_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// List the serial ports known to the operating system.
#[cfg(feature = "instrument_serial")]
pub fn available_serial_ports() -> AppResult<Vec<SerialPortEntry>> {
    let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .map(|info| {
            let (description, bluetooth) = match &info.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => (
                    usb.product.clone().unwrap_or_default(),
                    false,
                ),
                tokio_serial::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), true),
                tokio_serial::SerialPortType::PciPort => ("PCI".to_string(), false),
                _ => (String::new(), false),
            };
            let bluetooth = bluetooth || description.contains("Bluetooth");
            SerialPortEntry {
                name: info.port_name,
                description,
                bluetooth,
            }
        })
        .collect())
}

/// Serial support is compiled out.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_serial_ports() -> AppResult<Vec<SerialPortEntry>> {
    Err(MeasureError::SerialFeatureDisabled)
}

/// Check that `port_name` exists and is not held by another process.
///
/// The port is opened and closed again immediately.
pub fn check_serial_port(port_name: &str) -> AppResult<()> {
    let adapter = SerialAdapter::open(port_name, 115_200)?;
    drop(adapter);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_one_character_period() {
        // 11 bits at 1200 baud is ~9.2 ms
        let interval = interval_timeout(1200);
        assert!(interval > Duration::from_millis(9));
        assert!(interval < Duration::from_millis(10));
    }

    #[test]
    fn test_interval_has_floor_at_high_baud() {
        assert_eq!(interval_timeout(115_200), MIN_INTERVAL);
        assert_eq!(interval_timeout(0), Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_missing_port_is_a_connection_error() {
        let err = check_serial_port("/dev/this-port-does-not-exist").unwrap_err();
        assert!(err.is_not_found());
    }
}
