//! Request/response line protocol on top of an [`Adapter`].
//!
//! A [`Connection`] is owned by exactly one driver. It is either open (a
//! transport is present) or closed; there is no half-open state. Every I/O call
//! carries the configured timeout, and the only automatic retry anywhere is the
//! single one in [`Connection::query_idn`].

use super::identity::Identity;
use crate::adapters::{self, Adapter, SerialAdapter};
use crate::error::{AppResult, MeasureError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Size of the buffer behind [`Connection::read_string`].
pub const READ_BUFFER_SIZE: usize = 1024;

/// Pause before the second `*IDN?` attempt.
pub const IDN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Sleep between polls while [`Connection::read_binary`] waits for more bytes.
const BINARY_POLL: Duration = Duration::from_millis(5);

/// Line terminator appended to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eol {
    /// `\n`
    #[default]
    Lf,
    /// `\r`
    Cr,
    /// `\r\n`
    CrLf,
    /// `\n\r`
    LfCr,
    /// No terminator; the instrument delimits by timing
    None,
}

impl Eol {
    /// The terminator bytes as text.
    pub fn as_str(self) -> &'static str {
        match self {
            Eol::Lf => "\n",
            Eol::Cr => "\r",
            Eol::CrLf => "\r\n",
            Eol::LfCr => "\n\r",
            Eol::None => "",
        }
    }

    /// Append the terminator unless `command` already ends with it.
    ///
    /// Idempotent: `add_eol(add_eol(s)) == add_eol(s)`.
    pub fn add_eol(self, command: &str) -> String {
        let eol = self.as_str();
        if command.ends_with(eol) {
            command.to_string()
        } else {
            format!("{}{}", command, eol)
        }
    }
}

impl fmt::Display for Eol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Eol::Lf => "LF",
            Eol::Cr => "CR",
            Eol::CrLf => "CRLF",
            Eol::LfCr => "LFCR",
            Eol::None => "none",
        };
        f.write_str(name)
    }
}

/// Per-connection settings. Drivers start from their own defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Terminator appended to commands
    pub eol: Eol,
    /// Deadline for each read and write
    pub timeout: Duration,
    /// Serial baud rate; ignored for network addresses
    pub baud_rate: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            eol: Eol::Lf,
            timeout: Duration::from_secs(1),
            baud_rate: 115_200,
        }
    }
}

impl ConnectionOptions {
    /// Set the line terminator
    pub fn with_eol(mut self, eol: Eol) -> Self {
        self.eol = eol;
        self
    }

    /// Set the read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the serial baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// True when `address` names a local serial port rather than `host:port`.
pub fn is_serial_address(address: &str) -> bool {
    let upper = address.to_ascii_uppercase();
    upper.starts_with("COM") || address.starts_with("/dev/")
}

/// Convert instrument output to text, dropping NUL, CR and LF bytes.
pub fn to_clean_string(bytes: &[u8]) -> String {
    let kept: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !matches!(b, b'\0' | b'\r' | b'\n'))
        .collect();
    String::from_utf8_lossy(&kept).into_owned()
}

/// An open (or closed) link to one instrument.
pub struct Connection {
    address: String,
    options: ConnectionOptions,
    name: String,
    transport: Option<Box<dyn Adapter>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("options", &self.options)
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Open `address`: a serial port name (`COM3`, `/dev/ttyUSB0`) or `host:port`.
    ///
    /// Serial ports are opened at `options.baud_rate`; network addresses are
    /// dialed with a fixed one second connect timeout.
    ///
    /// # Errors
    /// [`MeasureError::Connection`] carrying the address and the underlying cause.
    pub async fn open(address: &str, options: ConnectionOptions) -> AppResult<Self> {
        let transport: Box<dyn Adapter> = if is_serial_address(address) {
            Box::new(SerialAdapter::open(address, options.baud_rate)?)
        } else {
            let adapter =
                adapters::open_tcp(address)
                    .await
                    .map_err(|source| MeasureError::Connection {
                        address: address.to_string(),
                        source,
                    })?;
            Box::new(adapter)
        };
        info!("Opened {} ({})", address, transport.name());
        Ok(Self::from_adapter(address, transport, options))
    }

    /// Wrap an already opened transport.
    pub fn from_adapter(
        address: impl Into<String>,
        transport: Box<dyn Adapter>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            address: address.into(),
            options,
            name: String::new(),
            transport: Some(transport),
        }
    }

    /// Release the transport. Safe to call on a closed connection.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Closing {} failed: {}", self.address, e);
            }
            debug!("Closed {}", self.address);
        }
    }

    /// True until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// The address this connection was opened on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identification string from the last successful [`query_idn`](Self::query_idn).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// [`name`](Self::name) split into its `*IDN?` fields.
    pub fn identity(&self) -> Identity {
        Identity::parse(&self.name)
    }

    /// Current settings.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Read/write deadline.
    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Change the read/write deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    /// Append this connection's terminator to `command` (idempotent).
    pub fn add_eol(&self, command: &str) -> String {
        self.options.eol.add_eol(command)
    }

    fn transport(&mut self) -> AppResult<&mut Box<dyn Adapter>> {
        self.transport.as_mut().ok_or(MeasureError::NotConnected)
    }

    /// Send one command, terminated.
    ///
    /// Arguments are interpolated by the caller with `format!`.
    ///
    /// # Errors
    /// Fails if the connection is closed, the write times out, or fewer bytes
    /// than requested were accepted.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        let line = self.add_eol(command);
        let timeout = self.options.timeout;
        let address = self.address.clone();
        let written = self.transport()?.write(line.as_bytes(), timeout).await?;
        if written != line.len() {
            return Err(MeasureError::ShortWrite {
                written,
                expected: line.len(),
            });
        }
        debug!("[{}] >> {}", address, command.trim_end());
        Ok(())
    }

    /// Read one reply of up to [`READ_BUFFER_SIZE`] bytes.
    ///
    /// Returns an empty string when nothing arrived or the read failed; callers
    /// must treat empty as "no response", never as a valid reply.
    pub async fn read_string(&mut self) -> String {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match self.read(&mut buf).await {
            Ok(0) => String::new(),
            Ok(n) => {
                let reply = to_clean_string(&buf[..n]);
                debug!("[{}] << {}", self.address, reply);
                reply
            }
            Err(e) => {
                debug!("[{}] read failed: {}", self.address, e);
                String::new()
            }
        }
    }

    /// Raw read into `buf`, no terminator handling.
    ///
    /// Returns `Ok(0)` if nothing arrived within the timeout.
    pub async fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let timeout = self.options.timeout;
        Ok(self.transport()?.read(buf, timeout).await?)
    }

    /// Read exactly one byte.
    ///
    /// # Errors
    /// [`MeasureError::Timeout`] if no byte arrives within the timeout.
    pub async fn read_byte(&mut self) -> AppResult<u8> {
        let bytes = self.read_binary(1).await?;
        bytes
            .first()
            .copied()
            .ok_or(MeasureError::Timeout(self.options.timeout))
    }

    /// Collect up to `count` raw bytes, reading repeatedly until they are all
    /// in or the timeout elapses.
    ///
    /// A shortfall is not an error here; the returned vector is simply shorter
    /// than `count` and the caller decides what that means.
    pub async fn read_binary(&mut self, count: usize) -> AppResult<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + self.options.timeout;
        let mut data = vec![0u8; count];
        let mut filled = 0;

        while filled < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let n = self
                .transport()?
                .read(&mut data[filled..], remaining)
                .await?;
            if n == 0 {
                tokio::time::sleep(BINARY_POLL.min(remaining)).await;
            }
            filled += n;
        }

        data.truncate(filled);
        Ok(data)
    }

    /// Discard stale input so the next reply pairs with the next request.
    pub async fn flush(&mut self) {
        let address = self.address.clone();
        if let Ok(transport) = self.transport() {
            if let Err(e) = transport.flush_input().await {
                debug!("[{}] flush failed: {}", address, e);
            }
        }
    }

    /// Flush, send `query`, and read the reply.
    ///
    /// An empty reply means the instrument did not answer. No retry.
    pub async fn ask(&mut self, query: &str) -> AppResult<String> {
        self.flush().await;
        self.write(query).await?;
        Ok(self.read_string().await)
    }

    /// [`ask`](Self::ask) and parse the reply as a number.
    ///
    /// # Errors
    /// [`MeasureError::NoResponse`] on an empty reply, [`MeasureError::Parse`]
    /// if the reply is not a number.
    pub async fn poll_float(&mut self, query: &str) -> AppResult<f64> {
        let reply = self.ask(query).await?;
        if reply.is_empty() {
            return Err(MeasureError::NoResponse {
                address: self.address.clone(),
                query: query.to_string(),
            });
        }
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| MeasureError::parse(query, reply))
    }

    /// Read the instrument identification with `*IDN?`.
    ///
    /// If the first attempt gets no answer, waits [`IDN_RETRY_DELAY`] and asks
    /// once more. The result is remembered as [`name`](Self::name).
    pub async fn query_idn(&mut self) -> AppResult<String> {
        let mut name = self.ask("*IDN?").await?;
        if name.is_empty() {
            warn!("[{}] no reply to *IDN?, retrying once", self.address);
            tokio::time::sleep(IDN_RETRY_DELAY).await;
            name = self.ask("*IDN?").await?;
        }
        if name.is_empty() {
            return Err(MeasureError::NoResponse {
                address: self.address.clone(),
                query: "*IDN?".to_string(),
            });
        }
        self.name = name.trim().to_string();
        Ok(self.name.clone())
    }
}

/// Find the serial port an instrument is attached to.
///
/// Ports are probed highest-numbered first, Bluetooth ports are skipped, and the
/// first port whose `*IDN?` reply contains `id` wins. If none answers, the
/// highest port that could be opened is returned; `None` if no port is usable.
pub async fn find_serial_port(id: &str, baud_rate: u32, eol: Eol) -> AppResult<Option<String>> {
    let ports = adapters::available_serial_ports()?;
    let options = ConnectionOptions::default()
        .with_baud_rate(baud_rate)
        .with_eol(eol)
        .with_timeout(Duration::from_millis(200));

    let mut highest = None;
    for port in ports.iter().rev().filter(|p| !p.bluetooth) {
        if adapters::check_serial_port(&port.name).is_err() {
            continue;
        }
        let Ok(mut conn) = Connection::open(&port.name, options.clone()).await else {
            continue;
        };
        if highest.is_none() {
            highest = Some(port.name.clone());
        }
        let reply = conn.ask("*IDN?").await.unwrap_or_default();
        conn.close().await;
        if reply.contains(id) {
            info!("Found '{}' on {}", id, port.name);
            return Ok(Some(port.name.clone()));
        }
    }
    Ok(highest)
}
