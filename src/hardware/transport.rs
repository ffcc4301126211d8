//! Terminated line I/O for SCPI instruments.
//!
//! Every driver in this crate talks to its instrument through a
//! [`ScpiPort`]: write a command with the instrument's write termination,
//! and for queries read one response line up to the read termination. The
//! byte stream underneath is anything implementing [`SerialPortIO`], so the
//! same port works over RS-232, raw TCP sockets, Linux USBTMC devices, the
//! VISA bridge, and the in-memory [`channel_port`](super::channel_port) used
//! in tests.

use crate::error::{DaqError, DaqResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Byte stream usable as an instrument transport.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed transport stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Default time to wait for a response line.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long [`ScpiPort::flush_input`] waits for more bytes before it stops.
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// A command/response channel to one instrument.
pub struct ScpiPort {
    resource: String,
    stream: BufReader<DynSerial>,
    write_termination: String,
    read_termination: u8,
    timeout: Duration,
    stale_input: bool,
}

impl ScpiPort {
    /// Wrap an open stream.
    ///
    /// Defaults: `"\n"` write termination, `b'\n'` read termination, two
    /// second timeout.
    pub fn new(resource: impl Into<String>, stream: DynSerial) -> Self {
        Self {
            resource: resource.into(),
            stream: BufReader::new(stream),
            write_termination: "\n".to_string(),
            read_termination: b'\n',
            timeout: DEFAULT_TIMEOUT,
            stale_input: false,
        }
    }

    /// Set the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the string appended to every command
    pub fn with_write_termination(mut self, termination: impl Into<String>) -> Self {
        self.write_termination = termination.into();
        self
    }

    /// Set the byte that ends a response line
    pub fn with_read_termination(mut self, termination: u8) -> Self {
        self.read_termination = termination;
        self
    }

    /// Resource string this port was opened from.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current response timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the response timeout on an open port.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one command.
    pub async fn write(&mut self, command: &str) -> DaqResult<()> {
        tracing::debug!(resource = %self.resource, cmd = %command, "write");
        let line = format!("{}{}", command, self.write_termination);
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send several commands in order.
    pub async fn write_all<S: AsRef<str>>(&mut self, commands: &[S]) -> DaqResult<()> {
        for command in commands {
            self.write(command.as_ref()).await?;
        }
        Ok(())
    }

    /// Read one response line, without its terminator.
    ///
    /// On timeout any partial line is dropped and the port is marked stale:
    /// the next [`query`](Self::query) flushes pending input first, so a
    /// reply that arrives late is never taken as the answer to a later query.
    pub async fn read_line(&mut self) -> DaqResult<String> {
        let mut raw = Vec::new();
        let read = match tokio::time::timeout(
            self.timeout,
            self.stream.read_until(self.read_termination, &mut raw),
        )
        .await
        {
            Ok(read) => read?,
            Err(_) => {
                self.stale_input = true;
                return Err(DaqError::Timeout {
                    resource: self.resource.clone(),
                    timeout_ms: self.timeout.as_millis(),
                });
            }
        };

        if read == 0 {
            return Err(DaqError::ConnectionClosed(self.resource.clone()));
        }

        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(['\r', '\n']).to_string();
        tracing::debug!(resource = %self.resource, response = %line, "read");
        Ok(line)
    }

    /// Send a query and read its response line.
    pub async fn query(&mut self, command: &str) -> DaqResult<String> {
        if self.stale_input {
            self.flush_input().await?;
        }
        self.write(command).await?;
        self.read_line().await
    }

    /// Discard buffered input and anything the instrument has already sent.
    ///
    /// Stops once no byte arrives for a short poll interval or the stream
    /// ends. Returns the number of bytes dropped.
    pub async fn flush_input(&mut self) -> DaqResult<usize> {
        let mut discarded = 0;
        while let Ok(available) = tokio::time::timeout(FLUSH_POLL, self.stream.fill_buf()).await {
            let len = available?.len();
            if len == 0 {
                break;
            }
            self.stream.consume(len);
            discarded += len;
        }
        self.stale_input = false;
        if discarded > 0 {
            tracing::debug!(resource = %self.resource, bytes = discarded, "flushed stale input");
        }
        Ok(discarded)
    }

    /// Send a query whose response is a comma-separated list of numbers.
    pub async fn query_ascii_values(&mut self, command: &str) -> DaqResult<Vec<f64>> {
        let response = self.query(command).await?;
        parse_ascii_values(&response)
    }

    /// Shut the stream down.
    pub async fn shutdown(&mut self) -> DaqResult<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ScpiPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScpiPort")
            .field("resource", &self.resource)
            .field("write_termination", &self.write_termination)
            .field("read_termination", &self.read_termination)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Parse a comma-separated list of ASCII numbers.
///
/// Whitespace around elements is ignored. An empty response is an error
/// since every query that uses this expects at least one reading.
pub fn parse_ascii_values(response: &str) -> DaqResult<Vec<f64>> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(DaqError::parse(response, "empty response"));
    }

    trimmed
        .split(',')
        .map(|element| {
            let element = element.trim();
            element
                .parse::<f64>()
                .map_err(|e| DaqError::parse(response, format!("element '{}': {}", element, e)))
        })
        .collect()
}

/// Strip an IEEE 488.2 definite-length block header (`#<n><len>`) from an
/// ASCII payload.
///
/// Payloads without a header are returned unchanged.
pub fn strip_block_header(response: &str) -> DaqResult<&str> {
    let Some(rest) = response.strip_prefix('#') else {
        return Ok(response);
    };

    let digits = rest
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| DaqError::parse(response, "block header without digit count"))?
        as usize;

    if digits == 0 {
        // Indefinite-length block: payload runs to the terminator
        return Ok(&rest[1..]);
    }

    let length_field = rest
        .get(1..1 + digits)
        .ok_or_else(|| DaqError::parse(response, "truncated block header"))?;
    let length: usize = length_field
        .parse()
        .map_err(|_| DaqError::parse(response, "non-numeric block length"))?;

    let payload = &rest[1 + digits..];
    Ok(payload.get(..length).unwrap_or(payload))
}

/// Split a flat reading list into `stride` interleaved columns.
///
/// `deinterleave(&[v0, t0, v1, t1], 2)` gives `[[v0, v1], [t0, t1]]`.
pub fn deinterleave(values: &[f64], stride: usize) -> DaqResult<Vec<Vec<f64>>> {
    if stride == 0 || values.len() % stride != 0 {
        return Err(DaqError::parse(
            format!("{} values", values.len()),
            format!("expected a multiple of {}", stride),
        ));
    }

    Ok((0..stride)
        .map(|offset| values.iter().skip(offset).step_by(stride).copied().collect())
        .collect())
}
