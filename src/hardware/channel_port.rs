//! In-memory byte stream backed by a pair of channels.
//!
//! `pair()` returns a `ChannelPort`, which implements `AsyncRead` and
//! `AsyncWrite` and can be boxed into a [`ScpiPort`](super::transport::ScpiPort)
//! like any real serial port, and a `DevicePeer` holding the other end.
//!
//! Tests use the peer as a scripted instrument: assert on the command lines
//! a driver writes and feed back canned responses. The VISA bridge uses the
//! peer from a blocking thread to shuttle lines to and from a VISA session.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut device) = channel_port::pair();
//! let dmm = Keithley2000::from_port(ScpiPort::new("test", Box::new(port)));
//!
//! let (value, _) = tokio::join!(dmm.read_one(), async {
//!     device.expect_command("sens:data?").await;
//!     device.send_line("+1.2E-3\r\n");
//! });
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// The driver-facing end of the channel pair.
#[derive(Debug)]
pub struct ChannelPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// The instrument-facing end of the channel pair.
#[derive(Debug)]
pub struct DevicePeer {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected `ChannelPort` / `DevicePeer` pair.
pub fn pair() -> (ChannelPort, DevicePeer) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    (
        ChannelPort {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        DevicePeer {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

impl AsyncRead for ChannelPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Peer dropped: end-of-file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device peer disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl DevicePeer {
    /// Queue bytes for the driver to read.
    ///
    /// Returns `false` if the driver end has been dropped.
    pub fn send_line(&self, data: impl AsRef<[u8]>) -> bool {
        self.reads_tx.send(data.as_ref().to_vec()).is_ok()
    }

    /// Wait for the next complete command line written by the driver.
    ///
    /// Lines end at `\n` or `\r`; the terminator is stripped and empty lines
    /// (the `\n` half of a `\r\n` pair) are skipped. Returns `None` once the
    /// driver end is gone or nothing arrives within two seconds.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Some(line);
            }
            match tokio::time::timeout(PEER_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Blocking counterpart of [`next_line`](Self::next_line) without the
    /// timeout, for use from a dedicated I/O thread.
    pub fn blocking_next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Some(line);
            }
            let chunk = self.writes_rx.blocking_recv()?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Assert that the driver's next command line equals `expected`.
    ///
    /// # Panics
    /// Panics on mismatch or when no line arrives in time.
    pub async fn expect_command(&mut self, expected: &str) {
        match self.next_line().await {
            Some(line) => assert_eq!(
                line, expected,
                "unexpected command: expected `{}`, got `{}`",
                expected, line
            ),
            None => panic!("timed out waiting for command `{}`", expected),
        }
    }

    /// Assert a sequence of command lines in order.
    pub async fn expect_commands(&mut self, expected: &[&str]) {
        for cmd in expected {
            self.expect_command(cmd).await;
        }
    }

    /// Assert a query and answer it.
    pub async fn expect_query(&mut self, expected: &str, response: &str) {
        self.expect_command(expected).await;
        assert!(self.send_line(response), "driver end dropped before response");
    }

    /// Collect every line written so far, waiting briefly for stragglers.
    pub async fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), self.writes_rx.recv()).await
        {
            self.write_buffer.extend_from_slice(&chunk);
        }
        while let Some(line) = self.take_buffered_line() {
            lines.push(line);
        }
        lines
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        loop {
            let end = self
                .write_buffer
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')?;
            let line: Vec<u8> = self.write_buffer.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]).into_owned();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn command_response_round_trip() {
        let (port, mut device) = pair();
        let mut port = BufReader::new(port);

        let app = tokio::spawn(async move {
            port.write_all(b"*IDN?\r\n").await.unwrap();
            let mut response = String::new();
            port.read_line(&mut response).await.unwrap();
            response
        });

        device.expect_query("*IDN?", "KEITHLEY,MODEL 2000,123,A01\r\n").await;
        assert_eq!(app.await.unwrap(), "KEITHLEY,MODEL 2000,123,A01\r\n");
    }

    #[tokio::test]
    async fn lines_split_on_either_terminator() {
        let (mut port, mut device) = pair();
        port.write_all(b"FREQ 137.0\rSLVL 0.5\r\nOUTP? 1\n").await.unwrap();

        assert_eq!(
            device.drain_lines().await,
            vec!["FREQ 137.0", "SLVL 0.5", "OUTP? 1"]
        );
    }

    #[tokio::test]
    async fn partial_writes_are_reassembled() {
        let (mut port, mut device) = pair();
        port.write_all(b"trac:").await.unwrap();
        port.write_all(b"data?\n").await.unwrap();

        device.expect_command("trac:data?").await;
    }

    #[tokio::test]
    async fn dropped_peer_is_broken_pipe() {
        let (mut port, device) = pair();
        drop(device);
        let err = port.write_all(b"init\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn dropped_port_reads_as_eof() {
        let (port, mut device) = pair();
        drop(port);
        assert!(device.next_line().await.is_none());
    }
}
