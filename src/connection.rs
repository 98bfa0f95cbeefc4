//! TLS connection management with line-delimited framing.
//!
//! Electrum servers speak newline-delimited JSON over TLS. This module owns
//! the byte stream: it frames arbitrary inbound chunks into complete
//! statements, writes delimited frames, and tracks the keep-alive clock.
//! The [`Transport`] trait abstracts statement I/O so the client can run
//! over TLS in production or channel-backed mocks in tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::diag;
use crate::error::{Error, Result};
use crate::protocol::{self, RequestId, KEEP_ALIVE_ID, STATEMENT_DELIMITER};

/// Inbound chunk accumulator.
///
/// Appends each chunk to a buffer; whenever the buffer contains the
/// delimiter, every part except the last is queued as a complete statement
/// and the last (possibly empty) part is retained. Statements come out
/// exactly once and in arrival order, and a partial trailing statement
/// survives arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    buf: String,
    ready: VecDeque<String>,
}

impl FrameBuffer {
    /// Absorb one inbound chunk.
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        if !self.buf.contains(STATEMENT_DELIMITER) {
            return;
        }

        let mut tail = String::new();
        let mut parts = self.buf.split(STATEMENT_DELIMITER).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_some() {
                self.ready.push_back(part.to_string());
            } else {
                tail = part.to_string();
            }
        }
        self.buf = tail;
    }

    /// Next complete statement, if any.
    pub fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// The retained partial trailing statement.
    #[cfg(test)]
    pub fn residue(&self) -> &str {
        &self.buf
    }
}

/// Statement-level I/O over one peer connection.
///
/// `next_statement` returns `None` on clean connection close.
#[async_trait]
pub(crate) trait Transport: Send {
    /// Read the next complete statement.
    async fn next_statement(&mut self) -> Result<Option<String>>;

    /// Write one frame, delimited.
    async fn send_frame(&mut self, frame: &str) -> Result<()>;
}

/// Production transport: a rustls stream framed by [`FrameBuffer`].
pub(crate) struct TlsTransport {
    reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    framer: FrameBuffer,
}

impl TlsTransport {
    /// Dial `host:port` and complete the TLS handshake.
    ///
    /// The TCP socket gets Nagle disabled and OS-level keep-alive enabled
    /// before the TLS layer is negotiated. Certificate validation is
    /// rustls's, against the webpki root store.
    async fn dial(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(1));
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let tls = connector.connect(server_name, stream).await?;
        let (reader, writer) = tokio::io::split(tls);
        Ok(Self {
            reader,
            writer,
            framer: FrameBuffer::default(),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn next_statement(&mut self) -> Result<Option<String>> {
        loop {
            while let Some(statement) = self.framer.pop() {
                if statement.trim().is_empty() {
                    continue;
                }
                trace!(target: diag::SERVER, rx = %statement, "statement");
                return Ok(Some(statement));
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.framer.push(&String::from_utf8_lossy(&chunk[..n]));
        }
    }

    async fn send_frame(&mut self, frame: &str) -> Result<()> {
        trace!(target: diag::SERVER, tx = %frame, "statement");
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// One peer connection: a transport plus the keep-alive clock.
///
/// Every send rearms the clock; when the idle deadline passes without
/// traffic, the owner is expected to call [`ping`](Connection::ping), which
/// is itself a send and so rearms the clock again. A `keep_alive` of zero
/// disables the clock entirely.
pub(crate) struct Connection {
    transport: Box<dyn Transport>,
    keep_alive: Duration,
    last_send: Instant,
}

impl Connection {
    /// Wrap an established transport.
    pub fn new(transport: Box<dyn Transport>, keep_alive: Duration) -> Self {
        Self {
            transport,
            keep_alive,
            last_send: Instant::now(),
        }
    }

    /// Dial a server over TLS, bounded by the initial-connect timeout.
    ///
    /// The timeout covers TCP establishment and the TLS handshake; once the
    /// transport is up it no longer applies.
    pub async fn open(
        host: &str,
        port: u16,
        keep_alive: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        debug!(target: diag::ACTION, host, port, "connecting");
        let transport = tokio::time::timeout(timeout, TlsTransport::dial(host, port))
            .await
            .map_err(|_| Error::Timeout)??;
        debug!(target: diag::EVENTS, host, port, "transport up");
        Ok(Self::new(Box::new(transport), keep_alive))
    }

    /// Read the next statement.
    pub async fn next_statement(&mut self) -> Result<Option<String>> {
        self.transport.next_statement().await
    }

    /// Write one frame and rearm the keep-alive clock.
    pub async fn send(&mut self, frame: &str) -> Result<()> {
        self.last_send = Instant::now();
        self.transport.send_frame(frame).await
    }

    /// Send a `server.ping` bearing the keep-alive sentinel id.
    pub async fn ping(&mut self) -> Result<()> {
        debug!(target: diag::ACTION, "keep-alive ping");
        let frame = protocol::build_request("server.ping", &[], RequestId::name(KEEP_ALIVE_ID))?;
        self.send(&frame).await
    }

    /// When the keep-alive timer should fire, or `None` when disabled.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.keep_alive.is_zero() {
            None
        } else {
            Some(self.last_send + self.keep_alive)
        }
    }
}

/// Log library activity when a test runs with RUST_LOG set. Safe to call
/// from every test; only the first call installs the subscriber.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Channel-backed transport for deterministic testing.
///
/// Statements travel over unbounded mpsc channels rather than a socket, so
/// tests compose with `tokio::time::pause()`. Create a pair with
/// [`MockTransport::pair()`]; the transport is the client's side, the
/// handle is the test's side. Dropping the handle reads as EOF.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    rx: tokio::sync::mpsc::UnboundedReceiver<String>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn next_statement(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn send_frame(&mut self, frame: &str) -> Result<()> {
        self.tx
            .send(frame.to_string())
            .map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Feed a statement to the client.
    pub fn send(&self, statement: impl Into<String>) {
        self.tx.send(statement.into()).expect("transport dropped");
    }

    /// Read the next frame the client wrote.
    pub async fn recv(&mut self) -> String {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Like [`recv`](Self::recv), but `None` once the transport is gone.
    /// For stub-server loops that outlive the client.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Feed a statement, ignoring a torn-down transport.
    pub fn try_send(&self, statement: impl Into<String>) {
        let _ = self.tx.send(statement.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(framer: &mut FrameBuffer) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(statement) = framer.pop() {
            out.push(statement);
        }
        out
    }

    #[test]
    fn single_chunk_multiple_statements() {
        let mut framer = FrameBuffer::default();
        framer.push("{\"id\":1}\n{\"id\":2}\n");
        assert_eq!(drain(&mut framer), vec!["{\"id\":1}", "{\"id\":2}"]);
        assert_eq!(framer.residue(), "");
    }

    #[test]
    fn partial_statement_survives_chunk_boundary() {
        let mut framer = FrameBuffer::default();
        framer.push("{\"id\":1,\"result\":\"a\"}\n{\"id\":2,\"resu");
        assert_eq!(drain(&mut framer), vec!["{\"id\":1,\"result\":\"a\"}"]);
        assert_eq!(framer.residue(), "{\"id\":2,\"resu");

        framer.push("lt\":\"b\"}\n");
        assert_eq!(drain(&mut framer), vec!["{\"id\":2,\"result\":\"b\"}"]);
        assert_eq!(framer.residue(), "");
    }

    #[test]
    fn terminating_delimiter_resets_buffer() {
        let mut framer = FrameBuffer::default();
        framer.push("abc");
        assert_eq!(framer.residue(), "abc");
        framer.push("\n");
        assert_eq!(drain(&mut framer), vec!["abc"]);
        assert_eq!(framer.residue(), "");
    }

    #[test]
    fn withheld_delimiter_retains_last_statement() {
        let mut framer = FrameBuffer::default();
        framer.push("one\ntwo\nthree");
        assert_eq!(drain(&mut framer), vec!["one", "two"]);
        assert_eq!(framer.residue(), "three");
    }

    #[test]
    fn blank_statements_are_queued_verbatim() {
        let mut framer = FrameBuffer::default();
        framer.push("a\n\nb\n");
        assert_eq!(drain(&mut framer), vec!["a", "", "b"]);
    }

    proptest! {
        /// Any partition of `s₁\ns₂\n…sₙ\n` into chunks yields exactly
        /// s₁…sₙ in order, with an empty residue.
        #[test]
        fn arbitrary_chunking_preserves_statements(
            statements in proptest::collection::vec("[^\n]{0,12}", 1..8),
            cuts in proptest::collection::vec(0usize..64, 0..6),
        ) {
            let wire: String = statements
                .iter()
                .map(|s| format!("{s}\n"))
                .collect();

            let mut boundaries: Vec<usize> =
                cuts.iter().map(|c| c % (wire.len() + 1)).collect();
            boundaries.push(0);
            boundaries.push(wire.len());
            boundaries.sort_unstable();

            let mut framer = FrameBuffer::default();
            for window in boundaries.windows(2) {
                framer.push(&wire[window[0]..window[1]]);
            }

            prop_assert_eq!(drain(&mut framer), statements);
            prop_assert_eq!(framer.residue(), "");
        }

        /// Withholding the final delimiter retains the last statement as
        /// residue and delivers the rest.
        #[test]
        fn withheld_final_delimiter(
            statements in proptest::collection::vec("[^\n]{1,12}", 2..6),
        ) {
            let mut wire: String = statements
                .iter()
                .map(|s| format!("{s}\n"))
                .collect();
            wire.pop();

            let mut framer = FrameBuffer::default();
            framer.push(&wire);

            let expected: Vec<_> =
                statements[..statements.len() - 1].to_vec();
            prop_assert_eq!(drain(&mut framer), expected);
            prop_assert_eq!(framer.residue(), statements[statements.len() - 1].clone());
        }
    }

    #[tokio::test]
    async fn mock_transport_roundtrip() {
        let (mut transport, mut handle) = MockTransport::pair();

        transport.send_frame("{\"id\":1}").await.unwrap();
        assert_eq!(handle.recv().await, "{\"id\":1}");

        handle.send("{\"id\":1,\"result\":null}");
        assert_eq!(
            transport.next_statement().await.unwrap().as_deref(),
            Some("{\"id\":1,\"result\":null}")
        );
    }

    #[tokio::test]
    async fn idle_deadline_follows_sends() {
        tokio::time::pause();

        let (transport, _handle) = MockTransport::pair();
        let mut conn = Connection::new(Box::new(transport), Duration::from_secs(300));

        let armed = conn.idle_deadline().expect("keep-alive enabled");
        tokio::time::advance(Duration::from_secs(200)).await;
        conn.send("{\"id\":1}").await.unwrap();

        let rearmed = conn.idle_deadline().expect("keep-alive enabled");
        assert!(rearmed > armed);
        assert_eq!(rearmed - Instant::now(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn zero_keep_alive_disables_deadline() {
        let (transport, _handle) = MockTransport::pair();
        let conn = Connection::new(Box::new(transport), Duration::ZERO);
        assert!(conn.idle_deadline().is_none());
    }
}
