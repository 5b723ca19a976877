//! One accepted client: line framing on the way in, CRLF replies on the way out

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, Instrument};

use crate::config::RECEIVE_BUFFER_SIZE;
use crate::framer::{decode_ascii, decode_utf8, encode_ascii, is_nul_flood, LineFramer};
use crate::processor::CommandProcessor;
use crate::session::SessionState;
use crate::utils::safe_log_string;

/// Invoked with the connection id once the connection has closed.
pub type ClosedCallback = Box<dyn FnOnce(u64) + Send>;

#[derive(Debug)]
struct Shared {
    last_activity: Mutex<Instant>,
    connected: AtomicBool,
    notify_closed: AtomicBool,
    close_requested: Notify,
}

impl Shared {
    fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }
}

/// The registry's view of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer: Option<SocketAddr>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Time since the connection last produced a complete line
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Asks the connection task to shut down. A pending read is interrupted.
    pub fn close(&self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            self.shared.close_requested.notify_one();
        }
    }

    /// The closed callback will not fire for this connection.
    pub fn suppress_notification(&self) {
        self.shared.notify_closed.store(false, Ordering::Release);
    }
}

pub struct LineConnection<S> {
    id: u64,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    framer: LineFramer,
    buffer: [u8; RECEIVE_BUFFER_SIZE],
    drop_nul_flood: bool,
    shared: Arc<Shared>,
    on_closed: Option<ClosedCallback>,
    closed: bool,
}

impl<S> LineConnection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(
        id: u64,
        stream: S,
        peer: Option<SocketAddr>,
        drop_nul_flood: bool,
    ) -> (Self, ConnectionHandle) {
        let shared = Arc::new(Shared {
            last_activity: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
            notify_closed: AtomicBool::new(true),
            close_requested: Notify::new(),
        });
        let (reader, writer) = tokio::io::split(stream);

        let connection = Self {
            id,
            reader,
            writer,
            framer: LineFramer::new(),
            buffer: [0; RECEIVE_BUFFER_SIZE],
            drop_nul_flood,
            shared: shared.clone(),
            on_closed: None,
            closed: false,
        };
        let handle = ConnectionHandle { id, peer, shared };
        (connection, handle)
    }

    pub fn set_on_closed(&mut self, callback: ClosedCallback) {
        self.on_closed = Some(callback);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.shared.connected.load(Ordering::Acquire)
    }

    /// Sends one reply line; CRLF is appended.
    pub async fn send(&mut self, text: &str) -> io::Result<()> {
        debug!(reply = %safe_log_string(text), "Sending");
        let mut bytes = encode_ascii(text);
        bytes.extend_from_slice(b"\r\n");
        self.send_raw(&bytes).await
    }

    /// Sends bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Next command line, ASCII decoded. `None` once the peer is gone or the
    /// connection was closed.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.read_line().await?.map(|line| decode_ascii(&line)))
    }

    /// Next line of a DATA body, bypassing command dispatch.
    pub async fn read_raw_line(&mut self, utf8: bool) -> io::Result<Option<String>> {
        Ok(self.read_line().await?.map(|line| {
            if utf8 {
                decode_utf8(&line)
            } else {
                decode_ascii(&line)
            }
        }))
    }

    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            // Lines still buffered after a close are discarded
            if !self.is_connected() {
                return Ok(None);
            }
            if let Some(line) = self.framer.next_line() {
                self.shared.touch();
                return Ok(Some(line));
            }

            let read = tokio::select! {
                result = self.reader.read(&mut self.buffer) => result?,
                _ = self.shared.close_requested.notified() => return Ok(None),
            };

            if read == 0 {
                debug!("Peer closed the connection");
                return Ok(None);
            }
            if self.drop_nul_flood && is_nul_flood(&self.buffer[..read], RECEIVE_BUFFER_SIZE) {
                debug!("NUL flood received, treating as disconnect");
                return Ok(None);
            }
            self.framer.push(&self.buffer[..read]);
        }
    }

    /// Shuts the socket down. Safe to call more than once; the closed callback
    /// fires on the first call only.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.connected.store(false, Ordering::Release);

        // The peer may already be gone
        let _ = self.writer.shutdown().await;

        if self.shared.notify_closed.load(Ordering::Acquire) {
            if let Some(callback) = self.on_closed.take() {
                callback(self.id);
            }
        }
    }

    /// Greets the client and dispatches its lines until the connection ends.
    pub async fn run(self, processor: Arc<CommandProcessor>) {
        let span = tracing::info_span!("connection", id = self.id);
        self.serve(processor).instrument(span).await
    }

    async fn serve(mut self, processor: Arc<CommandProcessor>) {
        let greeting = format!("220 {}", processor.hostname());
        if let Err(e) = self.send(&greeting).await {
            debug!(error = %e, "Failed to send greeting");
            self.close().await;
            return;
        }

        let mut session = SessionState::new();
        loop {
            let line = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Receive failed");
                    break;
                }
            };

            if let Err(e) = processor.process(&line, &mut session, &mut self).await {
                tracing::error!(error = %format!("{:#}", e), "Failed to process command");
                break;
            }
            if !self.is_connected() {
                break;
            }
        }

        self.close().await;
        debug!("Connection closed");
    }
}
