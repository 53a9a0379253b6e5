//! Single-writer task that owns the socket's write half.
//!
//! Callers never touch the socket: they push fully encoded frames into an
//! mpsc channel and the task writes them in the order received. A frame's
//! header and body always go out back to back, so frames never interleave.
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Caller N ─┘
//! ```
//!
//! Whatever frames are queued when the task wakes (up to 64) go out in one
//! vectored write. Frames queued but not yet written form the backlog;
//! callers wait while it is full.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};
use crate::protocol::Header;

/// Default backlog size before senders wait.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default wait for the backlog to shrink.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded header (8 or 9 bytes depending on version).
    pub header: Bytes,
    /// Body bytes, already compressed if compression is on.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Encode `header` and pair it with `body`.
    #[inline]
    pub fn new(header: &Header, body: Bytes) -> Self {
        Self {
            header: Bytes::copy_from_slice(header.encode().as_bytes()),
            body,
        }
    }

    /// Bytes this frame puts on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Queued frames at which senders start waiting.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long a sender waits for the backlog to shrink.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Frames accepted by handles but not yet written.
#[derive(Debug, Default)]
struct Backlog {
    frames: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    fn len(&self) -> usize {
        self.frames.load(Ordering::Acquire)
    }

    fn release(&self, written: usize) {
        self.frames.fetch_sub(written, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    async fn wait_below(&self, limit: usize) {
        loop {
            let drained = self.drained.notified();
            if self.len() < limit {
                return;
            }
            drained.await;
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; every clone feeds the same task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backlog: Arc<Backlog>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// # Errors
    ///
    /// `BackpressureTimeout` when the backlog stays full for the configured
    /// timeout, `ConnectionClosed` once the task has exited.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.backlog.len() >= self.max_pending {
            tokio::time::timeout(self.timeout, self.backlog.wait_below(self.max_pending))
                .await
                .map_err(|_| WireError::BackpressureTimeout)?;
        }

        // Counted before the send so the task never releases below zero.
        self.backlog.frames.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.backlog.frames.fetch_sub(1, Ordering::AcqRel);
            WireError::ConnectionClosed
        })
    }
}

/// Spawn the writer task over `writer` (the socket's write half).
///
/// The task ends cleanly when every handle is dropped, and with an error on
/// the first failed write; the `JoinHandle` reports which.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backlog = Arc::new(Backlog::default());

    let handle = WriterHandle {
        tx,
        backlog: backlog.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, backlog));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backlog: Arc<Backlog>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let frames = batch.len();
        if let Err(e) = write_batch(&mut writer, batch.drain(..)).await {
            tracing::error!(error = %e, frames, "socket write failed");
            return Err(e);
        }
        tracing::trace!(frames, "wrote batch");
        backlog.release(frames);
    }
    Ok(())
}

/// Write every frame of `batch` with vectored writes, resuming after
/// partial writes, then flush.
async fn write_batch<W, I>(writer: &mut W, batch: I) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = OutboundFrame>,
{
    let mut parts: VecDeque<Bytes> = batch
        .into_iter()
        .flat_map(|frame| [frame.header, frame.body])
        .filter(|part| !part.is_empty())
        .collect();

    while !parts.is_empty() {
        let written = {
            let slices: Vec<IoSlice<'_>> = parts.iter().map(|p| IoSlice::new(p)).collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            )
            .into());
        }
        consume(&mut parts, written);
    }

    writer.flush().await?;
    Ok(())
}

/// Drop `written` bytes from the front of `parts`.
fn consume(parts: &mut VecDeque<Bytes>, mut written: usize) {
    while written > 0 {
        let Some(front) = parts.front_mut() else {
            return;
        };
        if written < front.len() {
            front.advance(written);
            return;
        }
        written -= front.len();
        parts.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, ProtocolVersion, HEADER_SIZE, LEGACY_HEADER_SIZE};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn query(stream_id: i16, body: &'static [u8]) -> OutboundFrame {
        let header = Header::request(
            ProtocolVersion::V4,
            0,
            stream_id,
            Opcode::Query,
            body.len() as u32,
        );
        OutboundFrame::new(&header, Bytes::from_static(body))
    }

    fn handle_with_backlog(queued: usize, max_pending: usize, timeout: Duration) -> (WriterHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let backlog = Arc::new(Backlog::default());
        backlog.frames.store(queued, Ordering::Release);
        let handle = WriterHandle {
            tx,
            backlog,
            max_pending,
            timeout,
        };
        (handle, rx)
    }

    #[test]
    fn test_outbound_frame_sizes() {
        let frame = query(42, b"hello");
        assert_eq!(frame.header.len(), HEADER_SIZE);
        assert_eq!(frame.size(), HEADER_SIZE + 5);

        let header = Header::request(ProtocolVersion::V2, 0, 3, Opcode::Options, 0);
        assert_eq!(OutboundFrame::new(&header, Bytes::new()).size(), LEGACY_HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10i16 {
            handle.send(query(i, b"abcd")).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(HEADER_SIZE + 4).enumerate() {
            assert_eq!(Header::decode(chunk).unwrap().stream_id, i as i16);
            assert_eq!(&chunk[HEADER_SIZE..], b"abcd");
        }
    }

    #[tokio::test]
    async fn test_partial_writes_resume_mid_frame() {
        // A 5-byte pipe forces the header and body apart.
        let (mut client, mut server) = duplex(5);
        let batch = vec![query(1, b"hello"), query(2, b""), query(3, b"abc")];
        let expected: Vec<u8> = batch
            .iter()
            .flat_map(|f| f.header.iter().chain(f.body.iter()).copied())
            .collect();

        let reader = tokio::spawn(async move {
            let mut out = vec![0u8; expected.len()];
            server.read_exact(&mut out).await.unwrap();
            (out, expected)
        });
        write_batch(&mut client, batch).await.unwrap();

        let (out, expected) = reader.await.unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_consume_across_parts() {
        let mut parts: VecDeque<Bytes> = [&b"abc"[..], b"de", b"fgh"]
            .into_iter()
            .map(Bytes::from_static)
            .collect();
        consume(&mut parts, 4);
        assert_eq!(parts.len(), 2);
        assert_eq!(&parts[0][..], b"e");
        consume(&mut parts, 4);
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn test_write_batch_into_buffer() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| query(i, b"abc")).collect();

        write_batch(&mut buf, batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_while_backlog_full() {
        let (handle, _rx) = handle_with_backlog(4, 4, Duration::from_millis(50));

        let result = handle.send(query(1, b"")).await;
        assert!(matches!(result, Err(WireError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_send_resumes_when_backlog_drains() {
        let (handle, mut rx) = handle_with_backlog(4, 4, Duration::from_secs(5));
        let backlog = handle.backlog.clone();

        let sender = tokio::spawn(async move { handle.send(query(7, b"x")).await });
        tokio::task::yield_now().await;
        assert!(!sender.is_finished());

        backlog.release(1);
        sender.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().body, Bytes::from_static(b"x"));
        assert_eq!(backlog.len(), 4);
    }

    #[tokio::test]
    async fn test_send_after_task_exit() {
        let (handle, rx) = handle_with_backlog(0, 4, Duration::from_secs(1));
        drop(rx);

        assert!(matches!(
            handle.send(query(1, b"")).await,
            Err(WireError::ConnectionClosed)
        ));
        assert_eq!(handle.backlog.len(), 0);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_writer_fails_when_peer_gone() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let _ = handle.send(query(1, b"hello")).await;
        assert!(matches!(task.await.unwrap(), Err(WireError::Io(_))));
    }
}
