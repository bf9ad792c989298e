//! Duplex channel: one receive loop and one send loop per connection.
//!
//! Producers never touch the socket. They enqueue through an [`Outbox`],
//! which assigns the sequence number and encodes the frame; a dedicated
//! send task drains the queue in order and batches ready frames into
//! vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Producer 1 ─┐                                              ┌─► incoming queue
//! Producer 2 ─┼─► Outbox ─► mpsc ─► send loop ─► socket ─► receive loop
//! Producer N ─┘
//! ```
//!
//! Whichever loop stops first records a [`ChannelExit`] and signals the
//! other one. The exit is recorded exactly once.

use std::fmt;
use std::io::IoSlice;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{CrossfireError, Result};
use crate::protocol::{FrameBuffer, Message, OutboundFrame, DEFAULT_MAX_CONTENT_LENGTH};
use crate::sequence::SequenceCorrelator;

/// Socket reads are bounded to this many bytes.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the channel loops.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Longest a single socket read may block. `None` allows idle peers.
    pub read_timeout: Option<Duration>,
    /// Largest accepted `Content-Length`.
    pub max_content_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    /// The peer announced a `closed` event.
    PeerClosed,
    /// The peer closed the socket between frames.
    Eof,
    /// Local shutdown was requested.
    Shutdown,
    /// Decode error, I/O error, or read timeout.
    Failed(String),
}

impl ChannelExit {
    /// Whether the channel stopped because of an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelExit::Failed(_))
    }
}

impl fmt::Display for ChannelExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelExit::PeerClosed => write!(f, "peer sent closed"),
            ChannelExit::Eof => write!(f, "peer closed the connection"),
            ChannelExit::Shutdown => write!(f, "shut down locally"),
            ChannelExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Shared stop signal plus the write-once exit report.
#[derive(Debug)]
struct ExitSlot {
    exit: watch::Sender<Option<ChannelExit>>,
    stop: watch::Sender<bool>,
}

impl ExitSlot {
    fn new() -> Self {
        let (exit, _) = watch::channel(None);
        let (stop, _) = watch::channel(false);
        Self { exit, stop }
    }

    /// Record `exit` unless another one already was, then stop both loops.
    fn finish(&self, exit: ChannelExit) {
        let reported = exit.clone();
        let recorded = self.exit.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reported);
                true
            } else {
                false
            }
        });

        if recorded {
            match &exit {
                ChannelExit::Failed(reason) => tracing::error!("Channel failed: {}", reason),
                other => tracing::debug!("Channel stopped: {}", other),
            }
        }
        self.stop.send_replace(true);
    }
}

/// Cloneable handle for enqueueing outgoing messages.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    correlator: Arc<SequenceCorrelator>,
    /// Keeps sequence order equal to queue order across producers.
    enqueue_lock: Arc<Mutex<()>>,
}

impl Outbox {
    /// Enqueue a message. Never blocks on the socket.
    ///
    /// A message without a sequence number gets the next one from the
    /// correlator. Returns the sequence number it was sent with.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the send loop has stopped
    /// - encoding errors from the frame codec
    pub fn send(&self, mut message: Message) -> Result<u64> {
        let _guard = self
            .enqueue_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.tx.is_closed() {
            return Err(CrossfireError::ConnectionClosed);
        }

        let seq = match message.seq {
            Some(seq) => seq,
            None => {
                let seq = self.correlator.next_seq();
                message.seq = Some(seq);
                seq
            }
        };

        let frame = OutboundFrame::encode(&message)?;
        self.tx
            .send(frame)
            .map_err(|_| CrossfireError::ConnectionClosed)?;
        Ok(seq)
    }

    /// Whether the send loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running pair of channel loops over one established connection.
#[derive(Debug)]
pub struct DuplexChannel {
    outbox: Outbox,
    slot: Arc<ExitSlot>,
    receive_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl DuplexChannel {
    /// Spawn both loops.
    ///
    /// Decoded messages go to `incoming` in wire order.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        correlator: Arc<SequenceCorrelator>,
        incoming: mpsc::UnboundedSender<Message>,
        config: ChannelConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ExitSlot::new());

        let receive_task = tokio::spawn(receive_loop(
            reader,
            FrameBuffer::with_max_content_length(config.max_content_length),
            Arc::clone(&correlator),
            incoming,
            config.read_timeout,
            Arc::clone(&slot),
        ));
        let send_task = tokio::spawn(send_loop(rx, writer, Arc::clone(&slot)));

        tracing::debug!("Channel loops started");

        Self {
            outbox: Outbox {
                tx,
                correlator,
                enqueue_lock: Arc::new(Mutex::new(())),
            },
            slot,
            receive_task,
            send_task,
        }
    }

    /// Handle for enqueueing messages.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Enqueue a message. See [`Outbox::send`].
    pub fn send(&self, message: Message) -> Result<u64> {
        self.outbox.send(message)
    }

    /// The recorded exit, if the channel has stopped.
    pub fn exit(&self) -> Option<ChannelExit> {
        self.slot.exit.borrow().clone()
    }

    /// Wait until the channel stops and return why.
    pub async fn closed(&self) -> ChannelExit {
        let mut rx = self.slot.exit.subscribe();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).clone(),
            Err(_) => None,
        };
        exit.unwrap_or(ChannelExit::Shutdown)
    }

    /// Stop both loops and wait for them, at most `timeout`.
    ///
    /// Frames already queued are still written unless the socket is stuck.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the loops had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> Result<ChannelExit> {
        self.slot.finish(ChannelExit::Shutdown);

        let DuplexChannel {
            slot,
            mut receive_task,
            mut send_task,
            ..
        } = self;

        let joined = tokio::time::timeout(timeout, async {
            let _ = (&mut send_task).await;
            let _ = (&mut receive_task).await;
        })
        .await;

        let exit = slot.exit.borrow().clone().unwrap_or(ChannelExit::Shutdown);

        if joined.is_err() {
            receive_task.abort();
            send_task.abort();
            tracing::warn!("Channel loops did not stop within {:?}, aborted", timeout);
            return Err(CrossfireError::ShutdownTimeout);
        }
        Ok(exit)
    }
}

/// Receive loop - reads chunks, decodes frames, delivers messages.
async fn receive_loop<R>(
    mut reader: R,
    mut frames: FrameBuffer,
    correlator: Arc<SequenceCorrelator>,
    incoming: mpsc::UnboundedSender<Message>,
    read_timeout: Option<Duration>,
    slot: Arc<ExitSlot>,
) where
    R: AsyncRead + Unpin,
{
    let mut stop = slot.stop.subscribe();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let exit = 'read: loop {
        let read = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break ChannelExit::Shutdown,
            read = read_chunk(&mut reader, &mut buf, read_timeout) => read,
        };

        let n = match read {
            Ok(0) if frames.has_partial_frame() => {
                break ChannelExit::Failed("connection closed mid-frame".to_string())
            }
            Ok(0) => break ChannelExit::Eof,
            Ok(n) => n,
            Err(e) => break ChannelExit::Failed(e.to_string()),
        };

        let decoded = match frames.push(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => break ChannelExit::Failed(e.to_string()),
        };

        for frame in decoded {
            let message = frame.message;
            if let Some(seq) = message.seq {
                correlator.observe(seq);
            }

            let closed = message.is_closed_event();
            if incoming.send(message).is_err() {
                break 'read ChannelExit::Shutdown;
            }
            if closed {
                break 'read ChannelExit::PeerClosed;
            }
        }
    };

    slot.finish(exit);
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], timeout: Option<Duration>) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?,
        None => reader.read(buf).await,
    }
}

/// Send loop - drains the queue in order and writes batches.
async fn send_loop<W>(mut rx: mpsc::UnboundedReceiver<OutboundFrame>, mut writer: W, slot: Arc<ExitSlot>)
where
    W: AsyncWrite + Unpin,
{
    let mut stop = slot.stop.subscribe();

    let exit = loop {
        // queued frames win over the stop signal
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break ChannelExit::Shutdown,
            },
            _ = stop.wait_for(|stopped| *stopped) => break ChannelExit::Shutdown,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            break ChannelExit::Failed(e.to_string());
        }
    };

    rx.close();
    let _ = writer.shutdown().await;
    slot.finish(exit);
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Header and body of a frame are always written back to back; a partial
/// write is resumed from the exact byte it stopped at.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(CrossfireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header, &frame.body] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, MessageType};
    use std::io::Cursor;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    const JOIN: Duration = Duration::from_secs(2);

    struct Harness {
        channel: DuplexChannel,
        incoming: mpsc::UnboundedReceiver<Message>,
        correlator: Arc<SequenceCorrelator>,
        peer: DuplexStream,
    }

    fn harness(config: ChannelConfig) -> Harness {
        let (local, peer) = duplex(64 * 1024);
        let (reader, writer): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) = split(local);
        let (tx, incoming) = mpsc::unbounded_channel();
        let correlator = Arc::new(SequenceCorrelator::new(1));
        let channel = DuplexChannel::spawn(reader, writer, Arc::clone(&correlator), tx, config);
        Harness {
            channel,
            incoming,
            correlator,
            peer,
        }
    }

    fn frame_bytes(body: &str) -> Vec<u8> {
        format!("Content-Length:{}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn frame(body: &str) -> OutboundFrame {
        let msg = Message::from_json_slice(body.as_bytes()).unwrap();
        OutboundFrame::encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_send_assigns_increasing_sequence() {
        let mut h = harness(ChannelConfig::default());

        let first = h.channel.send(Command::new("", "version").into_message()).unwrap();
        let second = h
            .channel
            .send(Command::new("", "listcontexts").into_message())
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let mut decoder = FrameBuffer::new();
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while seen.len() < 2 {
            let n = h.peer.read(&mut buf).await.unwrap();
            seen.extend(decoder.push(&buf[..n]).unwrap());
        }
        assert_eq!(seen[0].message.seq, Some(1));
        assert_eq!(seen[0].message.command.as_deref(), Some("version"));
        assert_eq!(seen[1].message.seq, Some(2));
    }

    #[tokio::test]
    async fn test_preassigned_sequence_is_kept() {
        let h = harness(ChannelConfig::default());
        let mut msg = Message::new(MessageType::Event);
        msg.seq = Some(40);

        assert_eq!(h.channel.send(msg).unwrap(), 40);
        assert_eq!(h.correlator.peek_next(), 1);
    }

    #[tokio::test]
    async fn test_receive_delivers_in_order() {
        let mut h = harness(ChannelConfig::default());

        let mut data = frame_bytes(r#"{"type":"event","event":"onScript","seq":3}"#);
        data.extend(frame_bytes(r#"{"type":"response","seq":4,"request_seq":1}"#));
        h.peer.write_all(&data).await.unwrap();

        let first = h.incoming.recv().await.unwrap();
        let second = h.incoming.recv().await.unwrap();
        assert_eq!(first.event.as_deref(), Some("onScript"));
        assert_eq!(second.request_seq(), Some(1));
        assert_eq!(h.correlator.last_seen(), Some(4));
    }

    #[tokio::test]
    async fn test_closed_event_stops_channel() {
        let mut h = harness(ChannelConfig::default());

        h.peer
            .write_all(&frame_bytes(r#"{"type":"event","event":"closed","seq":5}"#))
            .await
            .unwrap();

        assert_eq!(h.channel.closed().await, ChannelExit::PeerClosed);
        assert!(h.incoming.recv().await.unwrap().is_closed_event());
    }

    #[tokio::test]
    async fn test_garbage_fails_exactly_once() {
        let mut h = harness(ChannelConfig::default());

        h.peer.write_all(b"this is not a frame\r\n").await.unwrap();

        let exit = h.channel.closed().await;
        assert!(exit.is_failure());
        assert_eq!(h.channel.exit(), Some(exit.clone()));

        // later input cannot produce a second report
        let _ = h.peer.write_all(&frame_bytes("{}")).await;
        assert_eq!(h.channel.shutdown(JOIN).await.unwrap(), exit);
        assert!(h.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let h = harness(ChannelConfig::default());
        drop(h.peer);
        assert_eq!(h.channel.closed().await, ChannelExit::Eof);
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_failure() {
        let mut h = harness(ChannelConfig::default());
        h.peer.write_all(b"Content-Length:20\r\n\r\n{\"se").await.unwrap();
        drop(h.peer);

        let exit = h.channel.closed().await;
        assert_eq!(exit, ChannelExit::Failed("connection closed mid-frame".into()));
    }

    #[tokio::test]
    async fn test_read_timeout_is_failure() {
        let h = harness(ChannelConfig {
            read_timeout: Some(Duration::from_millis(30)),
            ..ChannelConfig::default()
        });

        let exit = h.channel.closed().await;
        assert!(exit.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue_and_rejects_sends() {
        let mut h = harness(ChannelConfig::default());
        let outbox = h.channel.outbox();

        outbox.send(Command::new("", "version").into_message()).unwrap();
        let exit = h.channel.shutdown(JOIN).await.unwrap();
        assert_eq!(exit, ChannelExit::Shutdown);

        let mut written = Vec::new();
        h.peer.read_to_end(&mut written).await.unwrap();
        assert!(written.starts_with(b"Content-Length:"));

        assert!(outbox.is_closed());
        assert!(matches!(
            outbox.send(Command::new("", "version").into_message()),
            Err(CrossfireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_wire_order() {
        let mut h = harness(ChannelConfig::default());

        let mut producers = Vec::new();
        for p in 0..4 {
            let outbox = h.channel.outbox();
            producers.push(tokio::spawn(async move {
                for i in 0..25 {
                    let cmd = Command::new("", "evaluate").with_argument("n", (p * 100 + i).into());
                    outbox.send(cmd.into_message()).unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }

        let mut decoder = FrameBuffer::new();
        let mut seqs = Vec::new();
        let mut buf = [0u8; 4096];
        while seqs.len() < 100 {
            let n = h.peer.read(&mut buf).await.unwrap();
            for f in decoder.push(&buf[..n]).unwrap() {
                seqs.push(f.message.seq.unwrap());
            }
        }
        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![frame("{}")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2); // header + body
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame("{}")];
        let header_len = batch[0].header.len();

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), header_len - 5);
        assert_eq!(slices[1].len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_second_frame() {
        let batch = vec![frame("{}"), frame(r#"{"seq":1}"#)];
        let skip = batch[0].size() + 3;

        let slices = build_remaining_slices(&batch, skip);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), batch[1].header.len() - 3);
        assert_eq!(slices[1].len(), batch[1].body.len());
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(r#"{"seq":1}"#)).collect();
        let expected: usize = batch.iter().map(OutboundFrame::size).sum();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), expected);
    }
}
