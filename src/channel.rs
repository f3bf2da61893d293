// ABOUTME: Wraps one TCP stream with independently buffered send and receive sides
// ABOUTME: Each side runs its own worker task and can be half-closed on its own

use crate::buffer::{BufferError, BufferMode, MessageBuffer};
use crate::codec::{self, CodecError, MessageReader};
use crate::message::Message;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Errors surfaced by [`Channel::send`] and [`Channel::recv`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is stopped, or a worker latched a failure. The detail is
    /// the latched cause, or "stopped" for a plain shutdown.
    #[error("connection closed: {detail}")]
    Closed { detail: String },
}

/// Which worker latched a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Recv,
    Send,
}

struct Shared {
    inbox: MessageBuffer,
    outbox: MessageBuffer,
    running: AtomicBool,
    recv_open: AtomicBool,
    send_open: AtomicBool,
    recv_fault: Mutex<Option<String>>,
    send_fault: Mutex<Option<String>>,
    refresh: Duration,
    max_frame_len: usize,
}

impl Shared {
    fn latch(&self, side: Side, detail: String) {
        let slot = match side {
            Side::Recv => &self.recv_fault,
            Side::Send => &self.send_fault,
        };
        let mut fault = slot.lock().unwrap();
        if fault.is_none() {
            *fault = Some(detail);
        }
    }

    fn fault(&self, side: Side) -> Option<String> {
        let slot = match side {
            Side::Recv => &self.recv_fault,
            Side::Send => &self.send_fault,
        };
        slot.lock().unwrap().clone()
    }
}

/// A message channel over one byte stream.
///
/// The receive worker decodes frames into the inbox; the send worker drains
/// the outbox onto the socket. Both wake at the refresh interval to re-check
/// their run flags, so a shutdown is observed within one interval even when
/// the wire is silent. A worker that hits an I/O or protocol error latches
/// the cause on its own side and exits; the opposite side keeps working
/// until told otherwise.
pub struct Channel {
    shared: Arc<Shared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(refresh: Duration, max_frame_len: usize) -> Channel {
        Channel {
            shared: Arc::new(Shared {
                inbox: MessageBuffer::new(BufferMode::Buffered { capacity: 0 }),
                outbox: MessageBuffer::new(BufferMode::Buffered { capacity: 0 }),
                running: AtomicBool::new(false),
                recv_open: AtomicBool::new(true),
                send_open: AtomicBool::new(true),
                recv_fault: Mutex::new(None),
                send_fault: Mutex::new(None),
                refresh,
                max_frame_len,
            }),
            recv_task: Mutex::new(None),
            send_task: Mutex::new(None),
        }
    }

    /// Attach a connected stream and launch both workers.
    ///
    /// Must be called from within a tokio runtime. Calling `start` on a
    /// channel that is already running is a no-op.
    pub fn start(&self, stream: TcpStream, input_mode: BufferMode, output_mode: BufferMode) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.inbox.switch_mode(input_mode);
        self.shared.outbox.switch_mode(output_mode);
        self.shared.recv_open.store(true, Ordering::SeqCst);
        self.shared.send_open.store(true, Ordering::SeqCst);

        let (read_half, write_half) = stream.into_split();
        let recv_shared = self.shared.clone();
        let send_shared = self.shared.clone();
        *self.recv_task.lock().unwrap() = Some(tokio::spawn(recv_worker(recv_shared, read_half)));
        *self.send_task.lock().unwrap() = Some(tokio::spawn(send_worker(send_shared, write_half)));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The cause latched by a failed worker, if any.
    pub fn fault(&self) -> Option<String> {
        self.shared
            .fault(Side::Recv)
            .or_else(|| self.shared.fault(Side::Send))
    }

    /// Change both buffer modes. Pending messages are dropped unless a mode
    /// is unchanged (see [`MessageBuffer::switch_mode`]).
    pub fn switch_modes(&self, input_mode: BufferMode, output_mode: BufferMode) {
        self.shared.inbox.switch_mode(input_mode);
        self.shared.outbox.switch_mode(output_mode);
    }

    /// Enqueue a message for sending, optionally waiting for the send buffer
    /// to drain. Draining confirms every previously queued message was
    /// written, or is being written, to the socket.
    pub async fn send(
        &self,
        message: Message,
        block_until_empty: bool,
    ) -> Result<(), ChannelError> {
        loop {
            self.ensure_live(Side::Send)?;
            // Message content is refcounted, so the retry clone is cheap.
            match self
                .shared
                .outbox
                .add(message.clone(), Some(self.shared.refresh))
                .await
            {
                Ok(()) => break,
                Err(BufferError::Full) => continue,
            }
        }
        if block_until_empty {
            loop {
                if self.shared.outbox.is_empty() {
                    break;
                }
                self.ensure_live(Side::Send)?;
                let _ = timeout(self.shared.refresh, self.shared.outbox.wait_empty()).await;
            }
        }
        Ok(())
    }

    /// Dequeue the next received message.
    ///
    /// With `block` set this waits until a message arrives or the channel
    /// dies; otherwise it returns `Ok(None)` immediately when the inbox is
    /// empty. Messages already buffered are always delivered before a latched
    /// fault is surfaced.
    pub async fn recv(&self, block: bool) -> Result<Option<Message>, ChannelError> {
        loop {
            if let Some(message) = self.shared.inbox.try_pop() {
                return Ok(Some(message));
            }
            self.ensure_live(Side::Recv)?;
            if !block {
                return Ok(None);
            }
            if let Some(message) = self.shared.inbox.pop(Some(self.shared.refresh)).await {
                return Ok(Some(message));
            }
        }
    }

    /// Like [`Channel::recv`], but waits at most `wait` before returning
    /// `Ok(None)`. Role loops use this to interleave socket reads with their
    /// status checks.
    pub async fn recv_wait(&self, wait: Duration) -> Result<Option<Message>, ChannelError> {
        if let Some(message) = self.shared.inbox.try_pop() {
            return Ok(Some(message));
        }
        self.ensure_live(Side::Recv)?;
        Ok(self.shared.inbox.pop(Some(wait)).await)
    }

    /// Wait up to `wait` for the send buffer to drain. Returns whether it
    /// did; a dead send worker simply leaves the buffer non-empty.
    pub async fn drain_send(&self, wait: Duration) -> bool {
        timeout(wait, self.shared.outbox.wait_empty()).await.is_ok()
    }

    /// Stop the receive worker to save resources on a send-only channel.
    pub fn close_recv_worker(&self) {
        self.shared.recv_open.store(false, Ordering::SeqCst);
    }

    /// Stop the send worker to save resources on a receive-only channel.
    pub fn close_send_worker(&self) {
        self.shared.send_open.store(false, Ordering::SeqCst);
    }

    /// Orderly tear-down: clear the run flag and, when `block` is set, wait
    /// for both workers to observe it and exit.
    pub async fn shutdown(&self, block: bool) {
        self.shared.running.store(false, Ordering::SeqCst);
        if block {
            let recv = self.recv_task.lock().unwrap().take();
            let send = self.send_task.lock().unwrap().take();
            for task in [recv, send].into_iter().flatten() {
                let _ = task.await;
            }
        }
    }

    /// Force both workers down without waiting, dropping the socket. Used by
    /// the crash-close path, which must not depend on a cooperative worker.
    pub fn abort(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for slot in [&self.recv_task, &self.send_task] {
            if let Some(task) = slot.lock().unwrap().take() {
                task.abort();
            }
        }
    }

    fn ensure_live(&self, side: Side) -> Result<(), ChannelError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed {
                detail: self.fault().unwrap_or_else(|| "stopped".to_string()),
            });
        }
        if let Some(detail) = self.shared.fault(side) {
            return Err(ChannelError::Closed { detail });
        }
        Ok(())
    }
}

async fn recv_worker(shared: Arc<Shared>, read_half: OwnedReadHalf) {
    let mut reader = MessageReader::new(read_half, shared.max_frame_len);
    loop {
        if !shared.running.load(Ordering::SeqCst) || !shared.recv_open.load(Ordering::SeqCst) {
            break;
        }
        match reader.poll_frame(shared.refresh).await {
            Ok(None) => continue,
            Ok(Some(message)) => {
                // Backpressure: wait for inbox room, still honoring the flags.
                loop {
                    if !shared.running.load(Ordering::SeqCst)
                        || !shared.recv_open.load(Ordering::SeqCst)
                    {
                        return;
                    }
                    match shared.inbox.add(message.clone(), Some(shared.refresh)).await {
                        Ok(()) => break,
                        Err(BufferError::Full) => continue,
                    }
                }
            }
            Err(CodecError::Closed) => {
                debug!("peer closed the stream");
                shared.latch(Side::Recv, "closed by peer".to_string());
                break;
            }
            Err(e) => {
                warn!("receive worker failed: {e}");
                shared.latch(Side::Recv, e.to_string());
                break;
            }
        }
    }
}

async fn send_worker(shared: Arc<Shared>, write_half: OwnedWriteHalf) {
    let mut writer = BufWriter::new(write_half);
    loop {
        if !shared.running.load(Ordering::SeqCst) || !shared.send_open.load(Ordering::SeqCst) {
            break;
        }
        let Some(message) = shared.outbox.pop(Some(shared.refresh)).await else {
            continue;
        };
        // A write that has begun always completes the frame or latches.
        let result = async {
            let packet = codec::encode(&message)?;
            writer.write_all(&packet).await?;
            writer.flush().await?;
            Ok::<(), CodecError>(())
        }
        .await;
        if let Err(e) = result {
            warn!("send worker failed: {e}");
            shared.latch(Side::Send, e.to_string());
            break;
        }
    }
    // Dropping the write half sends FIN once the worker is done.
    let _ = writer.shutdown().await;
}
