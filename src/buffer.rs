// ABOUTME: Mode-switchable container backing every message stream in the mediator
// ABOUTME: Holds either a bounded FIFO queue or a single latest-value slot

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;

/// How a [`MessageBuffer`] stores pending messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Bounded FIFO. Ordered and lossless while within capacity;
    /// `capacity == 0` means unbounded.
    Buffered { capacity: usize },
    /// Single slot where a new value overwrites any pending one. Older
    /// values that were never popped are lost by design.
    Coalescing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer is full")]
    Full,
}

#[derive(Debug)]
enum Store {
    Fifo { queue: VecDeque<Message>, capacity: usize },
    Latest(Option<Message>),
}

impl Store {
    fn new(mode: BufferMode) -> Store {
        match mode {
            BufferMode::Buffered { capacity } => Store::Fifo {
                queue: VecDeque::new(),
                capacity,
            },
            BufferMode::Coalescing => Store::Latest(None),
        }
    }

    fn mode(&self) -> BufferMode {
        match self {
            Store::Fifo { capacity, .. } => BufferMode::Buffered {
                capacity: *capacity,
            },
            Store::Latest(_) => BufferMode::Coalescing,
        }
    }
}

/// A buffer for messages in transit.
///
/// Exactly-one-item semantics per `add`/`pop` pair in buffered mode;
/// at-most-one latest-item semantics in coalescing mode.
#[derive(Debug)]
pub struct MessageBuffer {
    store: Mutex<Store>,
    added: Notify,
    removed: Notify,
}

impl MessageBuffer {
    pub fn new(mode: BufferMode) -> MessageBuffer {
        MessageBuffer {
            store: Mutex::new(Store::new(mode)),
            added: Notify::new(),
            removed: Notify::new(),
        }
    }

    /// Switch storage mode. Pending messages are dropped unless the target
    /// mode and capacity match the current ones exactly.
    pub fn switch_mode(&self, mode: BufferMode) {
        let mut store = self.store.lock().unwrap();
        if store.mode() == mode {
            return;
        }
        *store = Store::new(mode);
        // Waiting adders may now have room.
        self.removed.notify_waiters();
    }

    pub fn mode(&self) -> BufferMode {
        self.store.lock().unwrap().mode()
    }

    /// Add a message.
    ///
    /// In buffered mode this waits for capacity, up to `wait` when given
    /// (elapsing yields [`BufferError::Full`], and the message is dropped).
    /// In coalescing mode it never waits; the slot is simply overwritten.
    pub async fn add(&self, message: Message, wait: Option<Duration>) -> Result<(), BufferError> {
        match wait {
            None => {
                self.add_inner(message).await;
                Ok(())
            }
            Some(wait) => timeout(wait, self.add_inner(message))
                .await
                .map_err(|_| BufferError::Full),
        }
    }

    async fn add_inner(&self, message: Message) {
        let mut message = Some(message);
        loop {
            let notified = self.removed.notified();
            {
                let mut store = self.store.lock().unwrap();
                match &mut *store {
                    Store::Fifo { queue, capacity } => {
                        if *capacity == 0 || queue.len() < *capacity {
                            queue.push_back(message.take().unwrap());
                            self.added.notify_waiters();
                            return;
                        }
                    }
                    Store::Latest(slot) => {
                        *slot = message.take();
                        self.added.notify_waiters();
                        return;
                    }
                }
            }
            notified.await;
        }
    }

    /// Take the next message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        let mut store = self.store.lock().unwrap();
        let message = match &mut *store {
            Store::Fifo { queue, .. } => queue.pop_front(),
            Store::Latest(slot) => slot.take(),
        };
        if message.is_some() {
            self.removed.notify_waiters();
        }
        message
    }

    /// Take the next message, waiting up to `wait` (forever when `None`).
    pub async fn pop(&self, wait: Option<Duration>) -> Option<Message> {
        match wait {
            None => Some(self.pop_inner().await),
            Some(wait) => timeout(wait, self.pop_inner()).await.ok(),
        }
    }

    async fn pop_inner(&self) -> Message {
        loop {
            let notified = self.added.notified();
            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        match &*self.store.lock().unwrap() {
            Store::Fifo { queue, .. } => queue.is_empty(),
            Store::Latest(slot) => slot.is_none(),
        }
    }

    /// Wait until the buffer has fully drained.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.removed.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        match &*self.store.lock().unwrap() {
            Store::Fifo { queue, .. } => queue.len(),
            Store::Latest(slot) => usize::from(slot.is_some()),
        }
    }
}
