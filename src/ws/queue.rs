#![expect(
    clippy::module_name_repetitions,
    reason = "Type names carry their role when re-exported from the ws module"
)]

//! Outbound buffering for messages that could not be transmitted immediately.
//!
//! The queue is plain data: the connection driver takes a batch, writes it to
//! the transport and hands failures back through [`OutboundQueue::retry`].
//!
//! Ordering is FIFO by enqueue time with one caveat: a message that fails
//! during a flush is re-appended at the tail, so it may be transmitted after
//! messages that were enqueued later than it.

use std::collections::VecDeque;

use crate::types::ClientMessage;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery options for a single outbound message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Queue the message when it cannot be sent right away. Non-retryable
    /// messages are dropped instead.
    pub retryable: bool,
    /// How many failed transmissions are tolerated before the message is dropped
    pub max_retries: u32,
}

impl SendOptions {
    #[must_use]
    pub const fn retryable(max_retries: u32) -> Self {
        Self {
            retryable: true,
            max_retries,
        }
    }

    /// Send only if the transport is open right now; never queue.
    #[must_use]
    pub const fn fire_and_forget() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::retryable(DEFAULT_MAX_RETRIES)
    }
}

/// A message waiting for transmission.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: ClientMessage,
    pub options: SendOptions,
    /// Failed transmissions so far
    pub retries: u32,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(message: ClientMessage, options: SendOptions) -> Self {
        Self {
            message,
            options,
            retries: 0,
        }
    }

    /// Whether the retry budget is spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.retries > self.options.max_retries
    }
}

/// FIFO buffer with bounded per-flush throughput.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
    batch_size: usize,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append a message that has not been attempted yet.
    pub fn push(&mut self, message: ClientMessage, options: SendOptions) {
        self.messages.push_back(QueuedMessage::new(message, options));
    }

    /// Append a message whose immediate transmission just failed. The failed
    /// attempt counts against its retry budget.
    ///
    /// Returns `false` if the message was dropped instead.
    pub fn push_failed(&mut self, message: ClientMessage, options: SendOptions) -> bool {
        self.retry(QueuedMessage::new(message, options))
    }

    /// Record a failed transmission and re-append at the tail, or drop the
    /// message once `retries > max_retries`.
    ///
    /// Returns `false` if the message was dropped.
    pub fn retry(&mut self, mut queued: QueuedMessage) -> bool {
        queued.retries = queued.retries.saturating_add(1);
        if !queued.options.retryable || queued.is_exhausted() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                message_type = queued.message.message_type(),
                retries = queued.retries,
                max_retries = queued.options.max_retries,
                "Dropping outbound message after exhausting retries"
            );
            return false;
        }
        self.messages.push_back(queued);
        true
    }

    /// Remove up to `batch_size` messages from the front.
    pub fn take_batch(&mut self) -> Vec<QueuedMessage> {
        let count = self.batch_size.min(self.messages.len());
        self.messages.drain(..count).collect()
    }

    /// Put messages that were taken but never attempted back at the front,
    /// preserving their order.
    pub fn restore(&mut self, unsent: Vec<QueuedMessage>) {
        for queued in unsent.into_iter().rev() {
            self.messages.push_front(queued);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }
}
