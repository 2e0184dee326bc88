// Copyright 2020 Joyent, Inc.

//! Bounded FIFO queues with an explicit close flag.
//!
//! A [`Queue`] is owned by the registry. It hands out any number of
//! [`QueueSender`]s and [`QueueReceiver`]s; all of them observe the same
//! close flag, which is a cancellation token derived from the registry's
//! shutdown token. Closing is idempotent and never touches the buffered
//! items: receivers drain whatever is buffered before they observe the end
//! of the queue, while senders fail as soon as the queue is closed.
//!
//! Only one receiver consumes at a time. A receiver takes the consumer side
//! on its first `recv` and keeps it until it is dropped. A producer that is
//! done can wait for the consumer to empty the queue with
//! [`QueueSender::drained`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Returned by [`QueueSender::send`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "queue closed")
    }
}

impl std::error::Error for QueueClosed {}

pub struct Queue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    consumed: Arc<Notify>,
    closed: CancellationToken,
}

impl<T> Queue<T> {
    /// Create a queue holding at most `capacity` items that closes when
    /// either `close` is called or `parent` is cancelled.
    pub fn new(capacity: usize, parent: &CancellationToken) -> Queue<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Queue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            consumed: Arc::new(Notify::new()),
            closed: parent.child_token(),
        }
    }

    pub fn sender(&self) -> QueueSender<T> {
        QueueSender {
            tx: self.tx.clone(),
            consumed: Arc::clone(&self.consumed),
            closed: self.closed.clone(),
        }
    }

    pub fn receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            shared: Arc::clone(&self.rx),
            guard: None,
            consumed: Arc::clone(&self.consumed),
            closed: self.closed.clone(),
        }
    }

    /// Close the queue. Returns `true` only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether `receiver` consumes from this queue.
    pub fn feeds(&self, receiver: &QueueReceiver<T>) -> bool {
        Arc::ptr_eq(&self.rx, &receiver.shared)
    }

    /// Whether `sender` produces into this queue.
    pub fn fed_by(&self, sender: &QueueSender<T>) -> bool {
        self.tx.same_channel(&sender.tx)
    }
}

/// Producer side of a [`Queue`].
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    consumed: Arc<Notify>,
    closed: CancellationToken,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            tx: self.tx.clone(),
            consumed: Arc::clone(&self.consumed),
            closed: self.closed.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue `item`, waiting for space while the queue is full. Fails if
    /// the queue is closed before the item is accepted.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueClosed),
            res = self.tx.send(item) => res.map_err(|_| QueueClosed),
        }
    }

    /// Wait until every item sent so far has been taken by a receiver.
    /// Fails if the queue is closed while items are still buffered.
    pub async fn drained(&self) -> Result<(), QueueClosed> {
        loop {
            if self.is_empty() {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    return if self.is_empty() { Ok(()) } else { Err(QueueClosed) };
                }
                _ = self.consumed.notified() => (),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }

    /// Resolves once the queue is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel()
    }

    /// Close the queue when the returned guard is dropped.
    pub fn close_on_drop(&self) -> DropGuard {
        self.closed.clone().drop_guard()
    }
}

/// Consumer side of a [`Queue`].
pub struct QueueReceiver<T> {
    shared: Arc<Mutex<mpsc::Receiver<T>>>,
    guard: Option<OwnedMutexGuard<mpsc::Receiver<T>>>,
    consumed: Arc<Notify>,
    closed: CancellationToken,
}

impl<T> QueueReceiver<T> {
    /// Dequeue the next item, waiting while the queue is empty and open.
    /// Returns `None` once the queue is closed and its buffer drained, or
    /// if the queue closes while another receiver is consuming.
    pub async fn recv(&mut self) -> Option<T> {
        if self.guard.is_none() {
            let shared = Arc::clone(&self.shared);
            let guard = tokio::select! {
                biased;
                guard = shared.lock_owned() => guard,
                _ = self.closed.cancelled() => return None,
            };
            self.guard = Some(guard);
        }
        let rx = match self.guard.as_mut() {
            Some(rx) => rx,
            None => return None,
        };

        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        };
        if item.is_some() {
            self.consumed.notify_one();
        }
        item
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel()
    }

    /// Close the queue when the returned guard is dropped.
    pub fn close_on_drop(&self) -> DropGuard {
        self.closed.clone().drop_guard()
    }
}
