// Copyright 2020 Joyent, Inc.

//! The session registry: which destinations are listening and which
//! transfers are in flight.
//!
//! Both tables live behind one read/write lock. Lookups take the read side;
//! every registration, deregistration and notification takes the write side.
//! Nothing but queue handles ever leaves the lock.
//!
//! Queues are closed through their close flag, never by draining them, so
//! deregistration is idempotent and never loses a buffered item. Every queue
//! is derived from the registry's shutdown token, which lets `shutdown_all`
//! unblock any task parked on a queue before it takes the write lock.

use std::collections::HashMap;

use slog::{debug, info, o, trace, Drain, Logger};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::{Chunk, DestinationId, Notice};
use crate::queue::{Queue, QueueReceiver, QueueSender};

struct TransferSession {
    destination: DestinationId,
    chunks: Queue<Chunk>,
}

#[derive(Default)]
struct Tables {
    destinations: HashMap<DestinationId, Queue<Notice>>,
    transfers: HashMap<String, TransferSession>,
}

impl Tables {
    /// The destination's queue, unless it is absent or already closed.
    fn live_destination(&self, id: DestinationId) -> Option<&Queue<Notice>> {
        self.destinations.get(&id).filter(|queue| !queue.is_closed())
    }

    fn live_transfer(&self, id: &str) -> Option<&TransferSession> {
        self.transfers.get(id).filter(|t| !t.chunks.is_closed())
    }
}

pub struct Registry {
    capacity: usize,
    shutdown: CancellationToken,
    tables: RwLock<Tables>,
    log: Logger,
}

impl Registry {
    pub fn new(config: &RelayConfig, log: Option<&Logger>) -> Registry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Registry {
            capacity: config.queue_capacity.max(1),
            shutdown: CancellationToken::new(),
            tables: RwLock::new(Tables::default()),
            log,
        }
    }

    /// Register a destination and return the receiving end of its notice
    /// queue. Fails with `AlreadyRegistered` if the identity is active.
    pub async fn register_destination(
        &self,
        id: DestinationId,
    ) -> Result<QueueReceiver<Notice>, RelayError> {
        let mut tables = self.tables.write().await;

        if self.shutdown.is_cancelled() {
            return Err(RelayError::Closed);
        }
        if tables.live_destination(id).is_some() {
            return Err(RelayError::AlreadyRegistered(id));
        }

        // A closed entry left behind by an abandoned session is replaced.
        let queue = Queue::new(self.capacity, &self.shutdown);
        let receiver = queue.receiver();
        tables.destinations.insert(id, queue);
        debug!(self.log, "destination queue created"; "destination" => id);

        Ok(receiver)
    }

    /// Close and remove a destination's queue. Unknown ids are ignored.
    pub async fn deregister_destination(&self, id: DestinationId) {
        let mut tables = self.tables.write().await;
        if let Some(queue) = tables.destinations.remove(&id) {
            queue.close();
            debug!(self.log, "destination queue removed"; "destination" => id);
        }
    }

    /// Like `deregister_destination`, but only if the registered queue is
    /// the one `notices` reads from. Used by a session cleaning up after
    /// itself so it can never remove a newer session under the same id.
    pub async fn release_destination(&self, id: DestinationId, notices: &QueueReceiver<Notice>) {
        notices.close();
        let mut tables = self.tables.write().await;
        let owned = tables
            .destinations
            .get(&id)
            .map_or(false, |queue| queue.feeds(notices));
        if owned {
            tables.destinations.remove(&id);
            debug!(self.log, "destination queue released"; "destination" => id);
        }
    }

    /// Deliver `notice` to a destination, waiting while its queue is full.
    pub async fn notify_destination(
        &self,
        id: DestinationId,
        notice: Notice,
    ) -> Result<(), RelayError> {
        let tables = self.tables.write().await;
        Self::notify_locked(&tables, id, notice).await
    }

    async fn notify_locked(
        tables: &Tables,
        id: DestinationId,
        notice: Notice,
    ) -> Result<(), RelayError> {
        let sender = match tables.live_destination(id) {
            Some(queue) => queue.sender(),
            None => return Err(RelayError::DestinationNotFound(id)),
        };

        // A destination that goes away while we wait is as good as missing.
        sender
            .send(notice)
            .await
            .map_err(|_| RelayError::DestinationNotFound(id))
    }

    /// Create a transfer addressed to `destination` and tell the destination
    /// about it. The whole operation is one exclusive step: either the
    /// notice is delivered and the transfer exists, or nothing changed.
    pub async fn create_transfer(
        &self,
        id: &str,
        destination: DestinationId,
        notice: Notice,
    ) -> Result<QueueSender<Chunk>, RelayError> {
        let mut tables = self.tables.write().await;

        if self.shutdown.is_cancelled() {
            return Err(RelayError::Closed);
        }
        if tables.live_destination(destination).is_none() {
            return Err(RelayError::DestinationNotFound(destination));
        }
        if tables.live_transfer(id).is_some() {
            return Err(RelayError::TransferAlreadyActive(id.to_string()));
        }

        trace!(self.log, "notifying destination";
            "destination" => destination, "transfer_id" => id);
        Self::notify_locked(&tables, destination, notice).await?;

        let chunks = Queue::new(self.capacity, &self.shutdown);
        let sender = chunks.sender();
        tables.transfers.insert(
            id.to_string(),
            TransferSession {
                destination,
                chunks,
            },
        );
        debug!(self.log, "transfer queue created";
            "destination" => destination, "transfer_id" => id);

        Ok(sender)
    }

    /// Close and remove a transfer's queue. Unknown ids are ignored.
    pub async fn deregister_transfer(&self, id: &str) {
        let mut tables = self.tables.write().await;
        if let Some(transfer) = tables.transfers.remove(id) {
            transfer.chunks.close();
            debug!(self.log, "transfer queue removed";
                "destination" => transfer.destination, "transfer_id" => id);
        }
    }

    /// Like `deregister_transfer`, but only if the registered queue is the
    /// one `chunks` feeds.
    pub async fn release_transfer(&self, id: &str, chunks: &QueueSender<Chunk>) {
        chunks.close();
        let mut tables = self.tables.write().await;
        let owned = tables
            .transfers
            .get(id)
            .map_or(false, |transfer| transfer.chunks.fed_by(chunks));
        if owned {
            tables.transfers.remove(id);
            debug!(self.log, "transfer queue released"; "transfer_id" => id);
        }
    }

    /// Find an active transfer and return a receiver for its chunks.
    pub async fn lookup_transfer(&self, id: &str) -> Result<QueueReceiver<Chunk>, RelayError> {
        let tables = self.tables.read().await;
        tables
            .live_transfer(id)
            .map(|transfer| transfer.chunks.receiver())
            .ok_or_else(|| RelayError::TransferNotFound(id.to_string()))
    }

    /// Close every queue and forget every session. Buffered items remain
    /// readable by receivers that already hold them. Later registrations
    /// fail with `Closed`.
    pub async fn shutdown_all(&self) {
        // Wake anything blocked on a queue, including a notifier that is
        // holding the write lock, before asking for the lock ourselves.
        self.shutdown.cancel();

        let mut tables = self.tables.write().await;
        let destinations = tables.destinations.len();
        let transfers = tables.transfers.len();

        for (_, queue) in tables.destinations.drain() {
            queue.close();
        }
        for (_, transfer) in tables.transfers.drain() {
            transfer.chunks.close();
        }

        info!(self.log, "registry shut down";
            "destinations" => destinations, "transfers" => transfers);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn destination_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.destinations.len()
    }

    pub async fn transfer_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.transfers.len()
    }
}
