// Copyright 2020 Joyent, Inc.

//! The relay engine: one registry shared by every call, plus shutdown.

use std::future::Future;
use std::sync::Arc;

use futures::{Sink, Stream};
use slog::{info, o, Drain, Logger};

use crate::config::RelayConfig;
use crate::destination::serve_destination;
use crate::download::send_download;
use crate::error::RelayError;
use crate::message::{Chunk, DestinationId, FileStatus, Notice, UploadFrame};
use crate::registry::Registry;
use crate::upload::receive_upload;

/// A handle to a running relay. Cloning is cheap; all clones share the same
/// registry, so independent relays can coexist in one process.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    log: Logger,
}

impl Relay {
    pub fn new(config: RelayConfig, log: Option<&Logger>) -> Relay {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let registry = Registry::new(&config, Some(&log));

        Relay {
            registry: Arc::new(registry),
            log,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Serve a `Register` call. See [`serve_destination`].
    pub async fn register<S, H>(
        &self,
        id: DestinationId,
        outbound: S,
        hangup: H,
    ) -> Result<(), RelayError>
    where
        S: Sink<Notice, Error = RelayError>,
        H: Future<Output = Result<(), RelayError>>,
    {
        serve_destination(&self.registry, id, outbound, hangup, &self.log).await
    }

    /// Serve an `Upload` call. See [`receive_upload`].
    pub async fn upload<S>(&self, inbound: S) -> Result<FileStatus, RelayError>
    where
        S: Stream<Item = Result<UploadFrame, RelayError>>,
    {
        receive_upload(&self.registry, inbound, &self.log).await
    }

    /// Serve a `Download` call. See [`send_download`].
    pub async fn download<S>(&self, transfer_id: &str, outbound: S) -> Result<u64, RelayError>
    where
        S: Sink<Chunk, Error = RelayError>,
    {
        send_download(&self.registry, transfer_id, outbound, &self.log).await
    }

    /// Close every session. Calls blocked on a queue observe the closure and
    /// unwind through their own cleanup. Safe to call more than once; the
    /// relay accepts no new sessions afterwards.
    pub async fn stop(&self) {
        info!(self.log, "stopping relay server");
        self.registry.shutdown_all().await;
        // Give tasks parked on the closed queues a chance to run.
        tokio::task::yield_now().await;
        info!(self.log, "relay server stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.registry.is_shut_down()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures::channel::mpsc;
    use futures::{stream, SinkExt, StreamExt};
    use slog::Discard;

    use crate::message::TransferDescriptor;

    fn relay(capacity: usize) -> Relay {
        let log = Logger::root(Discard, o!());
        Relay::new(RelayConfig::default().with_queue_capacity(capacity), Some(&log))
    }

    #[tokio::test]
    async fn stop_unblocks_every_session() {
        let relay = relay(4);

        let mut sessions = Vec::new();
        let mut notice_streams = Vec::new();
        for id in &[1, 2] {
            let (tx, rx) = mpsc::unbounded();
            notice_streams.push(rx);
            let relay = relay.clone();
            let id = *id;
            sessions.push(tokio::spawn(async move {
                let sink = tx.sink_map_err(|_| RelayError::Closed);
                relay.register(id, sink, futures::future::pending()).await
            }));
        }
        while relay.registry().destination_count().await < 2 {
            tokio::task::yield_now().await;
        }

        let upload = {
            let relay = relay.clone();
            let descriptor = TransferDescriptor::new(1, "in-flight".to_string());
            let inbound = stream::iter(vec![Ok(UploadFrame::Descriptor(descriptor))])
                .chain(stream::pending());
            tokio::spawn(async move { relay.upload(inbound).await })
        };
        assert_eq!(
            notice_streams[0].next().await.map(|n| n.transfer_id),
            Some("in-flight".to_string())
        );

        let (tx, _rx) = mpsc::unbounded();
        let download = {
            let relay = relay.clone();
            tokio::spawn(async move {
                let sink = tx.sink_map_err(|_| RelayError::Closed);
                relay.download("in-flight", sink).await
            })
        };

        relay.stop().await;
        relay.stop().await;
        assert!(relay.is_stopped());

        for session in sessions {
            assert!(session.await.unwrap().is_ok());
        }
        assert!(matches!(upload.await.unwrap(), Err(RelayError::Closed)));
        // The download either drained the closed queue or never found it.
        match download.await.unwrap() {
            Ok(0) | Err(RelayError::TransferNotFound(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(relay.registry().destination_count().await, 0);
        assert_eq!(relay.registry().transfer_count().await, 0);
    }

    #[tokio::test]
    async fn late_download_receives_the_whole_file() {
        let relay = relay(4);
        let mut notices = relay.registry().register_destination(7).await.unwrap();

        let upload = {
            let relay = relay.clone();
            let inbound = stream::iter(vec![
                Ok(UploadFrame::Descriptor(TransferDescriptor::new(7, "abc".to_string()))),
                Ok(UploadFrame::Chunk(Chunk::new(0, b"b1".to_vec()))),
                Ok(UploadFrame::Chunk(Chunk::new(2, b"b2".to_vec()))),
            ]);
            tokio::spawn(async move { relay.upload(inbound).await })
        };
        assert_eq!(notices.recv().await.unwrap().transfer_id, "abc");

        let (tx, rx) = mpsc::unbounded();
        let sink = tx.sink_map_err(|_| RelayError::Closed);
        assert_eq!(relay.download("abc", sink).await.unwrap(), 2);
        let chunks: Vec<Chunk> = rx.collect().await;
        assert_eq!(
            chunks,
            vec![Chunk::new(0, b"b1".to_vec()), Chunk::new(2, b"b2".to_vec())]
        );

        let status = upload.await.unwrap().unwrap();
        assert_eq!(status.bytes_accepted, 4);
        assert_eq!(relay.registry().transfer_count().await, 0);
    }

    #[tokio::test]
    async fn relays_are_independent() {
        let a = relay(4);
        let b = relay(4);
        let _notices = a.registry().register_destination(1).await.unwrap();
        assert!(b.registry().register_destination(1).await.is_ok());

        a.stop().await;
        assert!(!b.is_stopped());
        assert!(b.registry().register_destination(2).await.is_ok());
    }

    #[tokio::test]
    async fn closed_relay_refuses_registration() {
        let relay = relay(4);
        relay.stop().await;

        let (tx, _rx) = mpsc::unbounded();
        let sink = tx.sink_map_err(|_| RelayError::Closed);
        let result = relay.register(1, sink, futures::future::pending()).await;
        assert!(matches!(result, Err(RelayError::Closed)));
    }
}
