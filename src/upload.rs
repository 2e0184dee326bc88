// Copyright 2020 Joyent, Inc.

//! Uploads: a sender pushes a descriptor followed by the file's chunks.

use futures::{Stream, StreamExt};
use slog::{debug, info, o, trace, warn, Logger};

use crate::error::RelayError;
use crate::message::{Chunk, FileStatus, Notice, UploadFrame};
use crate::queue::QueueSender;
use crate::registry::Registry;

/// Drive one upload call.
///
/// The first frame on `inbound` must be a descriptor; it creates the
/// transfer and notifies its destination. Every later frame must be a
/// non-empty chunk and is enqueued for the destination's download, waiting
/// while the transfer's queue is full.
///
/// When `inbound` ends cleanly the transfer stays up until a download has
/// taken every buffered chunk, and only then is the `FileStatus` returned.
/// On any failure the transfer is removed at once.
pub async fn receive_upload<S>(
    registry: &Registry,
    inbound: S,
    log: &Logger,
) -> Result<FileStatus, RelayError>
where
    S: Stream<Item = Result<UploadFrame, RelayError>>,
{
    tokio::pin!(inbound);

    let descriptor = match inbound.next().await {
        Some(Ok(UploadFrame::Descriptor(descriptor))) => descriptor,
        Some(Ok(UploadFrame::Chunk(_))) => {
            return Err(RelayError::protocol(
                "first request must be a transfer descriptor",
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(RelayError::protocol(
                "stream ended before a transfer descriptor",
            ));
        }
    };

    let log = log.new(o!(
        "transfer_id" => descriptor.transfer_id.clone(),
        "destination" => descriptor.destination,
    ));
    info!(log, "registering new transfer");

    let chunks = registry
        .create_transfer(
            &descriptor.transfer_id,
            descriptor.destination,
            Notice::from(&descriptor),
        )
        .await?;
    let _close = chunks.close_on_drop();

    let result = match forward_chunks(&mut inbound, &chunks, &log).await {
        Ok(status) => {
            debug!(log, "waiting for the download to drain the transfer");
            chunks
                .drained()
                .await
                .map(|()| status)
                .map_err(|_| RelayError::Closed)
        }
        Err(e) => Err(e),
    };

    registry.release_transfer(&descriptor.transfer_id, &chunks).await;
    match result {
        Ok(ref status) => info!(log, "transfer complete";
            "bytes" => status.bytes_accepted, "chunks" => status.chunks_accepted),
        Err(ref e) => warn!(log, "transfer failed"; "err" => %e),
    }

    result
}

async fn forward_chunks<S>(
    inbound: &mut S,
    chunks: &QueueSender<Chunk>,
    log: &Logger,
) -> Result<FileStatus, RelayError>
where
    S: Stream<Item = Result<UploadFrame, RelayError>> + Unpin,
{
    let mut status = FileStatus::default();

    loop {
        let frame = tokio::select! {
            biased;
            _ = chunks.closed() => return Err(RelayError::Closed),
            frame = inbound.next() => frame,
        };

        let chunk = match frame {
            None => {
                debug!(log, "sender finished");
                return Ok(status);
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(UploadFrame::Descriptor(_))) => {
                return Err(RelayError::protocol(
                    "expected chunk, got a second transfer descriptor",
                ));
            }
            Some(Ok(UploadFrame::Chunk(chunk))) => chunk,
        };

        if chunk.is_empty() {
            return Err(RelayError::protocol("expected chunk with a payload"));
        }

        status.record(&chunk);
        trace!(log, "enqueueing chunk"; "offset" => chunk.offset, "len" => chunk.len());
        chunks.send(chunk).await.map_err(|_| RelayError::Closed)?;
    }
}
