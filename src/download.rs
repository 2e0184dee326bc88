// Copyright 2020 Joyent, Inc.

//! Downloads: a destination pulls the chunks of a transfer it was told about.

use futures::{Sink, SinkExt};
use slog::{debug, info, Logger};

use crate::error::RelayError;
use crate::message::Chunk;
use crate::registry::Registry;

/// Stream the chunks of transfer `transfer_id` to `outbound` in the order
/// they were uploaded, until the upload ends and its buffered chunks are
/// drained. The upload side owns the transfer, so nothing is cleaned up
/// here.
pub async fn send_download<S>(
    registry: &Registry,
    transfer_id: &str,
    outbound: S,
    log: &Logger,
) -> Result<u64, RelayError>
where
    S: Sink<Chunk, Error = RelayError>,
{
    let mut chunks = registry.lookup_transfer(transfer_id).await?;
    info!(log, "start download"; "transfer_id" => transfer_id);

    tokio::pin!(outbound);

    let mut forwarded = 0;
    while let Some(chunk) = chunks.recv().await {
        debug!(log, "forwarding chunk";
            "transfer_id" => transfer_id, "offset" => chunk.offset);
        outbound.send(chunk).await?;
        forwarded += 1;
    }

    info!(log, "download complete";
        "transfer_id" => transfer_id, "chunks" => forwarded);
    Ok(forwarded)
}
