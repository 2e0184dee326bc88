// Copyright 2020 Joyent, Inc.

//! Destination sessions: a destination registers once and then receives a
//! notice for every transfer addressed to it.

use std::future::Future;

use futures::{Sink, SinkExt};
use slog::{debug, info, warn, Logger};

use crate::error::RelayError;
use crate::message::{DestinationId, Notice};
use crate::registry::Registry;

/// Register destination `id` and forward its notices to `outbound`, one at
/// a time and in arrival order.
///
/// Returns `Ok` when the session's queue is closed (deregistration or relay
/// shutdown) or when `hangup` resolves with `Ok`, which is how a destination
/// leaves voluntarily. A hang up that reports an error, or a failed send to
/// `outbound`, ends the session with that error. A hang up takes precedence
/// over notices still queued. The registration is removed on every exit
/// path.
pub async fn serve_destination<S, H>(
    registry: &Registry,
    id: DestinationId,
    outbound: S,
    hangup: H,
    log: &Logger,
) -> Result<(), RelayError>
where
    S: Sink<Notice, Error = RelayError>,
    H: Future<Output = Result<(), RelayError>>,
{
    let mut notices = registry.register_destination(id).await?;
    let _close = notices.close_on_drop();
    info!(log, "new destination registered"; "destination" => id);

    tokio::pin!(outbound);
    tokio::pin!(hangup);

    let result = loop {
        let notice = tokio::select! {
            biased;
            left = &mut hangup => match left {
                Ok(()) => {
                    debug!(log, "destination hung up"; "destination" => id);
                    break Ok(());
                }
                Err(e) => {
                    warn!(log, "destination connection lost";
                        "destination" => id, "err" => %e);
                    break Err(e);
                }
            },
            notice = notices.recv() => notice,
        };

        let notice = match notice {
            Some(notice) => notice,
            None => break Ok(()),
        };

        debug!(log, "forwarding notice";
            "destination" => id, "transfer_id" => &notice.transfer_id);
        if let Err(e) = outbound.send(notice).await {
            warn!(log, "failed to forward notice";
                "destination" => id, "err" => %e);
            break Err(e);
        }
    };

    registry.release_destination(id, &notices).await;
    info!(log, "destination deregistered"; "destination" => id);

    result
}
