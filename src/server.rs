// Copyright 2020 Joyent, Inc.

//! This module provides the interface for serving the relay's calls over a
//! Fast connection.
//!
//! Each connection carries one call at a time. A call starts with a `DATA`
//! message naming the method; what follows depends on the method:
//!
//! * `register`: the server streams one `DATA` message per notice and an
//!   `END` once the session closes. The client may send `END` to leave.
//! * `upload`: the client streams `DATA` messages carrying the descriptor and
//!   then chunks, followed by `END`. The server replies with the file status
//!   and `END`.
//! * `download`: the server streams one `DATA` message per chunk and an `END`
//!   once the upload side finishes.
//!
//! A failed call is answered with a single `ERROR` message carrying a
//! [`WireError`](crate::error::WireError). Failures of the connection itself
//! end the task.

use std::io::{Error, ErrorKind};

use futures::future;
use futures::stream::{self, SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slog::{debug, error, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Framed};

use crate::error::RelayError;
use crate::message::{Chunk, DownloadArgs, Notice, RegisterArgs, UploadFrame};
use crate::protocol::{FastMessage, FastMessageData, FastMessageStatus, FastRpc};
use crate::relay::Relay;

pub const REGISTER: &str = "register";
pub const UPLOAD: &str = "upload";
pub const DOWNLOAD: &str = "download";

type FastSink<T> = SplitSink<Framed<T, FastRpc>, FastMessage>;
type FastStream<T> = SplitStream<Framed<T, FastRpc>>;

/// How a call left the connection.
enum CallEnd {
    /// Every message of the call has been read.
    Finished,
    /// The call failed before the client's `END`; later messages with this
    /// id are dropped.
    Unfinished(u32),
}

/// Serve relay calls arriving on `socket` until the peer disconnects or
/// the connection fails. The optional logger overrides the relay's own.
pub async fn make_task<T>(socket: T, relay: Relay, log: Option<&Logger>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let log = log.cloned().unwrap_or_else(|| relay.log().clone());
    let (mut tx, mut rx): (FastSink<T>, FastStream<T>) = FastRpc.framed(socket).split();
    let mut discard: Option<u32> = None;

    loop {
        let msg = match rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                error!(log, "failed to decode message"; "err" => %e);
                break;
            }
            None => break,
        };

        if discard == Some(msg.id) {
            if msg.status == FastMessageStatus::End {
                discard = None;
            }
            continue;
        }

        if msg.status != FastMessageStatus::Data {
            debug!(log, "ignoring message outside of a call"; "msg" => %msg);
            continue;
        }

        match dispatch(&relay, msg, &mut tx, &mut rx, &log).await {
            Ok(CallEnd::Finished) => (),
            Ok(CallEnd::Unfinished(id)) => discard = Some(id),
            Err(e) => {
                error!(log, "failed to process connection"; "err" => %e);
                break;
            }
        }
    }

    debug!(log, "connection closed");
}

async fn dispatch<T>(
    relay: &Relay,
    msg: FastMessage,
    tx: &mut FastSink<T>,
    rx: &mut FastStream<T>,
    log: &Logger,
) -> Result<CallEnd, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let id = msg.id;
    let log = log.new(o!("msg_id" => id, "method" => msg.method().to_string()));

    match msg.method() {
        REGISTER => {
            let result = match parse_args::<RegisterArgs>(&msg) {
                Ok(args) => {
                    let outbound = reply_sink::<_, Notice>(tx, id, REGISTER);
                    let hangup = async {
                        if wait_for_end(rx, id).await {
                            Ok(())
                        } else {
                            Err(RelayError::Transport(Error::new(
                                ErrorKind::ConnectionAborted,
                                "connection closed during register",
                            )))
                        }
                    };
                    relay.register(args.id, outbound, hangup).await
                }
                Err(e) => Err(e),
            };
            finish(tx, id, REGISTER, result.map(|()| None), &log).await?;
            Ok(CallEnd::Finished)
        }
        UPLOAD => {
            let mut finished = false;
            let result = {
                let inbound = upload_frames(&msg, rx, &mut finished);
                relay.upload(inbound).await
            };
            let reply = match result {
                Ok(status) => Ok(Some(serde_json::to_value(vec![status])?)),
                Err(e) => Err(e),
            };
            finish(tx, id, UPLOAD, reply, &log).await?;

            if finished {
                Ok(CallEnd::Finished)
            } else {
                Ok(CallEnd::Unfinished(id))
            }
        }
        DOWNLOAD => {
            let result = match parse_args::<DownloadArgs>(&msg) {
                Ok(args) => {
                    let outbound = reply_sink::<_, Chunk>(tx, id, DOWNLOAD);
                    tokio::select! {
                        res = relay.download(&args.transfer_id, outbound) => res.map(|_| ()),
                        ended = wait_for_end(rx, id) => {
                            if ended {
                                debug!(log, "download cancelled by peer");
                                Ok(())
                            } else {
                                Err(RelayError::Transport(Error::new(
                                    ErrorKind::ConnectionAborted,
                                    "connection closed during download",
                                )))
                            }
                        }
                    }
                }
                Err(e) => Err(e),
            };
            finish(tx, id, DOWNLOAD, result.map(|()| None), &log).await?;
            Ok(CallEnd::Finished)
        }
        method => {
            let e = RelayError::protocol(format!("Unsupported function: {}", method));
            let method = method.to_string();
            finish(tx, id, &method, Err(e), &log).await?;
            Ok(CallEnd::Unfinished(id))
        }
    }
}

/// Send the final reply of a call: an optional `DATA` payload and `END`, or
/// a single `ERROR`. Transport errors are returned instead, since the
/// connection is no longer usable.
async fn finish<T>(
    tx: &mut FastSink<T>,
    id: u32,
    method: &str,
    result: Result<Option<Value>, RelayError>,
    log: &Logger,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match result {
        Ok(reply) => {
            if let Some(value) = reply {
                let data = FastMessageData::new(method.to_string(), value);
                tx.send(FastMessage::data(id, data)).await?;
            }
            tx.send(FastMessage::end(id, method.to_string())).await
        }
        Err(RelayError::Transport(e)) => Err(e),
        Err(e) => {
            warn!(log, "call failed"; "err" => %e);
            let payload = serde_json::to_value(e.to_wire())?;
            tx.send(FastMessage::error(id, method.to_string(), payload))
                .await
        }
    }
}

/// Decode the single-element argument array of a request.
fn parse_args<A: DeserializeOwned>(msg: &FastMessage) -> Result<A, RelayError> {
    match msg.data.d {
        Value::Array(ref items) if items.len() == 1 => {
            Ok(serde_json::from_value(items[0].clone())?)
        }
        _ => Err(RelayError::protocol(
            "Expected JSON array with a single element",
        )),
    }
}

/// A sink that wraps each item in a `DATA` message for call `id`.
fn reply_sink<'a, T, I>(
    tx: &'a mut FastSink<T>,
    id: u32,
    method: &'static str,
) -> impl Sink<I, Error = RelayError> + 'a
where
    T: AsyncRead + AsyncWrite + Unpin + 'a,
    I: Serialize + 'a,
{
    tx.with(move |item: I| {
        let msg = serde_json::to_value(vec![item])
            .map(|value| FastMessage::data(id, FastMessageData::new(method.to_string(), value)))
            .map_err(RelayError::from);
        future::ready(msg)
    })
}

/// Resolves once the client ends call `id` (`true`) or the connection ends
/// (`false`). Other messages are dropped.
async fn wait_for_end<T>(rx: &mut FastStream<T>, id: u32) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(Ok(msg)) = rx.next().await {
        if msg.id == id && msg.status == FastMessageStatus::End {
            return true;
        }
    }
    false
}

/// The frames of an upload call: the payload of the opening message, then
/// every following `DATA` message of the call up to its `END`. `finished`
/// is set once no more messages of the call remain on the connection.
fn upload_frames<'a, T>(
    first: &FastMessage,
    rx: &'a mut FastStream<T>,
    finished: &'a mut bool,
) -> impl Stream<Item = Result<UploadFrame, RelayError>> + 'a
where
    T: AsyncRead + AsyncWrite + Unpin + 'a,
{
    let id = first.id;
    let head = stream::once(future::ready(parse_args::<UploadFrame>(first)));

    let tail = stream::unfold(Some((rx, finished)), move |state| async move {
        let (rx, finished) = state?;
        match rx.next().await {
            Some(Ok(msg)) if msg.id != id => Some((
                Err(RelayError::protocol(format!(
                    "message {} arrived during upload {}",
                    msg.id, id
                ))),
                None,
            )),
            Some(Ok(msg)) => match msg.status {
                FastMessageStatus::Data => Some((parse_args(&msg), Some((rx, finished)))),
                FastMessageStatus::End => {
                    *finished = true;
                    None
                }
                FastMessageStatus::Error => {
                    *finished = true;
                    Some((Err(RelayError::protocol("sender aborted the upload")), None))
                }
            },
            Some(Err(e)) => {
                *finished = true;
                Some((Err(RelayError::Transport(e)), None))
            }
            None => {
                *finished = true;
                let e = Error::new(ErrorKind::UnexpectedEof, "connection closed during upload");
                Some((Err(RelayError::Transport(e)), None))
            }
        }
    });

    head.chain(tail)
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;
    use slog::Discard;
    use tokio::io::DuplexStream;

    use crate::config::RelayConfig;
    use crate::error::WireError;
    use crate::message::{FileStatus, TransferDescriptor};

    fn relay() -> Relay {
        let log = Logger::root(Discard, o!());
        Relay::new(RelayConfig::default(), Some(&log))
    }

    fn connect(relay: &Relay) -> Framed<DuplexStream, FastRpc> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let relay = relay.clone();
        tokio::spawn(async move { make_task(server, relay, None).await });
        FastRpc.framed(client)
    }

    fn request(id: u32, method: &str, arg: Value) -> FastMessage {
        FastMessage::data(id, FastMessageData::new(method.to_string(), json!([arg])))
    }

    async fn next(conn: &mut Framed<DuplexStream, FastRpc>) -> FastMessage {
        conn.next().await.unwrap().unwrap()
    }

    fn payload<A: DeserializeOwned>(msg: &FastMessage) -> A {
        parse_args(msg).unwrap()
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let relay = relay();
        let mut conn = connect(&relay);
        conn.send(request(1, "yes", json!({}))).await.unwrap();

        let reply = next(&mut conn).await;
        assert_eq!(reply.status, FastMessageStatus::Error);
        let wire: WireError = serde_json::from_value(reply.data.d).unwrap();
        assert_eq!(wire.name, "ProtocolViolation");
    }

    #[tokio::test]
    async fn register_upload_download_roundtrip() {
        let relay = relay();
        let mut destination = connect(&relay);
        let mut sender = connect(&relay);
        let mut puller = connect(&relay);

        destination
            .send(request(1, REGISTER, json!({ "id": 7 })))
            .await
            .unwrap();
        while relay.registry().destination_count().await == 0 {
            tokio::task::yield_now().await;
        }

        let descriptor = TransferDescriptor::new(7, "abc".to_string());
        sender
            .send(request(1, UPLOAD, json!({ "descriptor": descriptor })))
            .await
            .unwrap();

        let notice = next(&mut destination).await;
        assert_eq!(notice.status, FastMessageStatus::Data);
        assert_eq!(payload::<Notice>(&notice).transfer_id, "abc");

        puller
            .send(request(1, DOWNLOAD, json!({ "transfer_id": "abc" })))
            .await
            .unwrap();
        for (offset, data) in &[(0u64, b"b1"), (2u64, b"b2")] {
            let chunk = Chunk::new(*offset, data.to_vec());
            sender
                .send(request(1, UPLOAD, json!({ "chunk": chunk })))
                .await
                .unwrap();
        }

        let first: Chunk = payload(&next(&mut puller).await);
        let second: Chunk = payload(&next(&mut puller).await);
        assert_eq!(first.data, b"b1".to_vec());
        assert_eq!(second.data, b"b2".to_vec());

        sender
            .send(FastMessage::end(1, UPLOAD.to_string()))
            .await
            .unwrap();
        let status: FileStatus = payload(&next(&mut sender).await);
        assert_eq!(status.bytes_accepted, 4);
        assert_eq!(next(&mut sender).await.status, FastMessageStatus::End);
        assert_eq!(next(&mut puller).await.status, FastMessageStatus::End);

        destination
            .send(FastMessage::end(1, REGISTER.to_string()))
            .await
            .unwrap();
        assert_eq!(next(&mut destination).await.status, FastMessageStatus::End);
        assert_eq!(relay.registry().destination_count().await, 0);
    }

    #[tokio::test]
    async fn failed_upload_skips_rest_of_call() {
        let relay = relay();
        let mut sender = connect(&relay);

        let descriptor = TransferDescriptor::new(99, "nowhere".to_string());
        sender
            .send(request(1, UPLOAD, json!({ "descriptor": descriptor })))
            .await
            .unwrap();
        let chunk = Chunk::new(0, b"lost".to_vec());
        sender
            .send(request(1, UPLOAD, json!({ "chunk": chunk })))
            .await
            .unwrap();
        sender
            .send(FastMessage::end(1, UPLOAD.to_string()))
            .await
            .unwrap();

        let reply = next(&mut sender).await;
        assert_eq!(reply.status, FastMessageStatus::Error);
        let err: RelayError = serde_json::from_value::<WireError>(reply.data.d)
            .unwrap()
            .into();
        assert!(matches!(err, RelayError::DestinationNotFound(99)));

        // The connection is still usable for the next call.
        sender
            .send(request(2, DOWNLOAD, json!({ "transfer_id": "nowhere" })))
            .await
            .unwrap();
        let reply = next(&mut sender).await;
        assert_eq!(reply.id, 2);
        assert_eq!(reply.status, FastMessageStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_mid_upload_removes_transfer() {
        let relay = relay();
        let _notices = relay.registry().register_destination(1).await.unwrap();
        let mut sender = connect(&relay);

        let descriptor = TransferDescriptor::new(1, "t".to_string());
        sender
            .send(request(1, UPLOAD, json!({ "descriptor": descriptor })))
            .await
            .unwrap();
        while relay.registry().transfer_count().await == 0 {
            tokio::task::yield_now().await;
        }

        drop(sender);
        while relay.registry().transfer_count().await != 0 {
            tokio::task::yield_now().await;
        }
    }
}
