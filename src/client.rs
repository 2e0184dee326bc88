// Copyright 2020 Joyent, Inc.

//! This module provides a client for the relay's Fast calls. A client owns
//! one connection and runs one call on it at a time; starting a new call
//! abandons the reply stream of the previous one.

use std::io::{Error, ErrorKind};
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use slog::{debug, o, trace, Drain, Logger};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Framed};

use crate::error::{RelayError, WireError};
use crate::message::{
    Chunk, DestinationId, DownloadArgs, FileStatus, Notice, RegisterArgs, TransferDescriptor,
    UploadFrame,
};
use crate::protocol::{FastMessage, FastMessageData, FastMessageId, FastMessageStatus, FastRpc};
use crate::server::{DOWNLOAD, REGISTER, UPLOAD};

struct Call {
    id: u32,
    method: &'static str,
}

pub struct RelayClient {
    conn: Framed<TcpStream, FastRpc>,
    msg_id: FastMessageId,
    call: Option<Call>,
    log: Logger,
}

impl RelayClient {
    pub async fn connect(addr: &SocketAddr, log: Option<&Logger>) -> Result<RelayClient, RelayError> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let stream = TcpStream::connect(addr).await?;
        debug!(log, "connected to relay"; "address" => %addr);

        Ok(RelayClient {
            conn: FastRpc.framed(stream),
            msg_id: FastMessageId::new(),
            call: None,
            log,
        })
    }

    /// Start a `register` call for destination `id`. A refused registration
    /// is reported by the first `next_notice`.
    pub async fn register(&mut self, id: DestinationId) -> Result<(), RelayError> {
        self.start(REGISTER, &RegisterArgs { id }).await
    }

    /// The next notice of the current `register` call, or `None` once the
    /// relay has closed the session.
    pub async fn next_notice(&mut self) -> Result<Option<Notice>, RelayError> {
        self.next_reply(REGISTER).await
    }

    /// Leave the current `register` call. Notices the relay sent before it
    /// saw the hang up are returned.
    pub async fn hang_up(&mut self) -> Result<Vec<Notice>, RelayError> {
        self.end_call(REGISTER).await?;

        let mut pending = Vec::new();
        while let Some(notice) = self.next_notice().await? {
            pending.push(notice);
        }
        Ok(pending)
    }

    pub async fn begin_upload(&mut self, descriptor: TransferDescriptor) -> Result<(), RelayError> {
        self.start(UPLOAD, &UploadFrame::Descriptor(descriptor)).await
    }

    pub async fn send_chunk(&mut self, chunk: Chunk) -> Result<(), RelayError> {
        let id = self.current(UPLOAD)?;
        self.send_data(id, UPLOAD, &UploadFrame::Chunk(chunk)).await
    }

    /// End the current upload and wait for the relay's verdict.
    pub async fn finish_upload(&mut self) -> Result<FileStatus, RelayError> {
        self.end_call(UPLOAD).await?;

        let status = self.next_reply::<FileStatus>(UPLOAD).await?;
        let status = status.ok_or_else(|| RelayError::protocol("upload ended without a status"))?;
        match self.next_reply::<Value>(UPLOAD).await? {
            None => Ok(status),
            Some(_) => Err(RelayError::protocol("unexpected data after upload status")),
        }
    }

    /// Upload `data` as a sequence of chunks of at most `chunk_size` bytes.
    pub async fn upload(
        &mut self,
        descriptor: TransferDescriptor,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<FileStatus, RelayError> {
        if chunk_size == 0 {
            return Err(RelayError::protocol("chunk size must be positive"));
        }

        self.begin_upload(descriptor).await?;
        let mut offset = 0;
        for piece in data.chunks(chunk_size) {
            self.send_chunk(Chunk::new(offset, piece.to_vec())).await?;
            offset += piece.len() as u64;
        }
        self.finish_upload().await
    }

    pub async fn download(&mut self, transfer_id: &str) -> Result<(), RelayError> {
        let args = DownloadArgs {
            transfer_id: transfer_id.to_string(),
        };
        self.start(DOWNLOAD, &args).await
    }

    /// The next chunk of the current download, or `None` once the upload
    /// has finished and every chunk was delivered.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, RelayError> {
        self.next_reply(DOWNLOAD).await
    }

    async fn start<A: Serialize>(&mut self, method: &'static str, arg: &A) -> Result<(), RelayError> {
        let id = self
            .msg_id
            .next()
            .ok_or_else(|| RelayError::protocol("message ids exhausted"))?;
        if let Some(prev) = self.call.replace(Call { id, method }) {
            debug!(self.log, "abandoning call"; "msg_id" => prev.id, "method" => prev.method);
        }
        self.send_data(id, method, arg).await
    }

    async fn send_data<A: Serialize>(
        &mut self,
        id: u32,
        method: &str,
        arg: &A,
    ) -> Result<(), RelayError> {
        let data = FastMessageData::new(method.to_string(), json!([arg]));
        trace!(self.log, "sending request"; "msg_id" => id, "method" => method);
        self.conn.send(FastMessage::data(id, data)).await?;
        Ok(())
    }

    async fn end_call(&mut self, method: &'static str) -> Result<(), RelayError> {
        let id = self.current(method)?;
        self.conn.send(FastMessage::end(id, method.to_string())).await?;
        Ok(())
    }

    fn current(&self, method: &str) -> Result<u32, RelayError> {
        match self.call {
            Some(ref call) if call.method == method => Ok(call.id),
            _ => Err(RelayError::protocol(format!("no {} call in progress", method))),
        }
    }

    /// Receive the next reply of the current call. `DATA` yields its
    /// payload, `END` yields `None` and `ERROR` the relay's error; either
    /// of the last two ends the call.
    async fn next_reply<A: DeserializeOwned>(
        &mut self,
        method: &'static str,
    ) -> Result<Option<A>, RelayError> {
        let id = self.current(method)?;

        loop {
            let msg = match self.conn.next().await {
                Some(msg) => msg?,
                None => {
                    self.call = None;
                    return Err(RelayError::Transport(Error::new(
                        ErrorKind::UnexpectedEof,
                        "relay closed the connection",
                    )));
                }
            };

            if msg.id != id {
                trace!(self.log, "dropping reply of an earlier call"; "msg" => %msg);
                continue;
            }

            match msg.status {
                FastMessageStatus::Data => return Ok(Some(single_payload(msg.data.d)?)),
                FastMessageStatus::End => {
                    self.call = None;
                    return Ok(None);
                }
                FastMessageStatus::Error => {
                    self.call = None;
                    let wire: WireError = serde_json::from_value(msg.data.d)?;
                    return Err(wire.into());
                }
            }
        }
    }
}

fn single_payload<A: DeserializeOwned>(d: Value) -> Result<A, RelayError> {
    match d {
        Value::Array(mut items) if items.len() == 1 => Ok(serde_json::from_value(items.remove(0))?),
        _ => Err(RelayError::protocol(
            "Expected JSON array with a single element",
        )),
    }
}
