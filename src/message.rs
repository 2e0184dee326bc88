// Copyright 2020 Joyent, Inc.

//! Payloads carried by relay calls.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

/// Caller-chosen identity of a destination server.
pub type DestinationId = i32;

/// The first message of an upload: who the file is for and what to call it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferDescriptor {
    pub destination: DestinationId,
    pub transfer_id: String,
    /// Informational only; the relay does not enforce it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl TransferDescriptor {
    pub fn new(destination: DestinationId, transfer_id: String) -> Self {
        TransferDescriptor {
            destination,
            transfer_id,
            total_size: None,
        }
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }
}

/// Tells a destination that a transfer addressed to it is ready to be pulled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notice {
    pub destination: DestinationId,
    pub transfer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    pub created: DateTime<Utc>,
}

impl From<&TransferDescriptor> for Notice {
    fn from(descriptor: &TransferDescriptor) -> Self {
        Notice {
            destination: descriptor.destination,
            transfer_id: descriptor.transfer_id.clone(),
            total_size: descriptor.total_size,
            created: Utc::now(),
        }
    }
}

/// An opaque piece of a transfer's byte stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Sender-assigned offset of `data` within the file.
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Chunk { offset, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One inbound message of an upload call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UploadFrame {
    Descriptor(TransferDescriptor),
    Chunk(Chunk),
}

/// The reply to a completed upload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStatus {
    pub bytes_accepted: u64,
    pub chunks_accepted: u64,
    pub last_chunk_offset: u64,
}

impl FileStatus {
    pub fn record(&mut self, chunk: &Chunk) {
        self.bytes_accepted += chunk.len() as u64;
        self.chunks_accepted += 1;
        self.last_chunk_offset = chunk.offset;
    }
}

/// Arguments of a `register` call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegisterArgs {
    pub id: DestinationId,
}

/// Arguments of a `download` call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownloadArgs {
    pub transfer_id: String,
}

/// Generate a random transfer id. The relay only detects id collisions, so
/// senders should pick ids from a space where they are improbable.
pub fn new_transfer_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    #[test]
    fn upload_frames_are_tagged() {
        let frame: UploadFrame = serde_json::from_value(json!({
            "descriptor": { "destination": 7, "transfer_id": "abc" }
        }))
        .unwrap();
        assert_eq!(
            frame,
            UploadFrame::Descriptor(TransferDescriptor::new(7, "abc".into()))
        );

        let frame: UploadFrame =
            serde_json::from_value(json!({ "chunk": { "offset": 4, "data": [1, 2] } })).unwrap();
        assert_eq!(frame, UploadFrame::Chunk(Chunk::new(4, vec![1, 2])));
    }

    #[test]
    fn chunk_without_payload_is_rejected() {
        let frame: Result<UploadFrame, _> = serde_json::from_value(json!({ "chunk": { "offset": 0 } }));
        assert!(frame.is_err());
    }

    #[test]
    fn status_tracks_last_offset() {
        let mut status = FileStatus::default();
        status.record(&Chunk::new(0, vec![0; 10]));
        status.record(&Chunk::new(10, vec![0; 5]));
        assert_eq!(status.bytes_accepted, 15);
        assert_eq!(status.chunks_accepted, 2);
        assert_eq!(status.last_chunk_offset, 10);
    }

    #[test]
    fn transfer_ids_are_distinct() {
        let a = new_transfer_id();
        let b = new_transfer_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
