// Copyright 2020 Joyent, Inc.

//! fast-relay: a file transfer relay spoken over Fast
//!
//! The relay connects senders to destinations that cannot reach each other
//! directly. A destination registers under a numeric identity and waits for
//! notices. A sender uploads a transfer descriptor naming a destination,
//! followed by the file's chunks. The relay tells the destination about the
//! transfer, and the destination downloads the chunks through the relay as
//! they arrive. Each transfer is buffered in a small bounded queue, so a
//! slow destination slows its sender down.
//!
//! The engine lives in [`relay`], [`registry`] and the three call handlers
//! ([`destination`], [`upload`], [`download`]). [`server`] serves the calls
//! on a Fast connection and [`client`] makes them.
//!
//! Wire format
//!
//! Every Fast message is a 15-byte header followed by a JSON payload:
//!
//! | bytes | field   | meaning                                          |
//! |-------|---------|--------------------------------------------------|
//! | 1     | VERSION | always 1                                         |
//! | 1     | TYPE    | always 1, a JSON payload                         |
//! | 1     | STATUS  | 1 data, 2 end, 3 error                           |
//! | 4     | MSGID   | big-endian id shared by every message of a call  |
//! | 4     | CRC     | big-endian CRC16 (ARC) of the payload            |
//! | 4     | DLEN    | big-endian payload length                        |
//!
//! The payload is `{"m": {"uts": <micros>, "name": <method>}, "d": <value>}`.
//! Message ids are scoped to a connection and allocated from a circular
//! 31-bit space.

#![allow(missing_docs)]

#[macro_use]
extern crate num_derive;

pub mod client;
pub mod config;
pub mod destination;
pub mod download;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod server;
pub mod upload;
