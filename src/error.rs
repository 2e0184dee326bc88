// Copyright 2020 Joyent, Inc.

//! Errors returned by relay calls.
//!
//! Every error is local to the call that produced it. The variants that a
//! peer needs to tell apart (an identity that is already taken, a missing
//! destination, a transfer id collision, an unknown transfer, a malformed
//! message sequence) travel across the Fast boundary by name as a
//! [`WireError`] and are rebuilt on the client side.

use std::error::Error as StdError;
use std::{fmt, io};

use serde_derive::{Deserialize, Serialize};

use crate::message::DestinationId;

#[derive(Debug)]
pub enum RelayError {
    /// A destination tried to register an identity that is already active.
    AlreadyRegistered(DestinationId),
    /// A transfer was addressed to an identity with no active registration.
    DestinationNotFound(DestinationId),
    /// A transfer id collides with a transfer still in flight.
    TransferAlreadyActive(String),
    /// A download named a transfer that is not active.
    TransferNotFound(String),
    /// The message sequence on a call did not have the expected shape.
    ProtocolViolation(String),
    /// The session's queue was closed underneath the call, or the relay
    /// has been stopped.
    Closed,
    /// The call's underlying stream failed.
    Transport(io::Error),
}

impl RelayError {
    pub fn protocol<S: Into<String>>(msg: S) -> RelayError {
        RelayError::ProtocolViolation(msg.into())
    }

    /// The stable name used for this error on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RelayError::AlreadyRegistered(_) => "AlreadyRegistered",
            RelayError::DestinationNotFound(_) => "DestinationNotFound",
            RelayError::TransferAlreadyActive(_) => "TransferAlreadyActive",
            RelayError::TransferNotFound(_) => "TransferNotFound",
            RelayError::ProtocolViolation(_) => "ProtocolViolation",
            RelayError::Closed => "Closed",
            RelayError::Transport(_) => "TransportError",
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }

    pub fn to_wire(&self) -> WireError {
        let (destination, transfer_id) = match self {
            RelayError::AlreadyRegistered(id) | RelayError::DestinationNotFound(id) => {
                (Some(*id), None)
            }
            RelayError::TransferAlreadyActive(id) | RelayError::TransferNotFound(id) => {
                (None, Some(id.clone()))
            }
            _ => (None, None),
        };

        let message = match self {
            RelayError::ProtocolViolation(msg) => msg.clone(),
            _ => self.to_string(),
        };

        WireError {
            name: self.name().to_string(),
            message,
            destination,
            transfer_id,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelayError::AlreadyRegistered(id) => write!(f, "{} already registered", id),
            RelayError::DestinationNotFound(id) => {
                write!(f, "can't find destination with id: {}", id)
            }
            RelayError::TransferAlreadyActive(id) => {
                write!(f, "{} is already being transferred", id)
            }
            RelayError::TransferNotFound(id) => write!(f, "can't find transfer {}", id),
            RelayError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            RelayError::Closed => write!(f, "session closed"),
            RelayError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl StdError for RelayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RelayError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(error: io::Error) -> Self {
        RelayError::Transport(error)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        RelayError::ProtocolViolation(format!("malformed payload: {}", error))
    }
}

/// The payload of a Fast `ERROR` message sent for a failed call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<DestinationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
}

impl From<WireError> for RelayError {
    fn from(wire: WireError) -> Self {
        let WireError {
            name,
            message,
            destination,
            transfer_id,
        } = wire;

        match (name.as_str(), destination, transfer_id) {
            ("AlreadyRegistered", Some(id), _) => RelayError::AlreadyRegistered(id),
            ("DestinationNotFound", Some(id), _) => RelayError::DestinationNotFound(id),
            ("TransferAlreadyActive", _, Some(id)) => RelayError::TransferAlreadyActive(id),
            ("TransferNotFound", _, Some(id)) => RelayError::TransferNotFound(id),
            ("Closed", _, _) => RelayError::Closed,
            ("ProtocolViolation", _, _) => RelayError::ProtocolViolation(message),
            _ => RelayError::Transport(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: {}", name, message),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_form_keeps_variants_distinguishable() {
        let not_found: RelayError = RelayError::DestinationNotFound(7).to_wire().into();
        let collision: RelayError =
            RelayError::TransferAlreadyActive("abc".into()).to_wire().into();
        let taken: RelayError = RelayError::AlreadyRegistered(3).to_wire().into();

        assert!(matches!(not_found, RelayError::DestinationNotFound(7)));
        assert!(matches!(collision, RelayError::TransferAlreadyActive(ref id) if id == "abc"));
        assert!(matches!(taken, RelayError::AlreadyRegistered(3)));
    }

    #[test]
    fn unknown_wire_error_is_a_transport_error() {
        let wire = WireError {
            name: "Bogus".into(),
            message: "something broke".into(),
            destination: None,
            transfer_id: None,
        };
        let err: RelayError = wire.into();
        assert!(err.is_transport());
        assert!(err.to_string().contains("something broke"));
    }

    #[test]
    fn protocol_violation_keeps_its_message() {
        let err: RelayError = RelayError::protocol("expected chunk").to_wire().into();
        match err {
            RelayError::ProtocolViolation(msg) => {
                assert_eq!(msg, "expected chunk")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
