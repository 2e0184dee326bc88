// Copyright 2020 Joyent, Inc.

//! Relay engine configuration.

use std::io::{Error, ErrorKind};

use serde_derive::{Deserialize, Serialize};

/// Default capacity of every notice and chunk queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Number of notices a destination, or chunks a transfer, may have
    /// buffered before the producer blocks.
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn from_json(s: &str) -> Result<RelayConfig, Error> {
        let config: RelayConfig = serde_json::from_str(s).map_err(|e| {
            let msg = format!("Failed to parse relay configuration: {}", e);
            Error::new(ErrorKind::InvalidData, msg)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.queue_capacity == 0 {
            let msg = "queue_capacity must be at least 1";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }
        Ok(())
    }
}
