//! Frames exchanged on the bus.
//!
//! Every frame is one JSON object terminated by a newline. Channel names on
//! the wire are full names (`<process-prefix><channel-name>`).
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use crate::channel::{ChannelDescriptor, ChannelValue, Reading};
use crate::error::BusError;

/// Frames longer than this are refused
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        id: u64,
        name: String,
    },
    Put {
        id: u64,
        name: String,
        value: ChannelValue,
        wait: bool,
    },
    Monitor {
        id: u64,
        name: String,
    },
    ClearMonitor {
        name: String,
    },
    List {
        id: u64,
        filter: Option<String>,
    },
    Info {
        id: u64,
        name: String,
    },
}

impl Request {
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Get { id, .. }
            | Self::Put { id, .. }
            | Self::Monitor { id, .. }
            | Self::List { id, .. }
            | Self::Info { id, .. } => Some(*id),
            Self::ClearMonitor { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    /// Answer to `Get` and the first answer to `Monitor`
    Value {
        id: u64,
        name: String,
        reading: Reading,
    },
    /// Pushed to monitoring sessions on every change
    Update { name: String, reading: Reading },
    Ack {
        id: u64,
        name: String,
    },
    Nak {
        id: u64,
        name: String,
        reason: String,
    },
    /// The channel is not served here; clients try the next address
    Unknown {
        id: u64,
        name: String,
    },
    Names {
        id: u64,
        names: Vec<String>,
    },
    Info {
        id: u64,
        descriptor: ChannelDescriptor,
    },
    Error {
        id: Option<u64>,
        message: String,
    },
}

impl Response {
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Value { id, .. }
            | Self::Ack { id, .. }
            | Self::Nak { id, .. }
            | Self::Unknown { id, .. }
            | Self::Names { id, .. }
            | Self::Info { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::Update { .. } => None,
        }
    }
}

/// Write one frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), BusError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, BusError> {
    let mut line = String::new();
    let n_bytes = reader.read_line(&mut line)?;
    if n_bytes == 0 {
        return Ok(None);
    }
    if n_bytes > MAX_FRAME_LEN {
        return Err(BusError::FrameTooLong(n_bytes));
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}
