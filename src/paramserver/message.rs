//! Messages exchanged between trainers and the server.
//!
//! Control messages travel in the same stream as variables and are told
//! apart by reserved names.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Name carried by a trainer's end-of-round barrier.
pub const BATCH_BARRIER_MESSAGE: &str = "BATCH_BARRIER@RECV";

/// Name carried by the termination signal.
pub const TERMINATE_MESSAGE: &str = "TERMINATE@RECV";

/// Message classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A named variable payload
    Data,
    /// A trainer finished sending for this round
    Barrier,
    /// Stop the server
    Terminate,
}

impl MessageKind {
    /// Classify a variable name.
    pub fn classify(name: &str) -> Self {
        match name {
            BATCH_BARRIER_MESSAGE => MessageKind::Barrier,
            TERMINATE_MESSAGE => MessageKind::Terminate,
            _ => MessageKind::Data,
        }
    }
}

/// Wire frame as sent by a trainer.
#[derive(Serialize, Deserialize)]
struct Frame {
    name: String,
    payload: Vec<u8>,
}

/// A named variable update or control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradientMessage {
    /// Variable name (or a reserved control name)
    pub name: String,
    /// Serialized variable; empty for control messages
    pub payload: Vec<u8>,
    /// Classification
    pub kind: MessageKind,
}

impl GradientMessage {
    /// A variable payload.
    pub fn data(name: &str, payload: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            payload,
            kind: MessageKind::classify(name),
        }
    }

    /// A barrier.
    pub fn barrier() -> Self {
        Self {
            name: BATCH_BARRIER_MESSAGE.to_string(),
            payload: Vec::new(),
            kind: MessageKind::Barrier,
        }
    }

    /// A termination signal.
    pub fn terminate() -> Self {
        Self {
            name: TERMINATE_MESSAGE.to_string(),
            payload: Vec::new(),
            kind: MessageKind::Terminate,
        }
    }

    /// Encode as a wire frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let frame = Frame {
            name: self.name.clone(),
            payload: self.payload.clone(),
        };
        bincode::serialize(&frame).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Decode a wire frame, classifying by name.
    pub fn from_frame(bytes: &[u8]) -> Result<Self> {
        let frame: Frame = bincode::deserialize(bytes)?;
        if frame.name.is_empty() {
            return Err(Error::DeserializationError(
                "frame carries an empty variable name".into(),
            ));
        }
        Ok(Self {
            kind: MessageKind::classify(&frame.name),
            name: frame.name,
            payload: frame.payload,
        })
    }
}
