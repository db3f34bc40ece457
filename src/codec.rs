//! Remote envelopes
//!
//! Everything that crosses a node boundary travels as a [`RemoteEnvelope`]:
//! routing fields plus an opaque body. Two encodings are supported:
//!
//! - binary (`bincode`), used on the wire
//! - text (`serde_json`), for logs and debugging
//!
//! The body is itself bincode-encoded so that any `Serialize` payload can be
//! carried without the envelope knowing its type.

use crate::error::{AgentError, Result};
use crate::routing::host_address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message addressed to an agent on another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    /// Pairs a response with its request
    pub correlation_id: String,

    /// Address the envelope is routed to on the receiving node
    pub destination: String,

    /// Where a reply should be sent, if any
    pub response_address: Option<String>,

    /// Where a failure report should be sent, if any
    pub fault_address: Option<String>,

    /// Application-level message kind (e.g. "Deposit")
    pub kind: String,

    /// bincode-encoded payload
    pub body: Vec<u8>,
}

impl RemoteEnvelope {
    /// Build an envelope for `destination`, encoding `body`
    pub fn new<T: Serialize>(destination: impl Into<String>, kind: impl Into<String>, body: &T) -> Result<Self> {
        let destination = destination.into();
        host_address(&destination)?;
        let body = bincode::serialize(body)
            .map_err(|e| AgentError::Codec(format!("Failed to encode body: {}", e)))?;

        Ok(RemoteEnvelope {
            correlation_id: Uuid::new_v4().simple().to_string(),
            destination,
            response_address: None,
            fault_address: None,
            kind: kind.into(),
            body,
        })
    }

    pub fn with_response_address(mut self, address: impl Into<String>) -> Self {
        self.response_address = Some(address.into());
        self
    }

    pub fn with_fault_address(mut self, address: impl Into<String>) -> Self {
        self.fault_address = Some(address.into());
        self
    }

    /// Decode the body as `T`
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.body)
            .map_err(|e| AgentError::Codec(format!("Failed to decode {} body: {}", self.kind, e)))
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AgentError::Codec(e.to_string()))
    }

    /// Deserialize from binary format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| AgentError::Codec(e.to_string()))
    }

    /// Serialize to JSON
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AgentError::Codec(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AgentError::Codec(e.to_string()))
    }

    /// Human-readable debug representation
    pub fn to_debug_string(&self) -> String {
        format!(
            "[id={}, to={}, kind={}, {} bytes]",
            self.correlation_id,
            self.destination,
            self.kind,
            self.body.len()
        )
    }
}
