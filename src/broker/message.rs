//! Message envelope and service ids shared by master and workers.
//!
//! Envelopes are JSON-serialized and newline-delimited when they cross a
//! process boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GenError, Result};

/// Alias the privileged endpoint registers under.
pub const MASTER_ALIAS: &str = "master";

/// Service ids understood by master and worker endpoints.
pub mod services {
    /// Reserved registration handshake (worker -> master).
    pub const REGISTER: &str = "_register";
    /// Worker asks for a batch; master answers on the same service id.
    pub const REQUEST_ROUTES: &str = "requestRoutes";
    /// Worker reports item errors for a finished batch.
    pub const HANDLE_ERRORS: &str = "handleErrors";
    /// Forwarded log event (worker -> master).
    pub const LOG: &str = "log";
}

/// One-shot message envelope.
///
/// There is no conversation id: a reply is a new message sent back to
/// `sender_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Instance id of the sending endpoint.
    pub sender_id: String,
    /// Instance id or alias of the receiving endpoint.
    pub receiver_id: String,
    /// Service to invoke on the receiver.
    pub service_id: String,
    /// Service payload.
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        service_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            service_id: service_id.into(),
            data,
        }
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.service_id, self.data.clone())
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Decode a service payload, tagging failures with the service id.
pub fn decode_payload<T: DeserializeOwned>(service: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| GenError::InvalidPayload {
        service: service.to_string(),
        message: e.to_string(),
    })
}

/// Payload of the `_register` handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}
