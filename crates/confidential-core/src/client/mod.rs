//! Client side reconciliation of replica replies

mod response_handler;

pub use response_handler::ServersResponseHandler;

use crate::types::ProcessId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// How the request a reply answers was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Ordered,
    Unordered,
    Reconfiguration,
}

/// A reply as received from one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub sender: ProcessId,
    pub session: u32,
    pub sequence: u32,
    pub operation_id: u32,
    pub view_id: u32,
    pub request_type: RequestType,
    pub content: Vec<u8>,
}

impl ServiceReply {
    /// Same envelope, different content
    pub fn with_content(&self, content: Vec<u8>) -> Self {
        Self {
            content,
            ..self.clone()
        }
    }
}

/// Reconstructed response handed to the caller.
///
/// On failure `error` is set and the data reconstructed before the failure
/// is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedResponse {
    pub plain_data: Option<Vec<u8>>,
    pub confidential_data: Vec<Vec<u8>>,
    pub error: Option<String>,
}

impl ExtractedResponse {
    pub fn new(plain_data: Option<Vec<u8>>, confidential_data: Vec<Vec<u8>>) -> Self {
        Self {
            plain_data,
            confidential_data,
            error: None,
        }
    }

    pub fn failed(plain_data: Option<Vec<u8>>, confidential_data: Vec<Vec<u8>>, error: &Error) -> Self {
        Self {
            plain_data,
            confidential_data,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
