//! State transfer and reconfiguration bookkeeping

mod log;
mod manager;

pub use self::log::{ApplicationState, CommandsInfo, ConfidentialStateLog};
pub use manager::{ConfidentialStateManager, CreationOutcome};

use crate::types::ProcessId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Membership change requested through the ordering layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReconfigurationRequest {
    /// `pid:host:port` descriptors
    pub joining_servers: Vec<String>,
    pub leaving_servers: Vec<ProcessId>,
    pub f: usize,
}

impl BatchReconfigurationRequest {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Process ids of the joining servers; fails if any descriptor is malformed
    pub fn joining_process_ids(&self) -> Result<Vec<ProcessId>> {
        self.joining_servers
            .iter()
            .map(|descriptor| {
                descriptor
                    .split(':')
                    .next()
                    .and_then(|pid| pid.trim().parse::<ProcessId>().ok())
                    .ok_or_else(|| {
                        Error::Reconfiguration(format!("Invalid server descriptor '{}'", descriptor))
                    })
            })
            .collect()
    }
}

/// Reconfiguration staged until the ordering layer reports completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigurationParameters {
    pub new_f: usize,
    pub joining_servers: BTreeSet<ProcessId>,
    pub leaving_servers: BTreeSet<ProcessId>,
}

impl fmt::Display for ReconfigurationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "f={} joining={:?} leaving={:?}",
            self.new_f, self.joining_servers, self.leaving_servers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joining_descriptors() {
        let request = BatchReconfigurationRequest {
            joining_servers: vec!["4:127.0.0.1:11040".into(), "5".into()],
            leaving_servers: vec![0],
            f: 1,
        };
        assert_eq!(request.joining_process_ids().unwrap(), vec![4, 5]);

        let decoded = BatchReconfigurationRequest::deserialize(&request.serialize().unwrap()).unwrap();
        assert_eq!(decoded, request);

        let bad = BatchReconfigurationRequest {
            joining_servers: vec!["4:host:1".into(), "x:host:2".into()],
            leaving_servers: vec![],
            f: 1,
        };
        assert!(matches!(bad.joining_process_ids(), Err(Error::Reconfiguration(_))));
    }
}
