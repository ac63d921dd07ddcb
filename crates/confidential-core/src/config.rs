//! Replica configuration

use crate::crypto::CommitmentSchemeKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Settings of the confidentiality layer of one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Responses are protected by the transport and sent in the clear
    pub use_tls_encryption: bool,
    /// Check share commitments before ordering requests tagged VERIFY
    pub verify_client_requests: bool,
    /// Clients put every sealed share in the common request bytes
    pub send_all_shares_together: bool,
    /// Consensus ids between two full checkpoints
    pub checkpoint_period: u64,
    pub log_enabled: bool,
    pub log_to_disk: bool,
    /// Byzantine ordering layer; state transfer requires certified decisions
    pub bft: bool,
    pub request_cache_capacity: usize,
    pub request_cache_ttl_secs: i64,
    pub commitment_scheme: CommitmentSchemeKind,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            use_tls_encryption: false,
            verify_client_requests: false,
            send_all_shares_together: false,
            checkpoint_period: 1000,
            log_enabled: true,
            log_to_disk: false,
            bft: true,
            request_cache_capacity: 10_000,
            request_cache_ttl_secs: 60,
            commitment_scheme: CommitmentSchemeKind::Feldman,
        }
    }
}

impl Configuration {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Configuration = serde_json::from_str(&contents)
            .map_err(|e| Error::InvalidConfig(format!("Cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_period == 0 {
            return Err(Error::InvalidConfig("checkpoint_period must be positive".into()));
        }
        if self.request_cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "request_cache_capacity must be positive".into(),
            ));
        }
        if self.request_cache_ttl_secs <= 0 {
            return Err(Error::InvalidConfig(
                "request_cache_ttl_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether commands are kept in the in-memory state log
    pub fn logging_enabled(&self) -> bool {
        if self.log_enabled && self.log_to_disk {
            warn!("Disk logging is not supported, state log disabled");
            return false;
        }
        self.log_enabled
    }
}
