//! Messages exchanged while creating polynomials

use crate::types::ProcessId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One participant's contribution to a creation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolynomialProposal {
    pub creation_id: u64,
    pub sender: ProcessId,
    /// Feldman points of each proposed polynomial
    pub commitments: Vec<Vec<Vec<u8>>>,
    /// Per participant, its evaluation of each polynomial sealed for it
    pub points: BTreeMap<ProcessId, Vec<Vec<u8>>>,
}

impl PolynomialProposal {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(*blake3::hash(&self.serialize()?).as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDigest {
    pub sender: ProcessId,
    pub digest: [u8; 32],
}

/// The leader's choice of proposals, agreed on through the ordering layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSetMessage {
    pub creation_id: u64,
    pub leader: ProcessId,
    pub proposals: Vec<ProposalDigest>,
}

impl ProposalSetMessage {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
