//! Core types shared by the replica and client sides

use crate::crypto::Commitment;
use crate::{Error, Result};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a replica or client process
pub type ProcessId = u32;

/// Sequence number assigned by the ordering layer to a committed batch
pub type ConsensusId = u64;

/// A process's identity within the secret-sharing scheme.
///
/// Shareholder ids are evaluation points of the sharing polynomial and must
/// never be zero. Replicas use `process_id + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShareholderId(pub u64);

impl ShareholderId {
    /// Shareholder id a replica is registered under
    pub fn for_process(process_id: ProcessId) -> Self {
        Self(process_id as u64 + 1)
    }

    /// Evaluation point of this shareholder
    pub fn to_scalar(self) -> Scalar {
        Scalar::from(self.0)
    }
}

impl fmt::Display for ShareholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a decoded request. The discriminants are the wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Client = 0,
    Application = 1,
    Reconfiguration = 2,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Client),
            1 => Ok(Self::Application),
            2 => Ok(Self::Reconfiguration),
            tag => Err(Error::UnknownTag {
                kind: "message type",
                tag,
            }),
        }
    }
}

/// Pre-validation hint attached to an inbound message by its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Metadata {
    Verify = 0,
    DoesNotVerify = 1,
    PolynomialProposalSet = 2,
}

impl Metadata {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Metadata {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Verify),
            1 => Ok(Self::DoesNotVerify),
            2 => Ok(Self::PolynomialProposalSet),
            tag => Err(Error::UnknownTag {
                kind: "metadata",
                tag,
            }),
        }
    }
}

/// Delivery context handed over by the ordering layer with every command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    pub sender: ProcessId,
    pub session: u32,
    pub sequence: u32,
    pub operation_id: u32,
    pub view_id: u32,
    pub consensus_id: ConsensusId,
    pub regency: u32,
    pub last_in_batch: bool,
    pub no_op: bool,
}

/// A message as received by the replica before ordering, used for
/// pre-validation
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub sender: ProcessId,
    pub session: u32,
    pub sequence: u32,
    pub metadata: Option<Vec<u8>>,
    pub content: Vec<u8>,
    pub private_content: Option<Vec<u8>>,
}

/// One shareholder's point on a sharing polynomial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub shareholder: ShareholderId,
    #[serde(with = "scalar_serde")]
    pub value: Scalar,
}

impl Share {
    pub fn new(shareholder: ShareholderId, value: Scalar) -> Self {
        Self { shareholder, value }
    }
}

/// A share bound to the commitment it must validate against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableShare {
    pub share: Share,
    pub commitment: Commitment,
    /// Ciphertext of a large secret, shared by all shareholders
    pub shared_data: Option<Vec<u8>>,
}

/// Response produced by the confidential application, in the clear
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialMessage {
    pub plain_data: Option<Vec<u8>>,
    pub shares: Vec<VerifiableShare>,
}

impl ConfidentialMessage {
    pub fn new(plain_data: Option<Vec<u8>>, shares: Vec<VerifiableShare>) -> Self {
        Self { plain_data, shares }
    }

    pub fn plain(plain_data: Vec<u8>) -> Self {
        Self::new(Some(plain_data), Vec::new())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// A share whose value is encrypted for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVerifiableShare {
    pub shareholder: ShareholderId,
    pub share: Vec<u8>,
    pub commitment: Commitment,
    pub shared_data: Option<Vec<u8>>,
}

/// Response as sent to a client when transport encryption is off.
///
/// A `None` entry marks a share the replica failed to encrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedConfidentialMessage {
    pub plain_data: Option<Vec<u8>>,
    pub shares: Vec<Option<EncryptedVerifiableShare>>,
}

impl EncryptedConfidentialMessage {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Hash over the parts of the response every correct replica agrees on.
    ///
    /// Share values and shareholder ids differ per replica and are left out.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        match &self.plain_data {
            Some(data) => {
                hasher.update(&[1]);
                hasher.update(&(data.len() as u64).to_be_bytes());
                hasher.update(data);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(&(self.shares.len() as u64).to_be_bytes());
        for share in &self.shares {
            match share {
                Some(share) => {
                    hasher.update(&[1]);
                    let commitment = share.commitment.consensus_bytes();
                    hasher.update(&(commitment.len() as u64).to_be_bytes());
                    hasher.update(&commitment);
                    match &share.shared_data {
                        Some(data) => {
                            hasher.update(&(data.len() as u64).to_be_bytes());
                            hasher.update(data);
                        }
                        None => {
                            hasher.update(&u64::MAX.to_be_bytes());
                        }
                    }
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Full state of the confidential application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialSnapshot {
    pub plain_data: Option<Vec<u8>>,
    pub shares: Vec<VerifiableShare>,
}

impl ConfidentialSnapshot {
    pub fn new(plain_data: Option<Vec<u8>>, shares: Vec<VerifiableShare>) -> Self {
        Self { plain_data, shares }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

pub(crate) mod scalar_serde {
    use k256::{
        elliptic_curve::{bigint::U256, ops::Reduce},
        Scalar,
    };
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = scalar.to_bytes();
        serializer.serialize_bytes(bytes.as_slice())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid scalar length"))?;
        Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
    }
}
