//! Request codec
//!
//! Wire layout: a one-byte [`MessageType`] tag followed by type specific fields.
//! Lengths and counts are big-endian `i32`, `-1` marks an absent block.
//!
//! - CLIENT: plain data block, share count, then either one sealed share
//!   bundle per secret (combined layout) or per-secret fields split over a
//!   common stream (shared data, commitment) and a private stream (sealed
//!   share, and the witness for non-linear commitments).
//! - APPLICATION: plain data block.
//! - RECONFIGURATION: every remaining byte is plain data.

use crate::crypto::{Commitment, ConfidentialityScheme, EncryptedPublishedShares};
use crate::types::{MessageType, ProcessId, ShareholderId, VerifiableShare};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const ABSENT: i32 = -1;
const FELDMAN_TAG: u8 = 0;
const MERKLE_TAG: u8 = 1;

/// A decoded client or internal command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub kind: MessageType,
    pub plain_data: Option<Vec<u8>>,
    pub shares: Option<Vec<VerifiableShare>>,
}

impl Request {
    pub fn client(plain_data: Option<Vec<u8>>, shares: Option<Vec<VerifiableShare>>) -> Self {
        Self {
            kind: MessageType::Client,
            plain_data,
            shares,
        }
    }

    pub fn application(plain_data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Application,
            plain_data: Some(plain_data),
            shares: None,
        }
    }

    pub fn reconfiguration(plain_data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Reconfiguration,
            plain_data: Some(plain_data),
            shares: None,
        }
    }

    /// Encode a request that carries no shares.
    ///
    /// Shares must be sealed per recipient first, see [`encode_client_request`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind.tag());
        match self.kind {
            MessageType::Client => {
                put_block(&mut buf, self.plain_data.as_deref());
                match &self.shares {
                    None => buf.put_i32(ABSENT),
                    Some(shares) if shares.is_empty() => buf.put_i32(0),
                    Some(_) => {
                        return Err(Error::Serialization(
                            "Client shares must be sealed before encoding".into(),
                        ))
                    }
                }
            }
            MessageType::Application => {
                put_block(&mut buf, Some(self.plain_data.as_deref().unwrap_or_default()));
            }
            MessageType::Reconfiguration => {
                buf.put_slice(self.plain_data.as_deref().unwrap_or_default());
            }
        }
        Ok(buf.to_vec())
    }

    /// Form kept in the state log, shares in the clear
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// A client request ready to be handed to the ordering layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedRequest {
    /// Every sealed share travels in the common bytes
    Combined(Vec<u8>),
    /// Common bytes plus one private stream per replica
    Split {
        common: Vec<u8>,
        private: BTreeMap<ProcessId, Vec<u8>>,
    },
}

/// Encode a CLIENT request whose secrets were dealt and sealed by the client
pub fn encode_client_request(
    plain_data: Option<&[u8]>,
    secrets: Option<&[EncryptedPublishedShares]>,
    combine_private_and_common: bool,
    shareholders: &BTreeMap<ProcessId, ShareholderId>,
) -> Result<EncodedRequest> {
    let mut common = BytesMut::new();
    common.put_u8(MessageType::Client.tag());
    put_block(&mut common, plain_data);

    let Some(secrets) = secrets else {
        common.put_i32(ABSENT);
        return Ok(EncodedRequest::Combined(common.to_vec()));
    };
    common.put_i32(to_len(secrets.len())?);

    if combine_private_and_common {
        for secret in secrets {
            put_published(&mut common, secret)?;
        }
        return Ok(EncodedRequest::Combined(common.to_vec()));
    }

    let mut private: BTreeMap<ProcessId, BytesMut> = shareholders
        .keys()
        .map(|process_id| (*process_id, BytesMut::new()))
        .collect();
    for secret in secrets {
        put_block(&mut common, secret.shared_data.as_deref());
        match &secret.commitment {
            Commitment::Feldman(_) => put_commitment(&mut common, &secret.commitment)?,
            Commitment::Merkle { root, .. } => put_block(&mut common, Some(root)),
        }
        for (process_id, stream) in private.iter_mut() {
            put_block(stream, secret.encrypted_shares.get(process_id).map(Vec::as_slice));
            if let Commitment::Merkle { witnesses, .. } = &secret.commitment {
                let witness = shareholders
                    .get(process_id)
                    .and_then(|shareholder| witnesses.get(&shareholder.0))
                    .ok_or_else(|| {
                        Error::Serialization(format!("No witness for process {}", process_id))
                    })?;
                put_block(stream, Some(witness));
            }
        }
    }

    Ok(EncodedRequest::Split {
        common: common.to_vec(),
        private: private
            .into_iter()
            .map(|(process_id, stream)| (process_id, stream.to_vec()))
            .collect(),
    })
}

/// Replica side decoder, extracting this process's shares as it reads
pub struct RequestDecoder {
    scheme: Arc<ConfidentialityScheme>,
    combine_private_and_common: bool,
}

impl RequestDecoder {
    pub fn new(scheme: Arc<ConfidentialityScheme>, combine_private_and_common: bool) -> Self {
        Self {
            scheme,
            combine_private_and_common,
        }
    }

    pub fn decode(&self, common: &[u8], private: Option<&[u8]>) -> Result<Request> {
        let mut buf = common;
        let kind = MessageType::try_from(get_u8(&mut buf)?)?;
        let request = match kind {
            MessageType::Client => {
                let plain_data = get_block(&mut buf)?;
                let count = get_i32(&mut buf)?;
                let shares = match count {
                    ABSENT => None,
                    0 => Some(Vec::new()),
                    count if count < 0 => {
                        return Err(Error::Decode(format!("Invalid share count {}", count)))
                    }
                    count if self.combine_private_and_common => {
                        let mut shares = Vec::new();
                        for _ in 0..count {
                            let published = get_published(&mut buf)?;
                            shares.push(self.scheme.extract_share(&published)?);
                        }
                        Some(shares)
                    }
                    count => {
                        let mut private = private.ok_or_else(|| {
                            Error::Decode("Split request without private data".into())
                        })?;
                        let shares = self.read_split_shares(count as usize, &mut buf, &mut private)?;
                        Some(shares)
                    }
                };
                Request {
                    kind,
                    plain_data,
                    shares,
                }
            }
            MessageType::Application => {
                let plain_data = get_block(&mut buf)?
                    .ok_or_else(|| Error::Decode("Application request without payload".into()))?;
                Request::application(plain_data)
            }
            MessageType::Reconfiguration => {
                let plain_data = buf.to_vec();
                buf.advance(buf.remaining());
                Request::reconfiguration(plain_data)
            }
        };
        if buf.has_remaining() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after request",
                buf.remaining()
            )));
        }
        Ok(request)
    }

    fn read_split_shares(
        &self,
        count: usize,
        common: &mut &[u8],
        private: &mut &[u8],
    ) -> Result<Vec<VerifiableShare>> {
        let process_id = self.scheme.process_id();
        let shareholder = self.scheme.my_shareholder_id()?;
        let linear = self.scheme.is_linear_commitment_scheme();

        let mut shares = Vec::new();
        for _ in 0..count {
            let shared_data = get_block(common)?;
            let encrypted = get_block(private)?
                .ok_or_else(|| Error::Decode("Missing sealed share".into()))?;
            let commitment = if linear {
                get_commitment(common)?
            } else {
                let root = get_block(common)?
                    .ok_or_else(|| Error::Decode("Missing commitment root".into()))?;
                let witness = get_block(private)?
                    .ok_or_else(|| Error::Decode("Missing commitment witness".into()))?;
                Commitment::Merkle {
                    root,
                    witnesses: BTreeMap::from([(shareholder.0, witness)]),
                }
            };
            let published = EncryptedPublishedShares {
                encrypted_shares: BTreeMap::from([(process_id, encrypted)]),
                commitment,
                shared_data,
            };
            shares.push(self.scheme.extract_share(&published)?);
        }
        Ok(shares)
    }
}

fn to_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::Serialization(format!("Block of {} bytes too long", len)))
}

fn put_block(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(ABSENT),
    }
}

fn put_commitment(buf: &mut BytesMut, commitment: &Commitment) -> Result<()> {
    match commitment {
        Commitment::Feldman(points) => {
            buf.put_u8(FELDMAN_TAG);
            buf.put_i32(to_len(points.len())?);
            for point in points {
                put_block(buf, Some(point));
            }
        }
        Commitment::Merkle { root, witnesses } => {
            buf.put_u8(MERKLE_TAG);
            put_block(buf, Some(root));
            buf.put_i32(to_len(witnesses.len())?);
            for (shareholder, witness) in witnesses {
                buf.put_u64(*shareholder);
                put_block(buf, Some(witness));
            }
        }
    }
    Ok(())
}

fn put_published(buf: &mut BytesMut, published: &EncryptedPublishedShares) -> Result<()> {
    buf.put_i32(to_len(published.encrypted_shares.len())?);
    for (process_id, encrypted) in &published.encrypted_shares {
        buf.put_u32(*process_id);
        put_block(buf, Some(encrypted));
    }
    put_commitment(buf, &published.commitment)?;
    put_block(buf, published.shared_data.as_deref());
    Ok(())
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Decode(format!(
            "Truncated input: needed {} bytes, {} left",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut impl Buf) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn get_count(buf: &mut impl Buf) -> Result<usize> {
    let count = get_i32(buf)?;
    usize::try_from(count).map_err(|_| Error::Decode(format!("Invalid count {}", count)))
}

fn get_block(buf: &mut impl Buf) -> Result<Option<Vec<u8>>> {
    match get_i32(buf)? {
        ABSENT => Ok(None),
        len if len < 0 => Err(Error::Decode(format!("Invalid block length {}", len))),
        len => {
            ensure(buf, len as usize)?;
            Ok(Some(buf.copy_to_bytes(len as usize).to_vec()))
        }
    }
}

fn get_present_block(buf: &mut impl Buf, what: &str) -> Result<Vec<u8>> {
    get_block(buf)?.ok_or_else(|| Error::Decode(format!("Missing {}", what)))
}

fn get_commitment(buf: &mut impl Buf) -> Result<Commitment> {
    match get_u8(buf)? {
        FELDMAN_TAG => {
            let count = get_count(buf)?;
            let points = (0..count)
                .map(|_| get_present_block(buf, "commitment point"))
                .collect::<Result<Vec<_>>>()?;
            Ok(Commitment::Feldman(points))
        }
        MERKLE_TAG => {
            let root = get_present_block(buf, "commitment root")?;
            let count = get_count(buf)?;
            let mut witnesses = BTreeMap::new();
            for _ in 0..count {
                ensure(buf, 8)?;
                let shareholder = buf.get_u64();
                witnesses.insert(shareholder, get_present_block(buf, "commitment witness")?);
            }
            Ok(Commitment::Merkle { root, witnesses })
        }
        tag => Err(Error::UnknownTag {
            kind: "commitment",
            tag,
        }),
    }
}

fn get_published(buf: &mut impl Buf) -> Result<EncryptedPublishedShares> {
    let count = get_count(buf)?;
    let mut encrypted_shares = BTreeMap::new();
    for _ in 0..count {
        ensure(buf, 4)?;
        let process_id = buf.get_u32();
        encrypted_shares.insert(process_id, get_present_block(buf, "sealed share")?);
    }
    let commitment = get_commitment(buf)?;
    let shared_data = get_block(buf)?;
    Ok(EncryptedPublishedShares {
        encrypted_shares,
        commitment,
        shared_data,
    })
}
