//! Per-process confidentiality scheme

use super::commitment::{Commitment, CommitmentScheme};
use super::encryption::{self, KeyPair};
use super::polynomial::{interpolate, Polynomial};
use crate::types::{ProcessId, Share, ShareholderId, VerifiableShare};
use crate::{Error, Result};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, Field},
    Scalar,
};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, instrument};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

/// Longest secret that fits into a single scalar
pub const SMALL_SECRET_MAX: usize = 30;

const LARGE_SECRET_CONTEXT: &str = "confidential-core 2024 large secret key";
const ENCODED_SHARE_LEN: usize = 8 + 32;

/// How a combined scalar maps back to secret bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The secret is embedded in the scalar
    SmallSecret,
    /// The scalar derives a key for the ciphertext carried as shared data
    LargeSecret,
}

impl Mode {
    pub fn for_shared_data(shared_data: Option<&[u8]>) -> Self {
        match shared_data {
            Some(_) => Mode::LargeSecret,
            None => Mode::SmallSecret,
        }
    }
}

/// Output of dealing a secret: one share per registered shareholder
#[derive(Debug, Clone)]
pub struct PublishedShares {
    pub shares: BTreeMap<ShareholderId, Share>,
    pub commitment: Commitment,
    pub shared_data: Option<Vec<u8>>,
}

impl PublishedShares {
    pub fn verifiable_share(&self, shareholder: ShareholderId) -> Option<VerifiableShare> {
        self.shares.get(&shareholder).map(|share| VerifiableShare {
            share: share.clone(),
            commitment: self.commitment.for_shareholder(shareholder),
            shared_data: self.shared_data.clone(),
        })
    }
}

/// Published shares with every share sealed for the process that holds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPublishedShares {
    pub encrypted_shares: BTreeMap<ProcessId, Vec<u8>>,
    pub commitment: Commitment,
    pub shared_data: Option<Vec<u8>>,
}

/// Decrypted shares gathered from a quorum, ready to be combined
#[derive(Debug, Clone)]
pub struct OpenPublishedShares {
    pub shares: Vec<Share>,
    pub commitment: Commitment,
    pub shared_data: Option<Vec<u8>>,
}

fn encode_share(share: &Share) -> [u8; ENCODED_SHARE_LEN] {
    let mut out = [0u8; ENCODED_SHARE_LEN];
    out[..8].copy_from_slice(&share.shareholder.0.to_be_bytes());
    out[8..].copy_from_slice(&share.value.to_bytes());
    out
}

fn decode_share(bytes: &[u8]) -> Result<Share> {
    if bytes.len() != ENCODED_SHARE_LEN {
        return Err(Error::Crypto(format!(
            "Decrypted share has {} bytes, expected {}",
            bytes.len(),
            ENCODED_SHARE_LEN
        )));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[..8]);
    let mut value = [0u8; 32];
    value.copy_from_slice(&bytes[8..]);
    Ok(Share::new(
        ShareholderId(u64::from_be_bytes(id)),
        <Scalar as Reduce<U256>>::reduce_bytes(&value.into()),
    ))
}

fn small_secret_to_scalar(secret: &[u8]) -> Scalar {
    // leading zero byte keeps the value below the group order
    let mut bytes = [0u8; 32];
    bytes[1] = secret.len() as u8;
    bytes[2..2 + secret.len()].copy_from_slice(secret);
    <Scalar as Reduce<U256>>::reduce_bytes(&bytes.into())
}

fn scalar_to_small_secret(scalar: &Scalar) -> Result<Vec<u8>> {
    let bytes = scalar.to_bytes();
    let len = bytes[1] as usize;
    if bytes[0] != 0 || len > SMALL_SECRET_MAX {
        return Err(Error::Crypto("Combined value is not a small secret".into()));
    }
    Ok(bytes[2..2 + len].to_vec())
}

fn large_secret_key(scalar: &Scalar) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3::derive_key(LARGE_SECRET_CONTEXT, &scalar.to_bytes()))
}

/// The sole authority for encrypting, decrypting and combining shares in a process.
///
/// Encrypt, decrypt and combine only take read access to the key and
/// shareholder tables; registering a process or shareholder is exclusive.
pub struct ConfidentialityScheme {
    process_id: ProcessId,
    keys: KeyPair,
    threshold: AtomicUsize,
    commitment_scheme: Arc<dyn CommitmentScheme>,
    keyring: RwLock<HashMap<ProcessId, PublicKey>>,
    shareholders: RwLock<BTreeMap<ProcessId, ShareholderId>>,
}

impl ConfidentialityScheme {
    pub fn new(
        process_id: ProcessId,
        keys: KeyPair,
        threshold: usize,
        commitment_scheme: Arc<dyn CommitmentScheme>,
    ) -> Self {
        let mut keyring = HashMap::new();
        keyring.insert(process_id, keys.public());
        Self {
            process_id,
            keys,
            threshold: AtomicUsize::new(threshold),
            commitment_scheme,
            keyring: RwLock::new(keyring),
            shareholders: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public()
    }

    /// Maximum number of faulty shareholders tolerated
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub fn set_threshold(&self, threshold: usize) {
        info!(threshold, "Updating fault threshold");
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    pub fn commitment_scheme(&self) -> &Arc<dyn CommitmentScheme> {
        &self.commitment_scheme
    }

    pub fn is_linear_commitment_scheme(&self) -> bool {
        self.commitment_scheme.is_linear()
    }

    /// Record the public key of a process so shares can be sealed for it
    pub fn register_process(&self, process_id: ProcessId, public_key: PublicKey) {
        self.keyring
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(process_id, public_key);
    }

    /// Register `process_id` as holder of the shares at `shareholder`
    pub fn add_shareholder(&self, process_id: ProcessId, shareholder: ShareholderId) -> Result<()> {
        if shareholder.0 == 0 {
            return Err(Error::InvalidConfig("Shareholder id 0 is reserved".into()));
        }
        let mut table = self
            .shareholders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((owner, _)) = table
            .iter()
            .find(|(owner, id)| **id == shareholder && **owner != process_id)
        {
            return Err(Error::InvalidConfig(format!(
                "Shareholder {} already held by process {}",
                shareholder, owner
            )));
        }
        debug!(process_id, shareholder = shareholder.0, "Registered shareholder");
        table.insert(process_id, shareholder);
        Ok(())
    }

    /// Forget a process that left the group
    pub fn remove_shareholder(&self, process_id: ProcessId) -> Option<ShareholderId> {
        let removed = self
            .shareholders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&process_id);
        if let Some(shareholder) = removed {
            debug!(process_id, shareholder = shareholder.0, "Removed shareholder");
        }
        removed
    }

    pub fn shareholder_of(&self, process_id: ProcessId) -> Option<ShareholderId> {
        self.shareholders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&process_id)
            .copied()
    }

    pub fn my_shareholder_id(&self) -> Result<ShareholderId> {
        self.shareholder_of(self.process_id)
            .ok_or(Error::UnknownProcess(self.process_id))
    }

    /// Current shareholders, ordered by process id
    pub fn shareholders(&self) -> BTreeMap<ProcessId, ShareholderId> {
        self.shareholders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deal `secret` among every registered shareholder
    #[instrument(skip(self, secret, rng), fields(len = secret.len()))]
    pub fn share(&self, secret: &[u8], rng: &mut dyn RngCore) -> Result<PublishedShares> {
        let holders = self.shareholders();
        let threshold = self.threshold();
        if holders.len() <= threshold {
            return Err(Error::ThresholdNotMet {
                required: threshold + 1,
                actual: holders.len(),
            });
        }

        let (constant, shared_data) = if secret.len() <= SMALL_SECRET_MAX {
            (small_secret_to_scalar(secret), None)
        } else {
            let key_scalar = Scalar::random(&mut *rng);
            let ciphertext = encryption::encrypt_with_key(&large_secret_key(&key_scalar), secret)?;
            (key_scalar, Some(ciphertext))
        };

        let polynomial = Polynomial::random(threshold, constant, rng);
        let shares: Vec<Share> = holders
            .values()
            .map(|shareholder| polynomial.share_for(*shareholder))
            .collect();
        let commitment = self.commitment_scheme.commit(&polynomial, &shares, rng);

        Ok(PublishedShares {
            shares: shares.into_iter().map(|s| (s.shareholder, s)).collect(),
            commitment,
            shared_data,
        })
    }

    /// Seal every share for the process holding it
    pub fn encrypt_published(&self, published: &PublishedShares) -> Result<EncryptedPublishedShares> {
        let mut encrypted_shares = BTreeMap::new();
        for (process_id, shareholder) in self.shareholders() {
            let share = published
                .shares
                .get(&shareholder)
                .ok_or_else(|| Error::Crypto(format!("No share for shareholder {}", shareholder)))?;
            encrypted_shares.insert(process_id, self.encrypt_share_for(process_id, share)?);
        }
        Ok(EncryptedPublishedShares {
            encrypted_shares,
            commitment: published.commitment.clone(),
            shared_data: published.shared_data.clone(),
        })
    }

    /// Seal `share` for `recipient`
    pub fn encrypt_share_for(&self, recipient: ProcessId, share: &Share) -> Result<Vec<u8>> {
        let public_key = self
            .keyring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&recipient)
            .copied()
            .ok_or(Error::UnknownProcess(recipient))?;
        encryption::seal(&public_key, &encode_share(share))
    }

    /// Open a share sealed for `recipient`, which must be this process
    pub fn decrypt_share_for(&self, recipient: ProcessId, encrypted: &[u8]) -> Result<Share> {
        if recipient != self.process_id {
            return Err(Error::Crypto(format!(
                "Process {} cannot open shares sealed for {}",
                self.process_id, recipient
            )));
        }
        let plaintext = Zeroizing::new(encryption::open(&self.keys, encrypted)?);
        decode_share(&plaintext)
    }

    /// Recover this process's share from a bundle of sealed shares
    pub fn extract_share(&self, published: &EncryptedPublishedShares) -> Result<VerifiableShare> {
        let me = self.my_shareholder_id()?;
        let encrypted = published
            .encrypted_shares
            .get(&self.process_id)
            .ok_or_else(|| Error::Crypto(format!("No share sealed for process {}", self.process_id)))?;
        let share = self.decrypt_share_for(self.process_id, encrypted)?;
        if share.shareholder != me {
            return Err(Error::VerificationFailed(format!(
                "Share addressed to shareholder {}, expected {}",
                share.shareholder, me
            )));
        }
        Ok(VerifiableShare {
            share,
            commitment: published.commitment.for_shareholder(me),
            shared_data: published.shared_data.clone(),
        })
    }

    /// Reconstruct the secret from at least `threshold + 1` valid shares
    pub fn combine(&self, open: &OpenPublishedShares, mode: Mode) -> Result<Vec<u8>> {
        let threshold = self.threshold();
        let mut valid: Vec<Share> = open
            .shares
            .iter()
            .filter(|share| self.commitment_scheme.check_validity(share, &open.commitment))
            .cloned()
            .collect();
        valid.sort_by_key(|s| s.shareholder);
        valid.dedup_by_key(|s| s.shareholder);
        if valid.len() <= threshold {
            return Err(Error::ThresholdNotMet {
                required: threshold + 1,
                actual: valid.len(),
            });
        }
        valid.truncate(threshold + 1);

        let scalar = interpolate(&valid, &Scalar::ZERO)?;
        match mode {
            Mode::SmallSecret => scalar_to_small_secret(&scalar),
            Mode::LargeSecret => {
                let shared_data = open
                    .shared_data
                    .as_deref()
                    .ok_or_else(|| Error::Crypto("Large secret without shared data".into()))?;
                encryption::decrypt_with_key(&large_secret_key(&scalar), shared_data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Cluster;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn open_for(cluster: &Cluster, published: &EncryptedPublishedShares, replicas: &[usize]) -> OpenPublishedShares {
        let shares = replicas
            .iter()
            .map(|i| cluster.replicas[*i].extract_share(published).unwrap().share)
            .collect();
        OpenPublishedShares {
            shares,
            commitment: published.commitment.clone(),
            shared_data: published.shared_data.clone(),
        }
    }

    #[test]
    fn test_small_secret_roundtrip() {
        let cluster = Cluster::new(1);
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let published = cluster.client.share(b"secret", &mut rng).unwrap();
        let encrypted = cluster.client.encrypt_published(&published).unwrap();
        assert!(encrypted.shared_data.is_none());

        let open = open_for(&cluster, &encrypted, &[0, 2]);
        let secret = cluster.client.combine(&open, Mode::SmallSecret).unwrap();
        assert_eq!(secret, b"secret");

        let too_few = open_for(&cluster, &encrypted, &[1]);
        assert!(matches!(
            cluster.client.combine(&too_few, Mode::SmallSecret),
            Err(Error::ThresholdNotMet { required: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_large_secret_roundtrip() {
        let cluster = Cluster::new(1);
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let secret = vec![7u8; 200];
        let published = cluster.client.share(&secret, &mut rng).unwrap();
        let encrypted = cluster.client.encrypt_published(&published).unwrap();
        let mode = Mode::for_shared_data(encrypted.shared_data.as_deref());
        assert_eq!(mode, Mode::LargeSecret);

        let open = open_for(&cluster, &encrypted, &[1, 2, 3]);
        assert_eq!(cluster.client.combine(&open, mode).unwrap(), secret);
    }

    #[test]
    fn test_shares_are_only_readable_by_their_holder() {
        let cluster = Cluster::new(1);
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let published = cluster.client.share(b"x", &mut rng).unwrap();
        let encrypted = cluster.client.encrypt_published(&published).unwrap();

        let for_replica_0 = &encrypted.encrypted_shares[&0];
        assert!(cluster.replicas[1].decrypt_share_for(0, for_replica_0).is_err());
        assert!(cluster.replicas[1].decrypt_share_for(1, for_replica_0).is_err());
    }

    #[test]
    fn test_add_shareholder_rejects_conflicts() {
        let cluster = Cluster::new(1);
        let scheme = &cluster.replicas[0];
        assert!(scheme.add_shareholder(9, ShareholderId(1)).is_err());
        assert!(scheme.add_shareholder(9, ShareholderId(0)).is_err());
        scheme.add_shareholder(9, ShareholderId(10)).unwrap();
        assert_eq!(scheme.shareholder_of(9), Some(ShareholderId(10)));
        assert_eq!(scheme.remove_shareholder(9), Some(ShareholderId(10)));
        assert_eq!(scheme.shareholder_of(9), None);
    }
}
