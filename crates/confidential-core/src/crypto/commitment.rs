//! Commitment schemes binding shares to their sharing polynomial

use super::polynomial::Polynomial;
use crate::types::{Share, ShareholderId};
use crate::{Error, Result};
use dashmap::DashMap;
use k256::{
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    AffinePoint, ProjectivePoint, Scalar,
};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const MERKLE_NONCE_LEN: usize = 32;
const MAX_PRECOMPUTED: usize = 1024;

/// Commitment to a sharing polynomial
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Commitment {
    /// Compressed points `g^{a_k}`, one per coefficient
    Feldman(Vec<Vec<u8>>),
    /// Root over per-shareholder leaves, with the witnesses known locally,
    /// keyed by shareholder id
    Merkle {
        root: Vec<u8>,
        witnesses: BTreeMap<u64, Vec<u8>>,
    },
}

impl Commitment {
    /// Bytes identical at every holder of the same commitment
    pub fn consensus_bytes(&self) -> Vec<u8> {
        match self {
            Commitment::Feldman(points) => {
                let mut bytes = vec![0u8];
                for point in points {
                    bytes.extend_from_slice(&(point.len() as u32).to_be_bytes());
                    bytes.extend_from_slice(point);
                }
                bytes
            }
            Commitment::Merkle { root, .. } => {
                let mut bytes = vec![1u8];
                bytes.extend_from_slice(root);
                bytes
            }
        }
    }

    /// The part of this commitment a single shareholder needs
    pub fn for_shareholder(&self, shareholder: ShareholderId) -> Commitment {
        match self {
            Commitment::Feldman(_) => self.clone(),
            Commitment::Merkle { root, witnesses } => Commitment::Merkle {
                root: root.clone(),
                witnesses: witnesses
                    .get(&shareholder.0)
                    .map(|w| BTreeMap::from([(shareholder.0, w.clone())]))
                    .unwrap_or_default(),
            },
        }
    }
}

/// Selected commitment scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentSchemeKind {
    #[default]
    Feldman,
    Merkle,
}

impl CommitmentSchemeKind {
    pub fn build(self) -> Arc<dyn CommitmentScheme> {
        match self {
            CommitmentSchemeKind::Feldman => Arc::new(FeldmanCommitmentScheme::new()),
            CommitmentSchemeKind::Merkle => Arc::new(MerkleCommitmentScheme),
        }
    }
}

/// Commitment scheme used by a confidentiality scheme
pub trait CommitmentScheme: Send + Sync {
    /// Whether commitments are homomorphic and carry no per-shareholder witness
    fn is_linear(&self) -> bool;

    /// Commit to `polynomial`, whose evaluations are `shares`
    fn commit(&self, polynomial: &Polynomial, shares: &[Share], rng: &mut dyn RngCore) -> Commitment;

    /// Check a share, reusing cached decoding of the commitment
    fn check_validity(&self, share: &Share, commitment: &Commitment) -> bool;

    /// One-shot check that never touches or fills any cache
    fn check_validity_without_precomputation(&self, share: &Share, commitment: &Commitment) -> bool;

    /// Merge the commitments reported by several shareholders into one.
    ///
    /// The result does not depend on the order of the input.
    fn combine_commitments(&self, commitments: &BTreeMap<ShareholderId, Commitment>) -> Result<Commitment>;
}

/// Pick the most frequent commitment, breaking ties by the smallest consensus bytes
fn majority(commitments: &BTreeMap<ShareholderId, Commitment>) -> Result<Vec<u8>> {
    let mut counts: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
    for commitment in commitments.values() {
        *counts.entry(commitment.consensus_bytes()).or_default() += 1;
    }
    let best = counts.values().copied().max().unwrap_or(0);
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(bytes, _)| bytes)
        .ok_or_else(|| Error::Crypto("No commitments to combine".into()))
}

/// Decode compressed Feldman points
pub fn decode_points(points: &[Vec<u8>]) -> Result<Vec<ProjectivePoint>> {
    points
        .iter()
        .map(|bytes| {
            let encoded = k256::EncodedPoint::from_bytes(bytes)
                .map_err(|e| Error::VerificationFailed(e.to_string()))?;
            let affine_opt = AffinePoint::from_encoded_point(&encoded);
            let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
                .ok_or_else(|| Error::VerificationFailed("Invalid commitment point".into()))?;
            Ok(ProjectivePoint::from(affine))
        })
        .collect()
}

pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// `Σ C_k x^k`, the commitment to the polynomial's value at `x`
pub fn evaluate_points(points: &[ProjectivePoint], x: &Scalar) -> ProjectivePoint {
    let mut result = ProjectivePoint::IDENTITY;
    for point in points.iter().rev() {
        result = result * x + point;
    }
    result
}

/// Coefficient-wise sum of Feldman commitments of equal degree
pub fn sum_points(commitments: &[Vec<ProjectivePoint>]) -> Result<Vec<ProjectivePoint>> {
    let first = commitments
        .first()
        .ok_or_else(|| Error::Crypto("No commitments to sum".into()))?;
    let mut sum = vec![ProjectivePoint::IDENTITY; first.len()];
    for points in commitments {
        if points.len() != sum.len() {
            return Err(Error::VerificationFailed("Commitment degree mismatch".into()));
        }
        for (acc, point) in sum.iter_mut().zip(points) {
            *acc += point;
        }
    }
    Ok(sum)
}

fn feldman_verify(points: &[ProjectivePoint], share: &Share) -> bool {
    let expected = ProjectivePoint::GENERATOR * share.value;
    let actual = evaluate_points(points, &share.shareholder.to_scalar());
    expected == actual
}

/// Linear commitments over secp256k1
pub struct FeldmanCommitmentScheme {
    precomputed: DashMap<[u8; 32], Arc<Vec<ProjectivePoint>>>,
}

impl FeldmanCommitmentScheme {
    pub fn new() -> Self {
        Self {
            precomputed: DashMap::new(),
        }
    }
}

impl Default for FeldmanCommitmentScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitmentScheme for FeldmanCommitmentScheme {
    fn is_linear(&self) -> bool {
        true
    }

    fn commit(&self, polynomial: &Polynomial, _shares: &[Share], _rng: &mut dyn RngCore) -> Commitment {
        Commitment::Feldman(polynomial.commitments())
    }

    fn check_validity(&self, share: &Share, commitment: &Commitment) -> bool {
        let Commitment::Feldman(points) = commitment else {
            return false;
        };
        let key = *blake3::hash(&commitment.consensus_bytes()).as_bytes();
        let cached = self.precomputed.get(&key).map(|entry| entry.value().clone());
        let decoded = match cached {
            Some(decoded) => decoded,
            None => {
                let Ok(decoded) = decode_points(points) else {
                    return false;
                };
                let decoded = Arc::new(decoded);
                if self.precomputed.len() >= MAX_PRECOMPUTED {
                    self.precomputed.clear();
                }
                self.precomputed.insert(key, decoded.clone());
                decoded
            }
        };
        feldman_verify(&decoded, share)
    }

    fn check_validity_without_precomputation(&self, share: &Share, commitment: &Commitment) -> bool {
        let Commitment::Feldman(points) = commitment else {
            return false;
        };
        match decode_points(points) {
            Ok(decoded) => feldman_verify(&decoded, share),
            Err(_) => false,
        }
    }

    fn combine_commitments(&self, commitments: &BTreeMap<ShareholderId, Commitment>) -> Result<Commitment> {
        let chosen = majority(commitments)?;
        commitments
            .values()
            .find(|c| matches!(c, Commitment::Feldman(_)) && c.consensus_bytes() == chosen)
            .cloned()
            .ok_or_else(|| Error::Crypto("Expected Feldman commitments".into()))
    }
}

/// Hash-tree commitments: a constant-size root plus a per-shareholder witness
pub struct MerkleCommitmentScheme;

fn merkle_leaf(share: &Share, nonce: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"leaf");
    hasher.update(&share.shareholder.0.to_be_bytes());
    hasher.update(&share.value.to_bytes());
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

fn merkle_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"node");
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

fn merkle_levels(leaves: Vec<[u8; 32]>) -> Vec<Vec<[u8; 32]>> {
    let mut levels = vec![leaves];
    while levels.last().map_or(0, Vec::len) > 1 {
        let current = levels.last().map(Vec::as_slice).unwrap_or_default();
        let next = current
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => merkle_node(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
        levels.push(next);
    }
    levels
}

fn merkle_verify(share: &Share, root: &[u8], witness: &[u8]) -> bool {
    if witness.len() < MERKLE_NONCE_LEN + 8 {
        return false;
    }
    let (nonce, rest) = witness.split_at(MERKLE_NONCE_LEN);
    let mut index = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let mut width = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    let path = &rest[8..];
    if path.len() % 32 != 0 || index >= width {
        return false;
    }
    let mut siblings = path.chunks_exact(32).map(|chunk| {
        let mut sibling = [0u8; 32];
        sibling.copy_from_slice(chunk);
        sibling
    });

    let mut hash = merkle_leaf(share, nonce);
    while width > 1 {
        if index % 2 == 1 {
            let Some(sibling) = siblings.next() else {
                return false;
            };
            hash = merkle_node(&sibling, &hash);
        } else if index + 1 < width {
            let Some(sibling) = siblings.next() else {
                return false;
            };
            hash = merkle_node(&hash, &sibling);
        }
        index /= 2;
        width = width.div_ceil(2);
    }
    siblings.next().is_none() && hash.as_slice() == root
}

impl CommitmentScheme for MerkleCommitmentScheme {
    fn is_linear(&self) -> bool {
        false
    }

    fn commit(&self, _polynomial: &Polynomial, shares: &[Share], rng: &mut dyn RngCore) -> Commitment {
        let mut ordered: Vec<&Share> = shares.iter().collect();
        ordered.sort_by_key(|s| s.shareholder);

        let nonces: Vec<[u8; MERKLE_NONCE_LEN]> = ordered
            .iter()
            .map(|_| {
                let mut nonce = [0u8; MERKLE_NONCE_LEN];
                rng.fill_bytes(&mut nonce);
                nonce
            })
            .collect();
        let leaves = ordered
            .iter()
            .zip(&nonces)
            .map(|(share, nonce)| merkle_leaf(share, nonce))
            .collect();
        let levels = merkle_levels(leaves);
        let root = levels
            .last()
            .and_then(|level| level.first())
            .map(|r| r.to_vec())
            .unwrap_or_default();

        let width = ordered.len() as u32;
        let mut witnesses = BTreeMap::new();
        for (position, (share, nonce)) in ordered.iter().zip(&nonces).enumerate() {
            let mut witness = nonce.to_vec();
            witness.extend_from_slice(&(position as u32).to_be_bytes());
            witness.extend_from_slice(&width.to_be_bytes());
            let mut index = position;
            for level in &levels[..levels.len() - 1] {
                let sibling = index ^ 1;
                if sibling < level.len() {
                    witness.extend_from_slice(&level[sibling]);
                }
                index /= 2;
            }
            witnesses.insert(share.shareholder.0, witness);
        }

        Commitment::Merkle { root, witnesses }
    }

    fn check_validity(&self, share: &Share, commitment: &Commitment) -> bool {
        self.check_validity_without_precomputation(share, commitment)
    }

    fn check_validity_without_precomputation(&self, share: &Share, commitment: &Commitment) -> bool {
        let Commitment::Merkle { root, witnesses } = commitment else {
            return false;
        };
        witnesses
            .get(&share.shareholder.0)
            .is_some_and(|witness| merkle_verify(share, root, witness))
    }

    fn combine_commitments(&self, commitments: &BTreeMap<ShareholderId, Commitment>) -> Result<Commitment> {
        let chosen = majority(commitments)?;
        let mut combined_root = None;
        let mut combined = BTreeMap::new();
        for commitment in commitments.values() {
            if let Commitment::Merkle { root, witnesses } = commitment {
                if commitment.consensus_bytes() == chosen {
                    combined_root = Some(root.clone());
                    combined.extend(witnesses.iter().map(|(k, v)| (*k, v.clone())));
                }
            }
        }
        let root = combined_root.ok_or_else(|| Error::Crypto("Expected Merkle commitments".into()))?;
        Ok(Commitment::Merkle {
            root,
            witnesses: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn sharing(n: u64, rng: &mut ChaCha20Rng) -> (Polynomial, Vec<Share>) {
        let poly = Polynomial::random(1, Scalar::from(99u64), rng);
        let shares = (1..=n).map(|i| poly.share_for(ShareholderId(i))).collect();
        (poly, shares)
    }

    #[test]
    fn test_feldman_validity() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let scheme = FeldmanCommitmentScheme::new();
        let (poly, shares) = sharing(4, &mut rng);
        let commitment = scheme.commit(&poly, &shares, &mut rng);

        for share in &shares {
            assert!(scheme.check_validity(share, &commitment));
            assert!(scheme.check_validity_without_precomputation(share, &commitment));
        }

        let mut forged = shares[0].clone();
        forged.value += Scalar::ONE;
        assert!(!scheme.check_validity(&forged, &commitment));
        assert!(!scheme.check_validity_without_precomputation(&forged, &commitment));
    }

    #[test]
    fn test_merkle_validity_for_every_width() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let scheme = MerkleCommitmentScheme;
        for n in 1..=7 {
            let (poly, shares) = sharing(n, &mut rng);
            let commitment = scheme.commit(&poly, &shares, &mut rng);
            for share in &shares {
                let own = commitment.for_shareholder(share.shareholder);
                assert!(scheme.check_validity(share, &own), "n={n}");
            }
            let mut forged = shares[0].clone();
            forged.value += Scalar::ONE;
            assert!(!scheme.check_validity(&forged, &commitment));
        }
    }

    #[test]
    fn test_combine_is_order_independent() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let scheme = MerkleCommitmentScheme;
        let (poly, shares) = sharing(4, &mut rng);
        let commitment = scheme.commit(&poly, &shares, &mut rng);

        let per_holder: BTreeMap<ShareholderId, Commitment> = shares
            .iter()
            .map(|s| (s.shareholder, commitment.for_shareholder(s.shareholder)))
            .collect();
        let combined = scheme.combine_commitments(&per_holder).unwrap();
        assert_eq!(combined, commitment);

        let feldman = FeldmanCommitmentScheme::new();
        let good = feldman.commit(&poly, &shares, &mut rng);
        let bad = Commitment::Feldman(vec![vec![2u8; 33]]);
        let mixed = BTreeMap::from([
            (ShareholderId(1), bad.clone()),
            (ShareholderId(2), good.clone()),
            (ShareholderId(3), good.clone()),
        ]);
        assert_eq!(feldman.combine_commitments(&mixed).unwrap(), good);
    }
}
