//! Verifiable secret sharing and share transport
//!
//! The confidentiality scheme is the only component allowed to seal, open or
//! combine shares. It is shared by every thread of a process.

pub mod commitment;
pub mod encryption;
pub mod polynomial;
mod scheme;

pub use commitment::{
    Commitment, CommitmentScheme, CommitmentSchemeKind, FeldmanCommitmentScheme,
    MerkleCommitmentScheme,
};
pub use encryption::KeyPair;
pub use polynomial::Polynomial;
pub use scheme::{
    ConfidentialityScheme, EncryptedPublishedShares, Mode, OpenPublishedShares, PublishedShares,
    SMALL_SECRET_MAX,
};
