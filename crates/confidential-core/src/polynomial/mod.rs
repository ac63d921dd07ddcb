//! Distributed creation of refresh polynomials
//!
//! Replicas jointly build random polynomials of degree `f` that satisfy a
//! constraint fixed by the [`CreationReason`]:
//!
//! - RESHARING: `r(0) = 0`, so adding `r` to every share keeps the secret and
//!   invalidates all previously issued shares.
//! - RECOVERY: `r(x_t) = 0` at every target shareholder, so points of `r` can
//!   blind the values sent to rebuild the targets' shares.
//!
//! Every participant proposes a polynomial, the leader picks `f + 1` valid
//! proposals and orders their digests, and every participant sums its points
//! of the selected proposals.

mod creator;
mod distributed;
mod factory;
mod messages;

pub use creator::{
    CreationConstraint, CreatorCore, PolynomialCreator, Recovery, RecoveryPolynomialCreator,
    Resharing, ResharingPolynomialCreator,
};
pub use distributed::{DistributedPolynomial, PolynomialCreationListener};
pub use factory::{creator_builder, CreatorBuilder, PolynomialCreatorRegistry};
pub use messages::{PolynomialProposal, ProposalDigest, ProposalSetMessage};

use crate::types::{ProcessId, ShareholderId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Why a polynomial is being created. The discriminants are the wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CreationReason {
    Recovery = 0,
    Resharing = 1,
}

impl CreationReason {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CreationReason {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Recovery),
            1 => Ok(Self::Resharing),
            tag => Err(Error::UnknownTag {
                kind: "creation reason",
                tag,
            }),
        }
    }
}

/// Parameters of one polynomial creation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolynomialCreationContext {
    /// Identifies the run at every participant
    pub id: u64,
    pub reason: CreationReason,
    /// Number of polynomials created together
    pub n_polynomials: usize,
    /// Fault threshold, also the degree of the polynomials
    pub f: usize,
    pub leader: ProcessId,
    /// Sorted, without duplicates
    pub participants: Vec<ProcessId>,
    /// Shareholders being recovered
    pub targets: Vec<ShareholderId>,
}

impl PolynomialCreationContext {
    /// A single-polynomial run led by the lowest participant
    pub fn new(
        id: u64,
        reason: CreationReason,
        f: usize,
        participants: impl IntoIterator<Item = ProcessId>,
    ) -> Self {
        let mut participants: Vec<ProcessId> = participants.into_iter().collect();
        participants.sort_unstable();
        participants.dedup();
        Self {
            id,
            reason,
            n_polynomials: 1,
            f,
            leader: participants.first().copied().unwrap_or_default(),
            participants,
            targets: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: Vec<ShareholderId>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_polynomials(mut self, n_polynomials: usize) -> Self {
        self.n_polynomials = n_polynomials;
        self
    }

    pub fn is_participant(&self, process_id: ProcessId) -> bool {
        self.participants.binary_search(&process_id).is_ok()
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants.len() < 2 * self.f + 1 {
            return Err(Error::ThresholdNotMet {
                required: 2 * self.f + 1,
                actual: self.participants.len(),
            });
        }
        if !self.is_participant(self.leader) {
            return Err(Error::InvalidConfig(format!(
                "Leader {} is not a participant",
                self.leader
            )));
        }
        if self.n_polynomials == 0 {
            return Err(Error::InvalidConfig("No polynomials requested".into()));
        }
        match self.reason {
            CreationReason::Recovery if self.targets.is_empty() => Err(Error::InvalidConfig(
                "Recovery without target shareholders".into(),
            )),
            CreationReason::Recovery if self.targets.len() > self.f => {
                Err(Error::InvalidConfig(format!(
                    "Cannot recover {} shareholders with threshold {}",
                    self.targets.len(),
                    self.f
                )))
            }
            CreationReason::Resharing if !self.targets.is_empty() => Err(Error::InvalidConfig(
                "Resharing does not take target shareholders".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_tags() {
        assert_eq!(CreationReason::Recovery.tag(), 0);
        assert_eq!(CreationReason::try_from(1).unwrap(), CreationReason::Resharing);
        assert!(matches!(
            CreationReason::try_from(2),
            Err(Error::UnknownTag { tag: 2, .. })
        ));
    }

    #[test]
    fn test_context_validation() {
        let context = PolynomialCreationContext::new(1, CreationReason::Resharing, 1, [3, 0, 2, 1, 2]);
        assert_eq!(context.participants, vec![0, 1, 2, 3]);
        assert_eq!(context.leader, 0);
        assert!(context.validate().is_ok());

        let small = PolynomialCreationContext::new(1, CreationReason::Resharing, 1, [0, 1]);
        assert!(matches!(
            small.validate(),
            Err(Error::ThresholdNotMet { required: 3, actual: 2 })
        ));

        let recovery = PolynomialCreationContext::new(2, CreationReason::Recovery, 1, [0, 1, 2, 3]);
        assert!(recovery.validate().is_err());
        assert!(recovery
            .clone()
            .with_targets(vec![ShareholderId(4)])
            .validate()
            .is_ok());
        assert!(recovery
            .with_targets(vec![ShareholderId(3), ShareholderId(4)])
            .validate()
            .is_err());
    }
}
