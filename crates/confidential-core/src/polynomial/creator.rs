//! Protocol skeleton shared by the recovery and resharing creators

use super::messages::{PolynomialProposal, ProposalDigest, ProposalSetMessage};
use super::{CreationReason, PolynomialCreationContext};
use crate::crypto::commitment::{decode_points, encode_point, evaluate_points, sum_points};
use crate::crypto::{Commitment, ConfidentialityScheme, Polynomial};
use crate::types::{ProcessId, Share, ShareholderId, VerifiableShare};
use crate::{Error, Result};
use k256::{ProjectivePoint, Scalar};
use rand_core::RngCore;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One creation run as seen by a single participant
pub trait PolynomialCreator: Send {
    fn context(&self) -> &PolynomialCreationContext;

    /// Sample this participant's polynomials and seal their points
    fn create_proposal(&mut self, rng: &mut dyn RngCore) -> Result<PolynomialProposal>;

    /// Record a proposal. The leader gets the proposal set to order once
    /// enough valid proposals arrived.
    fn process_proposal(&mut self, proposal: PolynomialProposal) -> Result<Option<ProposalSetMessage>>;

    /// Pre-ordering check of a proposal set
    fn is_valid_proposal_set(&self, set: &ProposalSetMessage) -> bool;

    /// Accept the ordered proposal set
    fn deliver_proposal_set(&mut self, set: ProposalSetMessage) -> Result<()>;

    /// This participant's point of every created polynomial, once the
    /// proposal set and all selected proposals are known
    fn try_finish(&mut self) -> Result<Option<Vec<VerifiableShare>>>;
}

/// The condition a proposed polynomial must satisfy
pub trait CreationConstraint: Send + 'static {
    const REASON: CreationReason;

    fn sample(context: &PolynomialCreationContext, rng: &mut dyn RngCore) -> Result<Polynomial>;

    /// Check the constraint on Feldman commitments
    fn holds(context: &PolynomialCreationContext, points: &[ProjectivePoint]) -> bool;
}

/// `r(x_t) = 0` at every target shareholder
pub struct Recovery;

impl CreationConstraint for Recovery {
    const REASON: CreationReason = CreationReason::Recovery;

    fn sample(context: &PolynomialCreationContext, rng: &mut dyn RngCore) -> Result<Polynomial> {
        let roots: Vec<Scalar> = context.targets.iter().map(|t| t.to_scalar()).collect();
        Polynomial::random_with_roots(context.f, &roots, rng)
    }

    fn holds(context: &PolynomialCreationContext, points: &[ProjectivePoint]) -> bool {
        context
            .targets
            .iter()
            .all(|target| evaluate_points(points, &target.to_scalar()) == ProjectivePoint::IDENTITY)
    }
}

/// `r(0) = 0`
pub struct Resharing;

impl CreationConstraint for Resharing {
    const REASON: CreationReason = CreationReason::Resharing;

    fn sample(context: &PolynomialCreationContext, rng: &mut dyn RngCore) -> Result<Polynomial> {
        Ok(Polynomial::random(context.f, Scalar::ZERO, rng))
    }

    fn holds(_context: &PolynomialCreationContext, points: &[ProjectivePoint]) -> bool {
        points.first() == Some(&ProjectivePoint::IDENTITY)
    }
}

pub type RecoveryPolynomialCreator = CreatorCore<Recovery>;
pub type ResharingPolynomialCreator = CreatorCore<Resharing>;

struct ValidProposal {
    digest: [u8; 32],
    commitments: Vec<Vec<ProjectivePoint>>,
    points: Vec<Scalar>,
}

pub struct CreatorCore<C> {
    context: PolynomialCreationContext,
    scheme: Arc<ConfidentialityScheme>,
    valid: BTreeMap<ProcessId, ValidProposal>,
    rejected: BTreeSet<ProcessId>,
    set_submitted: bool,
    selected: Option<ProposalSetMessage>,
    finished: bool,
    constraint: PhantomData<C>,
}

impl<C: CreationConstraint> CreatorCore<C> {
    pub fn new(context: PolynomialCreationContext, scheme: Arc<ConfidentialityScheme>) -> Self {
        debug_assert_eq!(context.reason, C::REASON);
        Self {
            context,
            scheme,
            valid: BTreeMap::new(),
            rejected: BTreeSet::new(),
            set_submitted: false,
            selected: None,
            finished: false,
            constraint: PhantomData,
        }
    }

    fn verify(&self, proposal: &PolynomialProposal) -> Result<ValidProposal> {
        let n = self.context.n_polynomials;
        if proposal.commitments.len() != n {
            return Err(Error::VerificationFailed(format!(
                "Expected {} polynomials, got {}",
                n,
                proposal.commitments.len()
            )));
        }

        let process_id = self.scheme.process_id();
        let me = self.scheme.my_shareholder_id()?;
        let sealed = proposal
            .points
            .get(&process_id)
            .filter(|sealed| sealed.len() == n)
            .ok_or_else(|| Error::VerificationFailed("Missing points for this process".into()))?;

        let mut commitments = Vec::with_capacity(n);
        let mut points = Vec::with_capacity(n);
        for (encoded, sealed_point) in proposal.commitments.iter().zip(sealed) {
            let decoded = decode_points(encoded)?;
            if decoded.len() != self.context.f + 1 {
                return Err(Error::VerificationFailed(format!(
                    "Polynomial of degree {}, expected {}",
                    decoded.len().saturating_sub(1),
                    self.context.f
                )));
            }
            if !C::holds(&self.context, &decoded) {
                return Err(Error::VerificationFailed(format!(
                    "{:?} constraint does not hold",
                    C::REASON
                )));
            }
            let share = self.scheme.decrypt_share_for(process_id, sealed_point)?;
            if share.shareholder != me {
                return Err(Error::VerificationFailed("Point addressed to another shareholder".into()));
            }
            if ProjectivePoint::GENERATOR * share.value != evaluate_points(&decoded, &me.to_scalar()) {
                return Err(Error::VerificationFailed("Point does not match commitment".into()));
            }
            commitments.push(decoded);
            points.push(share.value);
        }

        Ok(ValidProposal {
            digest: proposal.digest()?,
            commitments,
            points,
        })
    }

    fn shareholders(&self) -> Result<Vec<(ProcessId, ShareholderId)>> {
        self.context
            .participants
            .iter()
            .map(|pid| {
                self.scheme
                    .shareholder_of(*pid)
                    .map(|shareholder| (*pid, shareholder))
                    .ok_or(Error::UnknownProcess(*pid))
            })
            .collect()
    }
}

impl<C: CreationConstraint> PolynomialCreator for CreatorCore<C> {
    fn context(&self) -> &PolynomialCreationContext {
        &self.context
    }

    fn create_proposal(&mut self, rng: &mut dyn RngCore) -> Result<PolynomialProposal> {
        let holders = self.shareholders()?;
        let mut commitments = Vec::with_capacity(self.context.n_polynomials);
        let mut points: BTreeMap<ProcessId, Vec<Vec<u8>>> = BTreeMap::new();

        for _ in 0..self.context.n_polynomials {
            let polynomial = C::sample(&self.context, &mut *rng)?;
            commitments.push(polynomial.commitments());
            for (process_id, shareholder) in &holders {
                let share = polynomial.share_for(*shareholder);
                points
                    .entry(*process_id)
                    .or_default()
                    .push(self.scheme.encrypt_share_for(*process_id, &share)?);
            }
        }

        Ok(PolynomialProposal {
            creation_id: self.context.id,
            sender: self.scheme.process_id(),
            commitments,
            points,
        })
    }

    fn process_proposal(&mut self, proposal: PolynomialProposal) -> Result<Option<ProposalSetMessage>> {
        let sender = proposal.sender;
        if proposal.creation_id != self.context.id {
            return Err(Error::VerificationFailed(format!(
                "Proposal for run {} delivered to run {}",
                proposal.creation_id, self.context.id
            )));
        }
        if !self.context.is_participant(sender) {
            return Err(Error::VerificationFailed(format!("{} is not a participant", sender)));
        }
        if let Some(known) = self.valid.get(&sender) {
            if known.digest == proposal.digest()? {
                return Ok(None);
            }
            return Err(Error::VerificationFailed(format!(
                "{} sent two different proposals",
                sender
            )));
        }
        if self.rejected.contains(&sender) {
            return Ok(None);
        }

        match self.verify(&proposal) {
            Ok(valid) => {
                debug!(creation_id = self.context.id, sender, "Valid proposal");
                self.valid.insert(sender, valid);
            }
            Err(e) => {
                self.rejected.insert(sender);
                return Err(e);
            }
        }

        let leader = self.context.leader == self.scheme.process_id();
        if !leader || self.set_submitted || self.valid.len() < self.context.f + 1 {
            return Ok(None);
        }
        self.set_submitted = true;
        let proposals: Vec<ProposalDigest> = self
            .valid
            .iter()
            .take(self.context.f + 1)
            .map(|(sender, valid)| ProposalDigest {
                sender: *sender,
                digest: valid.digest,
            })
            .collect();
        info!(creation_id = self.context.id, selected = proposals.len(), "Proposal set ready");
        Ok(Some(ProposalSetMessage {
            creation_id: self.context.id,
            leader: self.context.leader,
            proposals,
        }))
    }

    fn is_valid_proposal_set(&self, set: &ProposalSetMessage) -> bool {
        if set.creation_id != self.context.id || set.leader != self.context.leader {
            return false;
        }
        if set.proposals.len() != self.context.f + 1 {
            return false;
        }
        let mut senders = HashSet::new();
        set.proposals.iter().all(|selected| {
            senders.insert(selected.sender)
                && self.context.is_participant(selected.sender)
                && !self.rejected.contains(&selected.sender)
                && self
                    .valid
                    .get(&selected.sender)
                    .map_or(true, |known| known.digest == selected.digest)
        })
    }

    fn deliver_proposal_set(&mut self, set: ProposalSetMessage) -> Result<()> {
        if self.selected.is_some() {
            warn!(creation_id = self.context.id, "Proposal set delivered twice");
            return Ok(());
        }
        if !self.is_valid_proposal_set(&set) {
            return Err(Error::VerificationFailed("Invalid proposal set".into()));
        }
        self.selected = Some(set);
        Ok(())
    }

    fn try_finish(&mut self) -> Result<Option<Vec<VerifiableShare>>> {
        if self.finished {
            return Ok(None);
        }
        let Some(set) = &self.selected else {
            return Ok(None);
        };

        let mut chosen = Vec::with_capacity(set.proposals.len());
        for selected in &set.proposals {
            if self.rejected.contains(&selected.sender) {
                return Err(Error::VerificationFailed(format!(
                    "Selected proposal of {} is invalid",
                    selected.sender
                )));
            }
            match self.valid.get(&selected.sender) {
                Some(valid) if valid.digest == selected.digest => chosen.push(valid),
                Some(_) => {
                    return Err(Error::VerificationFailed(format!(
                        "Selected proposal of {} does not match",
                        selected.sender
                    )))
                }
                None => return Ok(None),
            }
        }

        let me = self.scheme.my_shareholder_id()?;
        let mut shares = Vec::with_capacity(self.context.n_polynomials);
        for k in 0..self.context.n_polynomials {
            let commitments: Vec<Vec<ProjectivePoint>> =
                chosen.iter().map(|valid| valid.commitments[k].clone()).collect();
            let summed = sum_points(&commitments)?;
            let value = chosen
                .iter()
                .fold(Scalar::ZERO, |acc, valid| acc + valid.points[k]);
            if ProjectivePoint::GENERATOR * value != evaluate_points(&summed, &me.to_scalar()) {
                return Err(Error::VerificationFailed("Summed point does not match".into()));
            }
            shares.push(VerifiableShare {
                share: Share::new(me, value),
                commitment: Commitment::Feldman(summed.iter().map(encode_point).collect()),
                shared_data: None,
            });
        }

        self.finished = true;
        info!(
            creation_id = self.context.id,
            reason = ?C::REASON,
            polynomials = shares.len(),
            "Polynomial creation finished"
        );
        Ok(Some(shares))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::polynomial::interpolate;
    use crate::testing::Cluster;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn run<C: CreationConstraint>(
        cluster: &Cluster,
        context: &PolynomialCreationContext,
    ) -> Vec<Vec<VerifiableShare>> {
        let mut rng = ChaCha20Rng::seed_from_u64(context.id);
        let mut creators: Vec<CreatorCore<C>> = cluster
            .replicas
            .iter()
            .map(|scheme| CreatorCore::new(context.clone(), scheme.clone()))
            .collect();
        let proposals: Vec<_> = creators
            .iter_mut()
            .map(|creator| creator.create_proposal(&mut rng).unwrap())
            .collect();

        let mut set = None;
        for creator in creators.iter_mut() {
            for proposal in &proposals {
                if let Some(s) = creator.process_proposal(proposal.clone()).unwrap() {
                    set = Some(s);
                }
            }
        }
        let set = set.expect("leader builds a proposal set");
        assert_eq!(set.proposals.len(), context.f + 1);

        creators
            .iter_mut()
            .map(|creator| {
                assert!(creator.is_valid_proposal_set(&set));
                creator.deliver_proposal_set(set.clone()).unwrap();
                creator.try_finish().unwrap().unwrap()
            })
            .collect()
    }

    #[test]
    fn test_resharing_polynomial_vanishes_at_zero() {
        let cluster = Cluster::new(1);
        let context = PolynomialCreationContext::new(3, CreationReason::Resharing, 1, 0..4)
            .with_polynomials(2);
        let points = run::<Resharing>(&cluster, &context);

        for k in 0..2 {
            let shares: Vec<Share> = points.iter().map(|p| p[k].share.clone()).collect();
            assert_eq!(interpolate(&shares[..2], &Scalar::ZERO).unwrap(), Scalar::ZERO);
            assert_eq!(interpolate(&shares[2..], &Scalar::ZERO).unwrap(), Scalar::ZERO);
            for point in &points {
                assert_eq!(point[k].commitment, points[0][k].commitment);
                assert!(cluster.replicas[0]
                    .commitment_scheme()
                    .check_validity(&point[k].share, &point[k].commitment));
            }
        }
    }

    #[test]
    fn test_recovery_polynomial_vanishes_at_targets() {
        let cluster = Cluster::new(1);
        let target = ShareholderId(4);
        let context = PolynomialCreationContext::new(4, CreationReason::Recovery, 1, 0..4)
            .with_targets(vec![target]);
        let points = run::<Recovery>(&cluster, &context);

        let shares: Vec<Share> = points.iter().map(|p| p[0].share.clone()).collect();
        assert_eq!(interpolate(&shares[..2], &target.to_scalar()).unwrap(), Scalar::ZERO);
        assert_eq!(shares[3].value, Scalar::ZERO);
    }

    #[test]
    fn test_tampered_proposal_is_rejected() {
        let cluster = Cluster::new(1);
        let context = PolynomialCreationContext::new(5, CreationReason::Resharing, 1, 0..4);
        let mut rng = ChaCha20Rng::seed_from_u64(5);

        let mut honest = ResharingPolynomialCreator::new(context.clone(), cluster.replicas[1].clone());
        let mut faulty = ResharingPolynomialCreator::new(context.clone(), cluster.replicas[2].clone());
        let mut proposal = faulty.create_proposal(&mut rng).unwrap();
        proposal.commitments[0][0] = encode_point(&ProjectivePoint::GENERATOR);

        assert!(honest.process_proposal(proposal.clone()).is_err());
        let set = ProposalSetMessage {
            creation_id: 5,
            leader: 0,
            proposals: vec![
                ProposalDigest {
                    sender: 0,
                    digest: [0; 32],
                },
                ProposalDigest {
                    sender: 2,
                    digest: proposal.digest().unwrap(),
                },
            ],
        };
        assert!(!honest.is_valid_proposal_set(&set));
        assert!(honest.deliver_proposal_set(set).is_err());
    }

    #[test]
    fn test_waits_for_selected_proposals() {
        let cluster = Cluster::new(1);
        let context = PolynomialCreationContext::new(6, CreationReason::Resharing, 1, 0..4);
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let mut creators: Vec<_> = cluster
            .replicas
            .iter()
            .map(|scheme| ResharingPolynomialCreator::new(context.clone(), scheme.clone()))
            .collect();
        let proposals: Vec<_> = creators
            .iter_mut()
            .map(|c| c.create_proposal(&mut rng).unwrap())
            .collect();

        let leader_set = {
            let leader = &mut creators[0];
            leader.process_proposal(proposals[0].clone()).unwrap();
            leader.process_proposal(proposals[1].clone()).unwrap().unwrap()
        };

        let late = &mut creators[3];
        late.deliver_proposal_set(leader_set).unwrap();
        assert!(late.try_finish().unwrap().is_none());
        late.process_proposal(proposals[0].clone()).unwrap();
        late.process_proposal(proposals[1].clone()).unwrap();
        assert_eq!(late.try_finish().unwrap().unwrap().len(), 1);
        assert!(late.try_finish().unwrap().is_none());
    }
}
