//! Reconfiguration and refresh coordination of one replica

use super::ReconfigurationParameters;
use crate::crypto::ConfidentialityScheme;
use crate::polynomial::{
    CreationReason, DistributedPolynomial, PolynomialCreationContext, PolynomialCreationListener,
};
use crate::types::{ConsensusId, ProcessId, ShareholderId, VerifiableShare};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{error, info};

/// Result of a polynomial creation run started by the state manager
#[derive(Debug, Clone)]
pub struct CreationOutcome {
    pub context: PolynomialCreationContext,
    pub result: std::result::Result<Vec<VerifiableShare>, String>,
}

struct OutcomeSink {
    outcomes: broadcast::Sender<CreationOutcome>,
}

impl PolynomialCreationListener for OutcomeSink {
    fn on_polynomial_creation_success(
        &self,
        context: &PolynomialCreationContext,
        points: Vec<VerifiableShare>,
    ) {
        info!(creation_id = context.id, reason = ?context.reason, "Polynomial creation succeeded");
        let _ = self.outcomes.send(CreationOutcome {
            context: context.clone(),
            result: Ok(points),
        });
    }

    fn on_polynomial_creation_failure(&self, context: &PolynomialCreationContext, error: &Error) {
        error!(creation_id = context.id, reason = ?context.reason, error = %error, "Polynomial creation failed");
        let _ = self.outcomes.send(CreationOutcome {
            context: context.clone(),
            result: Err(error.to_string()),
        });
    }
}

/// Tracks the last executed consensus id and turns membership changes into
/// refresh runs
pub struct ConfidentialStateManager {
    scheme: Arc<ConfidentialityScheme>,
    distributed: Arc<DistributedPolynomial>,
    last_cid: Mutex<Option<ConsensusId>>,
    parameters: Mutex<Option<ReconfigurationParameters>>,
    sink: Arc<OutcomeSink>,
}

impl ConfidentialStateManager {
    pub fn new(scheme: Arc<ConfidentialityScheme>, distributed: Arc<DistributedPolynomial>) -> Self {
        let (outcomes, _) = broadcast::channel(64);
        Self {
            scheme,
            distributed,
            last_cid: Mutex::new(None),
            parameters: Mutex::new(None),
            sink: Arc::new(OutcomeSink { outcomes }),
        }
    }

    pub fn set_last_cid(&self, cid: ConsensusId) {
        *self.last_cid.lock().unwrap_or_else(PoisonError::into_inner) = Some(cid);
    }

    pub fn last_cid(&self) -> Option<ConsensusId> {
        *self.last_cid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reconfiguration_parameters(&self, parameters: ReconfigurationParameters) {
        info!(%parameters, "Staging reconfiguration");
        *self.parameters.lock().unwrap_or_else(PoisonError::into_inner) = Some(parameters);
    }

    pub fn reconfiguration_parameters(&self) -> Option<ReconfigurationParameters> {
        self.parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outcomes of every run started from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CreationOutcome> {
        self.sink.outcomes.subscribe()
    }

    /// Apply the staged reconfiguration and reshare over the new group
    pub fn execute_reconfiguration(&self, consensus_id: ConsensusId) -> Result<()> {
        let parameters = self
            .parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Reconfiguration("No staged reconfiguration".into()))?;

        let participants: Vec<ProcessId> = self
            .scheme
            .shareholders()
            .into_keys()
            .filter(|pid| !parameters.leaving_servers.contains(pid))
            .collect();
        let context = PolynomialCreationContext::new(
            consensus_id,
            CreationReason::Resharing,
            parameters.new_f,
            participants,
        );
        context
            .validate()
            .map_err(|e| Error::Reconfiguration(format!("Cannot reshare: {}", e)))?;

        for pid in &parameters.leaving_servers {
            self.scheme.remove_shareholder(*pid);
        }
        self.scheme.set_threshold(parameters.new_f);
        info!(cid = consensus_id, participants = ?context.participants, "Executing reconfiguration");
        self.distributed.start(context, self.sink.clone())
    }

    /// Build blinding polynomials for recovering `targets`
    pub fn trigger_recovery(&self, creation_id: u64, targets: Vec<ShareholderId>) -> Result<()> {
        let participants = self.scheme.shareholders().into_keys();
        let context = PolynomialCreationContext::new(
            creation_id,
            CreationReason::Recovery,
            self.scheme.threshold(),
            participants,
        )
        .with_targets(targets);
        context.validate()?;
        info!(creation_id, targets = ?context.targets, "Triggering recovery");
        self.distributed.start(context, self.sink.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::crypto::polynomial::interpolate;
    use crate::statemanagement::BatchReconfigurationRequest;
    use crate::testing::{local_cluster, Cluster};
    use k256::Scalar;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_outcome(receiver: &mut broadcast::Receiver<CreationOutcome>) -> CreationOutcome {
        timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("creation timed out")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconfiguration_reshares_with_zero_constant() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let mut receivers: Vec<_> = local
            .replicas
            .iter()
            .map(|replica| replica.state_manager.subscribe())
            .collect();

        let request = BatchReconfigurationRequest {
            joining_servers: vec![],
            leaving_servers: vec![],
            f: 1,
        }
        .serialize()
        .unwrap();
        for replica in &local.replicas {
            replica.engine.on_reconfiguration_request(&request).unwrap();
            replica.engine.on_reconfiguration_complete(10);
        }

        let mut points = Vec::new();
        for receiver in &mut receivers {
            let outcome = next_outcome(receiver).await;
            assert_eq!(outcome.context.id, 10);
            assert_eq!(outcome.context.reason, CreationReason::Resharing);
            let shares = outcome.result.unwrap();
            assert_eq!(shares.len(), 1);
            points.push(shares[0].share.clone());
        }
        assert_eq!(interpolate(&points[..2], &Scalar::ZERO).unwrap(), Scalar::ZERO);
        assert_eq!(interpolate(&points[2..], &Scalar::ZERO).unwrap(), Scalar::ZERO);
        for replica in &local.replicas {
            assert_eq!(replica.state_manager.reconfiguration_parameters(), None);
            assert_eq!(replica.distributed.active_runs(), 0);
        }
        local.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovery_vanishes_at_target() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let mut receivers: Vec<_> = local
            .replicas
            .iter()
            .map(|replica| replica.state_manager.subscribe())
            .collect();

        let target = ShareholderId(4);
        for replica in &local.replicas {
            replica.state_manager.trigger_recovery(3, vec![target]).unwrap();
        }

        let mut points = Vec::new();
        for receiver in &mut receivers {
            let outcome = next_outcome(receiver).await;
            assert_eq!(outcome.context.reason, CreationReason::Recovery);
            points.push(outcome.result.unwrap()[0].share.clone());
        }
        assert_eq!(
            interpolate(&points[..2], &target.to_scalar()).unwrap(),
            Scalar::ZERO
        );
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_reconfiguration_changes_nothing() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let manager = &local.replicas[0].state_manager;

        assert!(matches!(
            manager.execute_reconfiguration(5),
            Err(Error::Reconfiguration(_))
        ));

        manager.set_reconfiguration_parameters(ReconfigurationParameters {
            new_f: 1,
            joining_servers: Default::default(),
            leaving_servers: [2, 3].into_iter().collect(),
        });
        assert!(matches!(
            manager.execute_reconfiguration(5),
            Err(Error::Reconfiguration(_))
        ));
        assert_eq!(cluster.replicas[0].shareholders().len(), 4);
        assert_eq!(cluster.replicas[0].threshold(), 1);

        assert!(manager.trigger_recovery(6, vec![]).is_err());
        manager.set_last_cid(12);
        assert_eq!(manager.last_cid(), Some(12));
        local.shutdown().await;
    }
}
