//! In-memory transport and ordering for local clusters

use super::communication::{InterServersCommunication, ServerTransport};
use super::recoverable::ConfidentialRecoverable;
use super::ConfidentialExecutable;
use crate::config::Configuration;
use crate::crypto::ConfidentialityScheme;
use crate::polynomial::{DistributedPolynomial, PolynomialCreatorRegistry};
use crate::statemanagement::ConfidentialStateManager;
use crate::types::{ConsensusId, InboundRequest, MessageContext, Metadata, ProcessId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A request a replica handed to the ordering layer
#[derive(Debug, Clone)]
pub struct OrderedSubmission {
    pub sender: ProcessId,
    pub metadata: Metadata,
    pub request: Vec<u8>,
}

/// Shared hub connecting every in-memory transport
pub struct MemoryNetwork {
    peers: DashMap<ProcessId, mpsc::UnboundedSender<(ProcessId, Vec<u8>)>>,
    ordered: mpsc::UnboundedSender<OrderedSubmission>,
}

impl MemoryNetwork {
    /// Create a network and the receiver of everything submitted for ordering
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OrderedSubmission>) {
        let (ordered, submissions) = mpsc::unbounded_channel();
        let network = Arc::new(Self {
            peers: DashMap::new(),
            ordered,
        });
        (network, submissions)
    }

    /// Attach `process_id`, returning its transport and inbound messages
    pub fn join(
        self: &Arc<Self>,
        process_id: ProcessId,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<(ProcessId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(process_id, tx);
        let transport = MemoryTransport {
            process_id,
            network: Arc::clone(self),
        };
        (transport, rx)
    }

    pub fn leave(&self, process_id: ProcessId) {
        self.peers.remove(&process_id);
    }
}

pub struct MemoryTransport {
    process_id: ProcessId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl ServerTransport for MemoryTransport {
    fn process_id(&self) -> ProcessId {
        self.process_id
    }

    async fn send(&self, recipients: &[ProcessId], payload: Vec<u8>) -> Result<()> {
        for recipient in recipients {
            let peer = self.network.peers.get(recipient).map(|p| p.value().clone());
            match peer {
                Some(peer) => {
                    if peer.send((self.process_id, payload.clone())).is_err() {
                        warn!(recipient, "Peer inbox closed");
                    }
                }
                None => warn!(recipient, "Unknown peer"),
            }
        }
        Ok(())
    }

    async fn order(&self, metadata: Metadata, request: Vec<u8>) -> Result<()> {
        self.network
            .ordered
            .send(OrderedSubmission {
                sender: self.process_id,
                metadata,
                request,
            })
            .map_err(|_| Error::Transport("Ordering layer is gone".into()))
    }
}

struct SequencerState {
    next_cid: ConsensusId,
    sequences: HashMap<ProcessId, u32>,
}

/// Totally orders requests for a set of in-process replicas.
///
/// Every request is pre-validated by all replicas and then delivered to all
/// of them as a single-command batch under a fresh consensus id.
pub struct MemorySequencer {
    replicas: Vec<Arc<ConfidentialRecoverable>>,
    state: Mutex<SequencerState>,
}

impl MemorySequencer {
    pub fn new(replicas: Vec<Arc<ConfidentialRecoverable>>, first_cid: ConsensusId) -> Self {
        Self {
            replicas,
            state: Mutex::new(SequencerState {
                next_cid: first_cid,
                sequences: HashMap::new(),
            }),
        }
    }

    pub fn replicas(&self) -> &[Arc<ConfidentialRecoverable>] {
        &self.replicas
    }

    /// Order one request, returning each replica's reply, or `None` if any
    /// replica rejected it during pre-validation
    pub fn order(
        &self,
        sender: ProcessId,
        metadata: Metadata,
        common: &[u8],
        private: &BTreeMap<ProcessId, Vec<u8>>,
    ) -> Option<Vec<Option<Vec<u8>>>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = {
            let next = state.sequences.entry(sender).or_default();
            *next += 1;
            *next
        };

        for replica in &self.replicas {
            let inbound = InboundRequest {
                sender,
                session: 0,
                sequence,
                metadata: Some(vec![metadata.tag()]),
                content: common.to_vec(),
                private_content: private.get(&replica.process_id()).cloned(),
            };
            if !replica.is_valid_request(&inbound) {
                warn!(sender, sequence, replica = replica.process_id(), "Request rejected before ordering");
                return None;
            }
        }

        let consensus_id = state.next_cid;
        state.next_cid += 1;
        debug!(sender, sequence, cid = consensus_id, "Ordering request");

        let context = MessageContext {
            sender,
            session: 0,
            sequence,
            operation_id: sequence,
            consensus_id,
            last_in_batch: true,
            ..Default::default()
        };
        Some(
            self.replicas
                .iter()
                .map(|replica| {
                    replica.execute_ordered(
                        common,
                        private.get(&replica.process_id()).map(Vec::as_slice),
                        &context,
                    )
                })
                .collect(),
        )
    }

    /// Order every replica submission until the network is dropped
    pub fn spawn(
        self: &Arc<Self>,
        mut submissions: mpsc::UnboundedReceiver<OrderedSubmission>,
    ) -> JoinHandle<()> {
        let sequencer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(submission) = submissions.recv().await {
                sequencer.order(
                    submission.sender,
                    submission.metadata,
                    &submission.request,
                    &BTreeMap::new(),
                );
            }
        })
    }
}

/// The components of one replica of a [`LocalCluster`]
pub struct LocalReplica {
    pub engine: Arc<ConfidentialRecoverable>,
    pub state_manager: Arc<ConfidentialStateManager>,
    pub distributed: Arc<DistributedPolynomial>,
}

/// Replicas wired together over one [`MemoryNetwork`] and ordered by one
/// [`MemorySequencer`]
pub struct LocalCluster {
    pub network: Arc<MemoryNetwork>,
    pub sequencer: Arc<MemorySequencer>,
    pub replicas: Vec<LocalReplica>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Start one replica per scheme. Must be called within a tokio runtime.
    ///
    /// With a `seed`, every replica's polynomial task samples from a
    /// deterministic generator.
    pub fn start(
        config: &Configuration,
        schemes: &[Arc<ConfidentialityScheme>],
        mut application: impl FnMut(ProcessId) -> Box<dyn ConfidentialExecutable>,
        seed: Option<u64>,
    ) -> Result<Self> {
        let (network, submissions) = MemoryNetwork::new();
        let mut replicas = Vec::with_capacity(schemes.len());
        let mut tasks = Vec::with_capacity(schemes.len() + 1);

        for scheme in schemes {
            let process_id = scheme.process_id();
            let (transport, inbound) = network.join(process_id);
            let communication = Arc::new(InterServersCommunication::new(Arc::new(transport)));
            tasks.push(communication.spawn_receiver(inbound));

            let rng = match seed {
                Some(seed) => ChaCha20Rng::seed_from_u64(seed.wrapping_add(process_id as u64)),
                None => ChaCha20Rng::from_entropy(),
            };
            let distributed = DistributedPolynomial::spawn(
                scheme.clone(),
                communication.clone(),
                PolynomialCreatorRegistry::default(),
                rng,
            );
            let state_manager = Arc::new(ConfidentialStateManager::new(
                scheme.clone(),
                distributed.clone(),
            ));
            let engine = Arc::new(ConfidentialRecoverable::new(
                config.clone(),
                scheme.clone(),
                application(process_id),
                communication,
                distributed.clone(),
                state_manager.clone(),
            )?);
            replicas.push(LocalReplica {
                engine,
                state_manager,
                distributed,
            });
        }

        let sequencer = Arc::new(MemorySequencer::new(
            replicas.iter().map(|replica| replica.engine.clone()).collect(),
            1,
        ));
        tasks.push(sequencer.spawn(submissions));
        debug!(replicas = replicas.len(), "Local cluster started");

        Ok(Self {
            network,
            sequencer,
            replicas,
            tasks,
        })
    }

    /// Stop every polynomial task and the network plumbing
    pub async fn shutdown(self) {
        for replica in &self.replicas {
            replica.distributed.shutdown().await;
        }
        for task in self.tasks {
            task.abort();
        }
    }
}
