//! Supervised task driving polynomial creation runs

use super::creator::PolynomialCreator;
use super::factory::PolynomialCreatorRegistry;
use super::messages::{PolynomialProposal, ProposalSetMessage};
use super::PolynomialCreationContext;
use crate::crypto::ConfidentialityScheme;
use crate::server::{InterServerMessage, InterServersCommunication, InterServersMessageType};
use crate::types::{Metadata, ProcessId, VerifiableShare};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand_core::RngCore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Receives the outcome of a creation run
pub trait PolynomialCreationListener: Send + Sync {
    /// This participant's point of every created polynomial
    fn on_polynomial_creation_success(
        &self,
        context: &PolynomialCreationContext,
        points: Vec<VerifiableShare>,
    );

    fn on_polynomial_creation_failure(&self, context: &PolynomialCreationContext, error: &Error);
}

enum Command {
    Start {
        context: PolynomialCreationContext,
        listener: Arc<dyn PolynomialCreationListener>,
    },
}

struct Run {
    creator: Box<dyn PolynomialCreator>,
    listener: Arc<dyn PolynomialCreationListener>,
}

type Runs = Arc<Mutex<HashMap<u64, Run>>>;

const MAX_BUFFERED_RUNS: usize = 64;
const MAX_BUFFERED_PER_RUN: usize = 128;
const MAX_CLOSED_RUNS: usize = 1024;
const BUFFER_TTL_SECS: i64 = 120;

struct Buffered {
    received_at: DateTime<Utc>,
    proposals: Vec<PolynomialProposal>,
    set: Option<ProposalSetMessage>,
}

/// Messages for runs not started here yet.
///
/// Bounded in runs, in proposals per run and in age. Messages for runs that
/// already finished or failed here are dropped.
struct EarlyMessages {
    runs: HashMap<u64, Buffered>,
    closed: HashSet<u64>,
    closed_order: VecDeque<u64>,
    ttl: chrono::Duration,
    len: Arc<AtomicUsize>,
}

impl EarlyMessages {
    fn new(len: Arc<AtomicUsize>) -> Self {
        Self {
            runs: HashMap::new(),
            closed: HashSet::new(),
            closed_order: VecDeque::new(),
            ttl: chrono::Duration::seconds(BUFFER_TTL_SECS),
            len,
        }
    }

    fn is_closed(&self, creation_id: u64) -> bool {
        self.closed.contains(&creation_id)
    }

    fn close(&mut self, creation_id: u64) {
        self.runs.remove(&creation_id);
        if self.closed.insert(creation_id) {
            self.closed_order.push_back(creation_id);
            if self.closed_order.len() > MAX_CLOSED_RUNS {
                if let Some(oldest) = self.closed_order.pop_front() {
                    self.closed.remove(&oldest);
                }
            }
        }
        self.update_len();
    }

    fn slot(&mut self, creation_id: u64, now: DateTime<Utc>) -> Option<&mut Buffered> {
        let ttl = self.ttl;
        self.runs.retain(|_, buffered| now - buffered.received_at < ttl);
        if self.is_closed(creation_id) {
            return None;
        }
        if !self.runs.contains_key(&creation_id) && self.runs.len() >= MAX_BUFFERED_RUNS {
            let oldest = self
                .runs
                .iter()
                .min_by_key(|(_, buffered)| buffered.received_at)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                debug!(creation_id = oldest, "Evicting buffered run");
                self.runs.remove(&oldest);
            }
        }
        Some(self.runs.entry(creation_id).or_insert_with(|| Buffered {
            received_at: now,
            proposals: Vec::new(),
            set: None,
        }))
    }

    fn push_proposal(&mut self, proposal: PolynomialProposal, now: DateTime<Utc>) -> bool {
        let pushed = match self.slot(proposal.creation_id, now) {
            Some(buffered) if buffered.proposals.len() < MAX_BUFFERED_PER_RUN => {
                buffered.proposals.push(proposal);
                true
            }
            _ => false,
        };
        self.update_len();
        pushed
    }

    fn push_set(&mut self, set: ProposalSetMessage, now: DateTime<Utc>) -> bool {
        let pushed = match self.slot(set.creation_id, now) {
            Some(buffered) => {
                buffered.set = Some(set);
                true
            }
            None => false,
        };
        self.update_len();
        pushed
    }

    fn take(&mut self, creation_id: u64) -> Option<Buffered> {
        let buffered = self.runs.remove(&creation_id);
        self.update_len();
        buffered
    }

    fn len(&self) -> usize {
        self.runs
            .values()
            .map(|buffered| buffered.proposals.len() + usize::from(buffered.set.is_some()))
            .sum()
    }

    fn update_len(&self) {
        self.len.store(self.len(), Ordering::Relaxed);
    }
}

/// Handle to the polynomial creation task of one replica
pub struct DistributedPolynomial {
    process_id: ProcessId,
    commands: mpsc::UnboundedSender<Command>,
    runs: Runs,
    buffered: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedPolynomial {
    /// Register with `communication` and spawn the supervising task
    pub fn spawn(
        scheme: Arc<ConfidentialityScheme>,
        communication: Arc<InterServersCommunication>,
        registry: PolynomialCreatorRegistry,
        rng: impl RngCore + Send + 'static,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        communication.register_handler(InterServersMessageType::PolynomialProposal, inbound_tx.clone());
        communication.register_handler(InterServersMessageType::PolynomialProposalSet, inbound_tx);

        let runs: Runs = Arc::new(Mutex::new(HashMap::new()));
        let buffered = Arc::new(AtomicUsize::new(0));
        let process_id = scheme.process_id();
        let supervisor = Supervisor {
            process_id,
            scheme,
            communication,
            registry,
            rng: Box::new(rng),
            runs: runs.clone(),
            early: EarlyMessages::new(buffered.clone()),
        };
        let task = tokio::spawn(supervisor.run(commands_rx, inbound_rx, shutdown_rx));

        Arc::new(Self {
            process_id,
            commands: commands_tx,
            runs,
            buffered,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Start a creation run; the outcome goes to `listener`
    pub fn start(
        &self,
        context: PolynomialCreationContext,
        listener: Arc<dyn PolynomialCreationListener>,
    ) -> Result<()> {
        self.commands
            .send(Command::Start { context, listener })
            .map_err(|_| Error::Internal("Polynomial task stopped".into()))
    }

    /// Pre-ordering check of a proposal set.
    ///
    /// Sets for runs not started here yet are accepted and checked again on
    /// delivery.
    pub fn is_valid_proposal_set(&self, set: &ProposalSetMessage) -> bool {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match runs.get(&set.creation_id) {
            Some(run) => run.creator.is_valid_proposal_set(set),
            None => {
                debug!(creation_id = set.creation_id, "Proposal set for unknown run");
                true
            }
        }
    }

    /// Number of runs still in progress
    pub fn active_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Proposals and sets held for runs not started here yet
    pub fn buffered_messages(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Signal the task to stop and wait for it
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(process_id = self.process_id, error = %e, "Polynomial task failed");
            }
        }
    }
}

struct Supervisor {
    process_id: ProcessId,
    scheme: Arc<ConfidentialityScheme>,
    communication: Arc<InterServersCommunication>,
    registry: PolynomialCreatorRegistry,
    rng: Box<dyn RngCore + Send>,
    runs: Runs,
    early: EarlyMessages,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<InterServerMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(process_id = self.process_id, "Polynomial task started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(message) = inbound.recv() => self.handle_message(message).await,
                else => break,
            }
        }
        info!(process_id = self.process_id, "Polynomial task stopped");
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip_all, fields(process_id = self.process_id))]
    async fn handle_command(&mut self, command: Command) {
        let Command::Start { context, listener } = command;
        let creation_id = context.id;

        if let Err(e) = context.validate() {
            warn!(creation_id, error = %e, "Invalid creation context");
            listener.on_polynomial_creation_failure(&context, &e);
            self.early.close(creation_id);
            return;
        }
        if !context.is_participant(self.process_id) {
            info!(creation_id, "Not a participant of this run");
            self.early.close(creation_id);
            return;
        }
        if self.early.is_closed(creation_id) {
            warn!(creation_id, "Run already closed");
            return;
        }
        if self.runs().contains_key(&creation_id) {
            warn!(creation_id, "Run already in progress");
            return;
        }

        let Some(mut creator) = self.registry.create(context.clone(), self.scheme.clone()) else {
            let e = Error::InvalidConfig(format!("No creator for {:?}", context.reason));
            listener.on_polynomial_creation_failure(&context, &e);
            self.early.close(creation_id);
            return;
        };
        let proposal = match creator.create_proposal(&mut *self.rng) {
            Ok(proposal) => proposal,
            Err(e) => {
                error!(creation_id, error = %e, "Failed to create proposal");
                listener.on_polynomial_creation_failure(&context, &e);
                self.early.close(creation_id);
                return;
            }
        };
        info!(creation_id, reason = ?context.reason, "Starting polynomial creation");
        self.runs().insert(creation_id, Run { creator, listener });

        let others: Vec<ProcessId> = context
            .participants
            .iter()
            .copied()
            .filter(|pid| *pid != self.process_id)
            .collect();
        match proposal.serialize() {
            Ok(bytes) => {
                if let Err(e) = self
                    .communication
                    .send(InterServersMessageType::PolynomialProposal, &others, &bytes)
                    .await
                {
                    warn!(creation_id, error = %e, "Failed to send proposal");
                }
            }
            Err(e) => warn!(creation_id, error = %e, "Failed to serialize proposal"),
        }
        self.on_proposal(proposal).await;

        if let Some(buffered) = self.early.take(creation_id) {
            for proposal in buffered.proposals {
                self.on_proposal(proposal).await;
            }
            if let Some(set) = buffered.set {
                self.on_proposal_set(set);
            }
        }
    }

    async fn handle_message(&mut self, message: InterServerMessage) {
        match message.kind {
            InterServersMessageType::PolynomialProposal => {
                match PolynomialProposal::deserialize(&message.payload) {
                    Ok(proposal) if proposal.sender == message.sender => {
                        self.on_proposal(proposal).await
                    }
                    Ok(proposal) => warn!(
                        sender = message.sender,
                        claimed = proposal.sender,
                        "Proposal sender mismatch"
                    ),
                    Err(e) => warn!(sender = message.sender, error = %e, "Malformed proposal"),
                }
            }
            InterServersMessageType::PolynomialProposalSet => {
                if message.context.is_none() {
                    warn!(sender = message.sender, "Unordered proposal set dropped");
                    return;
                }
                match ProposalSetMessage::deserialize(&message.payload) {
                    Ok(set) => self.on_proposal_set(set),
                    Err(e) => warn!(sender = message.sender, error = %e, "Malformed proposal set"),
                }
            }
        }
    }

    async fn on_proposal(&mut self, proposal: PolynomialProposal) {
        let creation_id = proposal.creation_id;
        let sender = proposal.sender;
        let outcome = {
            let mut runs = self.runs();
            match runs.get_mut(&creation_id) {
                Some(run) => Ok(run.creator.process_proposal(proposal)),
                None => Err(proposal),
            }
        };

        match outcome {
            Err(proposal) => {
                if self.early.push_proposal(proposal, Utc::now()) {
                    debug!(creation_id, sender, "Buffering proposal for unknown run");
                } else {
                    debug!(creation_id, sender, "Dropping proposal");
                }
                return;
            }
            Ok(Ok(Some(set))) => self.submit_proposal_set(set).await,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(creation_id, sender, error = %e, "Rejected proposal"),
        }
        self.try_finish(creation_id);
    }

    async fn submit_proposal_set(&mut self, set: ProposalSetMessage) {
        let creation_id = set.creation_id;
        let result = match set.serialize() {
            Ok(bytes) => {
                self.communication
                    .submit_ordered(
                        InterServersMessageType::PolynomialProposalSet,
                        Metadata::PolynomialProposalSet,
                        &bytes,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(creation_id, error = %e, "Failed to order proposal set");
            self.fail(creation_id, &e);
        }
    }

    fn on_proposal_set(&mut self, set: ProposalSetMessage) {
        let creation_id = set.creation_id;
        let delivered = {
            let mut runs = self.runs();
            runs.get_mut(&creation_id)
                .map(|run| run.creator.deliver_proposal_set(set.clone()))
        };
        match delivered {
            None => {
                if self.early.push_set(set, Utc::now()) {
                    debug!(creation_id, "Buffering proposal set for unknown run");
                } else {
                    debug!(creation_id, "Dropping proposal set");
                }
            }
            Some(Ok(())) => self.try_finish(creation_id),
            Some(Err(e)) => {
                warn!(creation_id, error = %e, "Rejected ordered proposal set");
                self.fail(creation_id, &e);
            }
        }
    }

    fn try_finish(&mut self, creation_id: u64) {
        let finished = {
            let mut runs = self.runs();
            let outcome = match runs.get_mut(&creation_id) {
                Some(run) => run.creator.try_finish(),
                None => return,
            };
            match outcome {
                Ok(None) => return,
                Ok(Some(points)) => runs.remove(&creation_id).map(|run| (run, Ok(points))),
                Err(e) => runs.remove(&creation_id).map(|run| (run, Err(e))),
            }
        };

        if let Some((run, outcome)) = finished {
            self.early.close(creation_id);
            let context = run.creator.context();
            match outcome {
                Ok(points) => run.listener.on_polynomial_creation_success(context, points),
                Err(e) => {
                    warn!(creation_id, error = %e, "Polynomial creation failed");
                    run.listener.on_polynomial_creation_failure(context, &e);
                }
            }
        }
    }

    fn fail(&mut self, creation_id: u64, error: &Error) {
        let run = self.runs().remove(&creation_id);
        if let Some(run) = run {
            self.early.close(creation_id);
            run.listener
                .on_polynomial_creation_failure(run.creator.context(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::server::ServerTransport;
    use crate::statemanagement::BatchReconfigurationRequest;
    use crate::testing::{local_cluster, Cluster};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn proposal(creation_id: u64, sender: ProcessId) -> PolynomialProposal {
        PolynomialProposal {
            creation_id,
            sender,
            commitments: Vec::new(),
            points: BTreeMap::new(),
        }
    }

    fn early() -> (EarlyMessages, Arc<AtomicUsize>) {
        let len = Arc::new(AtomicUsize::new(0));
        (EarlyMessages::new(len.clone()), len)
    }

    #[test]
    fn test_early_messages_are_bounded() {
        let (mut early, len) = early();
        let now = Utc::now();

        for id in 0..(MAX_BUFFERED_RUNS as u64 + 10) {
            assert!(early.push_proposal(proposal(id, 1), now + chrono::Duration::milliseconds(id as i64)));
        }
        assert_eq!(early.runs.len(), MAX_BUFFERED_RUNS);
        assert_eq!(len.load(Ordering::Relaxed), MAX_BUFFERED_RUNS);
        // the oldest runs were evicted
        assert!(!early.runs.contains_key(&0));
        assert!(early.runs.contains_key(&(MAX_BUFFERED_RUNS as u64 + 9)));

        for _ in 0..(MAX_BUFFERED_PER_RUN + 5) {
            early.push_proposal(proposal(500, 2), now);
        }
        assert_eq!(early.runs[&500].proposals.len(), MAX_BUFFERED_PER_RUN);
        assert!(early.len() <= MAX_BUFFERED_RUNS * MAX_BUFFERED_PER_RUN);
    }

    #[test]
    fn test_closed_and_expired_runs_are_not_buffered() {
        let (mut early, len) = early();
        let now = Utc::now();

        early.push_proposal(proposal(7, 1), now);
        early.close(7);
        assert_eq!(len.load(Ordering::Relaxed), 0);
        assert!(!early.push_proposal(proposal(7, 2), now));
        assert!(!early.push_set(
            ProposalSetMessage {
                creation_id: 7,
                leader: 0,
                proposals: Vec::new(),
            },
            now,
        ));
        assert!(early.take(7).is_none());

        early.push_proposal(proposal(8, 1), now);
        let later = now + chrono::Duration::seconds(BUFFER_TTL_SECS + 1);
        early.push_proposal(proposal(9, 1), later);
        assert!(!early.runs.contains_key(&8));
        assert_eq!(early.len(), 1);

        for id in 100..(100 + MAX_CLOSED_RUNS as u64 + 1) {
            early.close(id);
        }
        assert_eq!(early.closed.len(), MAX_CLOSED_RUNS);
        assert!(!early.is_closed(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stragglers_are_dropped_after_completion() {
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
        for receiver in &mut receivers {
            let outcome = timeout(Duration::from_secs(10), receiver.recv())
                .await
                .expect("creation timed out")
                .unwrap();
            assert!(outcome.result.is_ok());
        }

        // late proposals of the finished run and proposals for unknown runs
        let (peer, _inbox) = local.network.join(99);
        let tagged = |creation_id| {
            let mut bytes = vec![InterServersMessageType::PolynomialProposal.tag()];
            bytes.extend(proposal(creation_id, 99).serialize().unwrap());
            bytes
        };
        for _ in 0..10 {
            peer.send(&[0], tagged(10)).await.unwrap();
        }
        for id in 1000..(1000 + 2 * MAX_BUFFERED_RUNS as u64) {
            peer.send(&[0], tagged(id)).await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        assert_eq!(local.replicas[0].distributed.buffered_messages(), MAX_BUFFERED_RUNS);
        for replica in &local.replicas[1..] {
            assert_eq!(replica.distributed.buffered_messages(), 0);
            assert_eq!(replica.distributed.active_runs(), 0);
        }
        local.shutdown().await;
    }
}
