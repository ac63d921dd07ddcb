//! Confidential execution engine of a replica
//!
//! Lock order: the execution lock is always taken before the log lock. The
//! buffer of commands waiting for the end of their delivery batch has its own
//! lock and is never held while either of the others is acquired.

use super::communication::{InterServersCommunication, InterServersMessageType};
use super::request_cache::{RequestCache, RequestKey};
use super::ConfidentialExecutable;
use crate::codec::{Request, RequestDecoder};
use crate::config::Configuration;
use crate::crypto::ConfidentialityScheme;
use crate::polynomial::{DistributedPolynomial, ProposalSetMessage};
use crate::statemanagement::{
    ApplicationState, BatchReconfigurationRequest, CommandsInfo, ConfidentialStateLog,
    ConfidentialStateManager, ReconfigurationParameters,
};
use crate::types::{
    ConfidentialMessage, ConfidentialSnapshot, ConsensusId, EncryptedConfidentialMessage,
    EncryptedVerifiableShare, InboundRequest, MessageContext, MessageType, Metadata, ProcessId,
    ShareholderId,
};
use crate::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, instrument, warn};

#[derive(Default)]
struct PendingCommands {
    commands: Vec<Vec<u8>>,
    contexts: Vec<MessageContext>,
}

/// Validates, executes and logs the requests delivered to one replica
pub struct ConfidentialRecoverable {
    process_id: ProcessId,
    config: Configuration,
    scheme: Arc<ConfidentialityScheme>,
    decoder: RequestDecoder,
    executor: Mutex<Box<dyn ConfidentialExecutable>>,
    log: Mutex<Option<ConfidentialStateLog>>,
    pending: Mutex<PendingCommands>,
    verified_requests: RequestCache,
    communication: Arc<InterServersCommunication>,
    distributed: Arc<DistributedPolynomial>,
    state_manager: Arc<ConfidentialStateManager>,
}

impl ConfidentialRecoverable {
    pub fn new(
        config: Configuration,
        scheme: Arc<ConfidentialityScheme>,
        executor: Box<dyn ConfidentialExecutable>,
        communication: Arc<InterServersCommunication>,
        distributed: Arc<DistributedPolynomial>,
        state_manager: Arc<ConfidentialStateManager>,
    ) -> Result<Self> {
        config.validate()?;
        let process_id = scheme.process_id();

        let log = if config.logging_enabled() {
            let state = executor.get_confidential_snapshot().serialize()?;
            let hash = *blake3::hash(&state).as_bytes();
            Some(ConfidentialStateLog::new(
                process_id,
                config.checkpoint_period,
                state,
                hash,
            ))
        } else {
            None
        };
        let verified_requests = RequestCache::new(
            config.request_cache_capacity,
            chrono::Duration::seconds(config.request_cache_ttl_secs),
        );
        info!(
            process_id,
            linear_commitments = scheme.is_linear_commitment_scheme(),
            checkpoint_period = config.checkpoint_period,
            "Confidential engine ready"
        );

        Ok(Self {
            process_id,
            decoder: RequestDecoder::new(scheme.clone(), config.send_all_shares_together),
            config,
            scheme,
            executor: Mutex::new(executor),
            log: Mutex::new(log),
            pending: Mutex::new(PendingCommands::default()),
            verified_requests,
            communication,
            distributed,
            state_manager,
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state_manager(&self) -> &Arc<ConfidentialStateManager> {
        &self.state_manager
    }

    fn executor(&self) -> MutexGuard<'_, Box<dyn ConfidentialExecutable>> {
        self.executor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> MutexGuard<'_, Option<ConfidentialStateLog>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decode(&self, common: &[u8], private: Option<&[u8]>, sender: ProcessId) -> Option<Request> {
        match self.decoder.decode(common, private) {
            Ok(request) => Some(request),
            Err(e) => {
                warn!(sender, error = %e, "Dropping undecodable request");
                None
            }
        }
    }

    /// Pre-ordering check driven by the metadata attached to the message
    #[instrument(skip_all, fields(process_id = self.process_id, sender = request.sender, sequence = request.sequence))]
    pub fn is_valid_request(&self, request: &InboundRequest) -> bool {
        let Some(&tag) = request.metadata.as_deref().and_then(<[u8]>::first) else {
            return true;
        };
        match Metadata::try_from(tag) {
            Ok(Metadata::PolynomialProposalSet) => self.is_valid_proposal_set(request),
            Ok(Metadata::Verify) => {
                !self.config.verify_client_requests || self.verify_client_request(request)
            }
            Ok(Metadata::DoesNotVerify) => true,
            Err(e) => {
                error!(error = %e, "Unknown metadata");
                false
            }
        }
    }

    fn is_valid_proposal_set(&self, request: &InboundRequest) -> bool {
        let Some(decoded) = self.decode(
            &request.content,
            request.private_content.as_deref(),
            request.sender,
        ) else {
            return false;
        };
        if decoded.kind != MessageType::Application {
            error!(kind = ?decoded.kind, "Proposal set must travel as an application request");
            return false;
        }
        let payload = match decoded.plain_data.as_deref().and_then(<[u8]>::split_first) {
            Some((&tag, payload)) if tag == InterServersMessageType::PolynomialProposalSet.tag() => {
                payload
            }
            _ => {
                error!("Application request does not carry a proposal set");
                return false;
            }
        };
        match ProposalSetMessage::deserialize(payload) {
            Ok(set) => self.distributed.is_valid_proposal_set(&set),
            Err(e) => {
                error!(error = %e, "Failed to deserialize proposal set");
                false
            }
        }
    }

    fn verify_client_request(&self, request: &InboundRequest) -> bool {
        let Some(decoded) = self.decode(
            &request.content,
            request.private_content.as_deref(),
            request.sender,
        ) else {
            return false;
        };
        let Some(shares) = decoded.shares.as_deref() else {
            warn!("Request to verify carries no shares");
            return false;
        };
        let commitments = self.scheme.commitment_scheme();
        if let Some(invalid) = shares.iter().find(|vs| {
            !commitments.check_validity_without_precomputation(&vs.share, &vs.commitment)
        }) {
            warn!(shareholder = invalid.share.shareholder.0, "Client sent an invalid share");
            return false;
        }
        self.verified_requests.put(
            RequestKey::new(request.sender, request.session, request.sequence),
            decoded,
        );
        true
    }

    /// Execute a totally ordered request, returning the reply for its sender
    #[instrument(skip_all, fields(process_id = self.process_id, sender = context.sender, cid = context.consensus_id))]
    pub fn execute_ordered(
        &self,
        command: &[u8],
        private: Option<&[u8]>,
        context: &MessageContext,
    ) -> Option<Vec<u8>> {
        let cached = if self.config.verify_client_requests {
            self.verified_requests.take(&RequestKey::new(
                context.sender,
                context.session,
                context.sequence,
            ))
        } else {
            None
        };
        let request = match cached {
            Some(request) => request,
            None => self.decode(command, private, context.sender)?,
        };

        let response = match request.kind {
            MessageType::Application => {
                debug!(regency = context.regency, "Ordered application message");
                if let Some(data) = request.plain_data.as_deref() {
                    self.communication.message_received(data, context);
                }
                Some(Vec::new())
            }
            MessageType::Client => {
                let response = self.executor().app_execute_ordered(
                    request.plain_data.as_deref(),
                    request.shares.as_deref().unwrap_or_default(),
                    context,
                );
                self.encode_response(response, context.sender)
            }
            MessageType::Reconfiguration => {
                info!("Reconfiguration message in ordered execution");
                None
            }
        };
        self.log_request(&request, context);
        response
    }

    /// Execute a request outside of the total order. Nothing is logged.
    #[instrument(skip_all, fields(process_id = self.process_id, sender = context.sender))]
    pub fn execute_unordered(
        &self,
        command: &[u8],
        private: Option<&[u8]>,
        context: &MessageContext,
    ) -> Option<Vec<u8>> {
        let request = self.decode(command, private, context.sender)?;
        match request.kind {
            MessageType::Application => {
                debug!("Unordered application message");
                if let Some(data) = request.plain_data.as_deref() {
                    self.communication.deliver(context.sender, data);
                }
                Some(Vec::new())
            }
            MessageType::Client => {
                let response = self.executor().app_execute_unordered(
                    request.plain_data.as_deref(),
                    request.shares.as_deref().unwrap_or_default(),
                    context,
                );
                self.encode_response(response, context.sender)
            }
            MessageType::Reconfiguration => {
                warn!("Unordered reconfiguration request dropped");
                None
            }
        }
    }

    fn encode_response(&self, response: ConfidentialMessage, client: ProcessId) -> Option<Vec<u8>> {
        let encoded = if self.config.use_tls_encryption {
            response.serialize()
        } else {
            self.encrypt_response(response, client).serialize()
        };
        match encoded {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(client, error = %e, "Failed to serialize response");
                None
            }
        }
    }

    /// Seal every share of `response` for `client`. A share that cannot be
    /// sealed becomes an empty entry.
    fn encrypt_response(
        &self,
        response: ConfidentialMessage,
        client: ProcessId,
    ) -> EncryptedConfidentialMessage {
        let shares = response
            .shares
            .into_iter()
            .map(|vs| match self.scheme.encrypt_share_for(client, &vs.share) {
                Ok(share) => Some(EncryptedVerifiableShare {
                    shareholder: vs.share.shareholder,
                    share,
                    commitment: vs.commitment,
                    shared_data: vs.shared_data,
                }),
                Err(e) => {
                    error!(client, error = %e, "Failed to encrypt share");
                    None
                }
            })
            .collect();
        EncryptedConfidentialMessage {
            plain_data: response.plain_data,
            shares,
        }
    }

    /// Log operations that were decided but not executed.
    ///
    /// Every entry is recorded as a RECONFIGURATION request with a no-op
    /// context, whatever the original operation was. Replay skips them.
    #[instrument(skip_all, fields(process_id = self.process_id, cid = consensus_id))]
    pub fn no_op(&self, consensus_id: ConsensusId, operations: &[Vec<u8>], contexts: &[MessageContext]) {
        if operations.len() != contexts.len() {
            warn!(
                operations = operations.len(),
                contexts = contexts.len(),
                "No-op batch size mismatch"
            );
        }
        let count = operations.len().min(contexts.len());
        for (index, (operation, context)) in operations.iter().zip(contexts).enumerate() {
            info!(sender = context.sender, "No-op");
            if let Some(&tag) = operation.first() {
                debug!(original = ?MessageType::try_from(tag).ok(), "Logging no-op as reconfiguration");
            }
            let mut context = context.clone();
            context.consensus_id = consensus_id;
            context.no_op = true;
            context.last_in_batch |= index + 1 == count;
            self.log_request(&Request::reconfiguration(operation.clone()), &context);
        }
    }

    fn log_request(&self, request: &Request, context: &MessageContext) {
        let command = match request.serialize() {
            Ok(command) => command,
            Err(e) => {
                error!(cid = context.consensus_id, error = %e, "Failed to serialize command for the log");
                return;
            }
        };
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.commands.push(command);
            pending.contexts.push(context.clone());
            if !context.last_in_batch {
                return;
            }
            std::mem::take(&mut *pending)
        };

        let cid = context.consensus_id;
        if cid > 0 && cid % self.config.checkpoint_period == 0 {
            info!(cid, "Performing checkpoint");
            let snapshot = self.executor().get_confidential_snapshot();
            self.save_state(snapshot, cid);
        } else {
            self.save_commands(batch);
        }
        self.state_manager.set_last_cid(cid);
    }

    fn save_state(&self, snapshot: ConfidentialSnapshot, cid: ConsensusId) {
        let state = match snapshot.serialize() {
            Ok(state) => state,
            Err(e) => {
                error!(cid, error = %e, "Failed to serialize snapshot");
                return;
            }
        };
        let hash = *blake3::hash(&state).as_bytes();
        if let Some(log) = self.log().as_mut() {
            debug!(cid, "Saving state");
            log.new_checkpoint(state, hash, cid);
        }
    }

    /// Append a delivery batch to the log, one entry per consensus id
    fn save_commands(&self, batch: PendingCommands) {
        let mut log = self.log();
        let Some(log) = log.as_mut() else {
            return;
        };
        if batch.commands.len() != batch.contexts.len() {
            debug!(
                commands = batch.commands.len(),
                contexts = batch.contexts.len(),
                "Commands and contexts differ in size"
            );
        }

        let mut runs: Vec<(ConsensusId, CommandsInfo)> = Vec::new();
        for (command, context) in batch.commands.into_iter().zip(batch.contexts) {
            match runs.last_mut() {
                Some((cid, info)) if *cid == context.consensus_id => {
                    info.commands.push(command);
                    info.contexts.push(context);
                }
                _ => runs.push((
                    context.consensus_id,
                    CommandsInfo::new(vec![command], vec![context]),
                )),
            }
        }
        for (cid, info) in runs {
            log.add_message_batch(info.commands, info.contexts, cid);
        }
        debug!(batches = log.num_batches(), "Commands saved");
    }

    /// State up to `cid` for a replica catching up, or an empty state when
    /// `cid` is `None` or no certified state is available
    pub fn get_state(&self, cid: Option<ConsensusId>, send_state: bool) -> ApplicationState {
        let log = self.log();
        debug!(?cid, "Getting state");
        let state = cid.and_then(|cid| log.as_ref()?.application_state(cid, send_state));
        match state {
            Some(state) if !self.config.bft || state.has_certified_decision() => state,
            _ => ApplicationState {
                process_id: self.process_id,
                ..Default::default()
            },
        }
    }

    /// Install a state received from another replica and replay its logged
    /// client commands, returning the last consensus id now reflected
    #[instrument(skip_all, fields(process_id = self.process_id, from = ?state.last_checkpoint_cid, to = ?state.last_cid))]
    pub fn set_state(&self, state: &ApplicationState) -> Option<ConsensusId> {
        let Some(last_cid) = state.last_cid else {
            warn!("Ignoring empty state");
            return None;
        };
        info!("Updating state");

        let mut executor = self.executor();
        let mut log = self.log();
        if let Some(log) = log.as_mut() {
            log.update(state);
        }

        if let Some(serialized) = &state.state {
            match ConfidentialSnapshot::deserialize(serialized) {
                Ok(snapshot) => {
                    info!(cid = ?state.last_checkpoint_cid, "Installing snapshot");
                    executor.install_confidential_snapshot(snapshot);
                }
                Err(e) => error!(error = %e, "Failed to install snapshot"),
            }
        }

        let first = match state.last_checkpoint_cid {
            Some(checkpoint) => checkpoint.checked_add(1),
            None => state.message_batches.keys().next().copied(),
        };
        if let Some(first) = first.filter(|first| *first <= last_cid) {
            let mut next = Some(first);
            for (&cid, batch) in state.message_batches.range(first..=last_cid) {
                if let Some(expected) = next.filter(|expected| *expected < cid) {
                    warn!(from = expected, to = cid - 1, "Missing batches");
                }
                next = cid.checked_add(1);
                if batch.is_no_op() {
                    continue;
                }
                for (command, context) in batch.commands.iter().zip(&batch.contexts) {
                    match Request::deserialize(command) {
                        Ok(request) if request.kind == MessageType::Client => {
                            executor.app_execute_ordered(
                                request.plain_data.as_deref(),
                                request.shares.as_deref().unwrap_or_default(),
                                context,
                            );
                        }
                        Ok(request) => debug!(cid, kind = ?request.kind, "Skipping command"),
                        Err(e) => error!(cid, error = %e, "Failed to replay command"),
                    }
                }
            }
            if let Some(expected) = next.filter(|expected| *expected <= last_cid) {
                warn!(from = expected, to = last_cid, "Missing batches");
            }
        }
        drop(log);
        drop(executor);

        self.state_manager.set_last_cid(last_cid);
        Some(last_cid)
    }

    /// Register joining servers and stage the reconfiguration
    #[instrument(skip_all, fields(process_id = self.process_id), err)]
    pub fn on_reconfiguration_request(&self, content: &[u8]) -> Result<()> {
        let request = BatchReconfigurationRequest::deserialize(content)?;
        let joining = request.joining_process_ids()?;
        for process_id in &joining {
            if let Err(e) = self
                .scheme
                .add_shareholder(*process_id, ShareholderId::for_process(*process_id))
            {
                error!(process_id, error = %e, "Failed to add joining server as shareholder");
            }
        }
        self.state_manager
            .set_reconfiguration_parameters(ReconfigurationParameters {
                new_f: request.f,
                joining_servers: joining.into_iter().collect(),
                leaving_servers: request.leaving_servers.into_iter().collect(),
            });
        Ok(())
    }

    pub fn on_reconfiguration_complete(&self, consensus_id: ConsensusId) {
        info!(
            process_id = self.process_id,
            cid = consensus_id,
            parameters = ?self.state_manager.reconfiguration_parameters(),
            "Reconfiguration complete"
        );
        if let Err(e) = self.state_manager.execute_reconfiguration(consensus_id) {
            error!(process_id = self.process_id, cid = consensus_id, error = %e, "Failed to execute reconfiguration");
        }
    }

    pub fn on_reconfiguration_failure(&self) {
        error!(process_id = self.process_id, "Reconfiguration failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_client_request, EncodedRequest};
    use crate::crypto::commitment::encode_point;
    use crate::crypto::{Commitment, CommitmentSchemeKind};
    use crate::testing::{context, local_cluster, seal_secrets, Cluster, CLIENT_ID};
    use k256::ProjectivePoint;
    use std::collections::BTreeMap;

    fn executed(engine: &ConfidentialRecoverable) -> u64 {
        let snapshot = engine.executor().get_confidential_snapshot();
        snapshot
            .plain_data
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(u64::from_be_bytes)
            .unwrap()
    }

    fn plain_request(data: &[u8]) -> Vec<u8> {
        Request::client(Some(data.to_vec()), None).encode().unwrap()
    }

    #[tokio::test]
    async fn test_no_op_batch_is_logged_as_reconfiguration() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let engine = &local.replicas[0].engine;

        let operations = vec![plain_request(b"a"), plain_request(b"b")];
        let contexts = vec![context(CLIENT_ID, 0, false), context(CLIENT_ID, 0, false)];
        engine.no_op(7, &operations, &contexts);

        {
            let log = engine.log();
            let log = log.as_ref().unwrap();
            assert_eq!(log.num_batches(), 1);
            let batch = log.message_batch(7).unwrap();
            assert_eq!(batch.commands.len(), 2);
            assert!(batch.is_no_op());
            for command in &batch.commands {
                let request = Request::deserialize(command).unwrap();
                assert_eq!(request.kind, MessageType::Reconfiguration);
            }
        }
        assert_eq!(executed(engine), 0);
        assert_eq!(local.replicas[0].state_manager.last_cid(), Some(7));
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_tampered_commitment_fails_verification() {
        let cluster = Cluster::new(1);
        let config = Configuration {
            verify_client_requests: true,
            ..Default::default()
        };
        let local = local_cluster(&cluster, config);
        let shareholders = cluster.client.shareholders();

        let mut secrets = seal_secrets(&cluster, &[b"secret"], 3);
        let Commitment::Feldman(points) = &mut secrets[0].commitment else {
            panic!("expected feldman commitment");
        };
        points[0] = encode_point(&ProjectivePoint::GENERATOR);
        let EncodedRequest::Split { common, private } =
            encode_client_request(Some(b"op"), Some(&secrets), false, &shareholders).unwrap()
        else {
            panic!("expected split layout");
        };

        let inbound = InboundRequest {
            sender: CLIENT_ID,
            metadata: Some(vec![Metadata::Verify.tag()]),
            content: common.clone(),
            private_content: private.get(&0).cloned(),
            ..Default::default()
        };
        assert!(!local.replicas[0].engine.is_valid_request(&inbound));
        assert!(local
            .sequencer
            .order(CLIENT_ID, Metadata::Verify, &common, &private)
            .is_none());
        for replica in &local.replicas {
            assert_eq!(executed(&replica.engine), 0);
            assert!(replica.engine.verified_requests.is_empty());
        }
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_verified_request_is_cached_until_ordered() {
        let cluster = Cluster::new(1);
        let config = Configuration {
            verify_client_requests: true,
            ..Default::default()
        };
        let local = local_cluster(&cluster, config);
        let shareholders = cluster.client.shareholders();
        let secrets = seal_secrets(&cluster, &[b"secret"], 4);
        let EncodedRequest::Split { common, private } =
            encode_client_request(None, Some(&secrets), false, &shareholders).unwrap()
        else {
            panic!("expected split layout");
        };

        let engine = &local.replicas[1].engine;
        let inbound = InboundRequest {
            sender: CLIENT_ID,
            session: 2,
            sequence: 5,
            metadata: Some(vec![Metadata::Verify.tag()]),
            content: common,
            private_content: private.get(&1).cloned(),
        };
        assert!(engine.is_valid_request(&inbound));
        assert_eq!(engine.verified_requests.len(), 1);

        let mut ctx = context(CLIENT_ID, 1, true);
        ctx.session = 2;
        ctx.sequence = 5;
        // the cached request is used, so the bytes are never decoded again
        assert!(engine.execute_ordered(b"garbage", None, &ctx).is_some());
        assert!(engine.verified_requests.is_empty());
        assert_eq!(executed(engine), 1);

        let unknown = InboundRequest {
            metadata: Some(vec![9]),
            ..Default::default()
        };
        assert!(!engine.is_valid_request(&unknown));
        assert!(engine.is_valid_request(&InboundRequest::default()));
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoints_follow_period() {
        let cluster = Cluster::new(1);
        let config = Configuration {
            checkpoint_period: 3,
            ..Default::default()
        };
        let local = local_cluster(&cluster, config);

        for i in 1..=8u8 {
            let replies = local
                .sequencer
                .order(CLIENT_ID, Metadata::DoesNotVerify, &plain_request(&[i]), &BTreeMap::new())
                .unwrap();
            assert!(replies.iter().all(Option::is_some));
        }

        for replica in &local.replicas {
            let engine = &replica.engine;
            {
                let log = engine.log();
                let log = log.as_ref().unwrap();
                assert_eq!(log.last_checkpoint_cid(), Some(6));
                assert_eq!(log.last_cid(), Some(8));
                assert_eq!(
                    log.message_batches().map(|(cid, _)| *cid).collect::<Vec<_>>(),
                    vec![7, 8]
                );
                let snapshot = ConfidentialSnapshot::deserialize(log.state()).unwrap();
                assert_eq!(snapshot.plain_data, Some(6u64.to_be_bytes().to_vec()));
            }
            assert_eq!(replica.state_manager.last_cid(), Some(8));

            let state = engine.get_state(Some(8), true);
            assert!(state.has_certified_decision());
            assert!(engine.get_state(Some(2), true).is_empty());
            assert!(engine.get_state(None, true).is_empty());
        }
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_state_replays_client_commands() {
        let cluster = Cluster::new(1);
        let source = local_cluster(&cluster, Configuration::default());
        for i in 1..=3u8 {
            source
                .sequencer
                .order(CLIENT_ID, Metadata::DoesNotVerify, &plain_request(&[i]), &BTreeMap::new())
                .unwrap();
        }
        let engine = &source.replicas[0].engine;
        engine.execute_ordered(
            &Request::application(vec![InterServersMessageType::PolynomialProposal.tag()])
                .encode()
                .unwrap(),
            None,
            &context(2, 4, true),
        );
        engine.no_op(5, &[plain_request(b"late")], &[context(CLIENT_ID, 5, true)]);
        let state = engine.get_state(Some(5), true);
        assert_eq!(state.message_batches.len(), 5);

        let other = Cluster::new(1);
        let target = local_cluster(&other, Configuration::default());
        let replica = &target.replicas[2];
        assert_eq!(replica.engine.set_state(&state), Some(5));
        assert_eq!(executed(&replica.engine), 3);
        assert_eq!(replica.state_manager.last_cid(), Some(5));
        assert_eq!(
            replica.engine.log().as_ref().unwrap().last_cid(),
            Some(5)
        );
        assert_eq!(replica.engine.set_state(&ApplicationState::default()), None);

        source.shutdown().await;
        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_state_with_extreme_ids() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let replica = &local.replicas[0];

        let at_max = ApplicationState {
            last_checkpoint_cid: Some(u64::MAX),
            last_cid: Some(u64::MAX),
            ..Default::default()
        };
        assert_eq!(replica.engine.set_state(&at_max), Some(u64::MAX));
        assert_eq!(executed(&replica.engine), 0);

        let command = Request::client(Some(b"far".to_vec()), None).serialize().unwrap();
        let mut sparse = ApplicationState {
            last_checkpoint_cid: Some(0),
            last_cid: Some(u64::MAX),
            ..Default::default()
        };
        for cid in [2, 1 << 40] {
            sparse.message_batches.insert(
                cid,
                CommandsInfo::new(vec![command.clone()], vec![context(CLIENT_ID, cid, true)]),
            );
        }
        assert_eq!(replica.engine.set_state(&sparse), Some(u64::MAX));
        assert_eq!(executed(&replica.engine), 2);
        assert_eq!(replica.state_manager.last_cid(), Some(u64::MAX));
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_response_shares_are_sealed_for_the_client() {
        let cluster = Cluster::with_commitments(1, CommitmentSchemeKind::Merkle);
        let local = local_cluster(&cluster, Configuration::default());
        let shareholders = cluster.client.shareholders();
        let secrets = seal_secrets(&cluster, &[b"sealed"], 5);
        let EncodedRequest::Split { common, private } =
            encode_client_request(Some(b"put"), Some(&secrets), false, &shareholders).unwrap()
        else {
            panic!("expected split layout");
        };

        let replies = local
            .sequencer
            .order(CLIENT_ID, Metadata::Verify, &common, &private)
            .unwrap();
        for (pid, reply) in replies.into_iter().enumerate() {
            let response = EncryptedConfidentialMessage::deserialize(&reply.unwrap()).unwrap();
            assert_eq!(response.plain_data.as_deref(), Some(&b"put"[..]));
            let sealed = response.shares[0].as_ref().unwrap();
            assert_eq!(sealed.shareholder, ShareholderId::for_process(pid as ProcessId));
            let share = cluster.client.decrypt_share_for(CLIENT_ID, &sealed.share).unwrap();
            assert_eq!(share.shareholder, sealed.shareholder);
        }

        // a client without a registered key gets an empty entry
        let ctx = context(4242, 2, true);
        let reply = local.replicas[0]
            .engine
            .execute_ordered(&common, private.get(&0).map(Vec::as_slice), &ctx)
            .unwrap();
        let response = EncryptedConfidentialMessage::deserialize(&reply).unwrap();
        assert_eq!(response.shares, vec![None]);
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_unordered_execution_leaves_the_log_untouched() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let shareholders = cluster.client.shareholders();
        let secrets = seal_secrets(&cluster, &[b"kept"], 6);
        let EncodedRequest::Split { common, private } =
            encode_client_request(Some(b"put"), Some(&secrets), false, &shareholders).unwrap()
        else {
            panic!("expected split layout");
        };
        local
            .sequencer
            .order(CLIENT_ID, Metadata::Verify, &common, &private)
            .unwrap();

        let replica = &local.replicas[1];
        let engine = &replica.engine;
        let batches = engine.log().as_ref().unwrap().num_batches();
        let last_cid = replica.state_manager.last_cid();

        // client requests read the application and come back sealed
        let reply = engine
            .execute_unordered(&plain_request(b"get"), None, &context(CLIENT_ID, 0, true))
            .unwrap();
        let response = EncryptedConfidentialMessage::deserialize(&reply).unwrap();
        assert_eq!(response.plain_data, Some(1u64.to_be_bytes().to_vec()));
        let sealed = response.shares[0].as_ref().unwrap();
        let share = cluster.client.decrypt_share_for(CLIENT_ID, &sealed.share).unwrap();
        assert_eq!(share.shareholder, ShareholderId::for_process(1));

        // application payloads go to inter-server delivery with an empty ack
        let proposal = crate::polynomial::PolynomialProposal {
            creation_id: 77,
            sender: 2,
            commitments: Vec::new(),
            points: BTreeMap::new(),
        };
        let mut payload = vec![InterServersMessageType::PolynomialProposal.tag()];
        payload.extend(proposal.serialize().unwrap());
        let ack = engine.execute_unordered(
            &Request::application(payload).encode().unwrap(),
            None,
            &context(2, 0, true),
        );
        assert_eq!(ack, Some(Vec::new()));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(replica.distributed.buffered_messages(), 1);

        let reconfiguration = Request::reconfiguration(b"{}".to_vec()).encode().unwrap();
        assert_eq!(
            engine.execute_unordered(&reconfiguration, None, &context(CLIENT_ID, 0, true)),
            None
        );
        assert_eq!(engine.execute_unordered(b"garbage", None, &context(CLIENT_ID, 0, true)), None);

        assert_eq!(engine.log().as_ref().unwrap().num_batches(), batches);
        assert_eq!(replica.state_manager.last_cid(), last_cid);
        assert_eq!(executed(engine), 1);
        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfiguration_request_registers_joining_servers() {
        let cluster = Cluster::new(1);
        let local = local_cluster(&cluster, Configuration::default());
        let engine = &local.replicas[0].engine;

        let request = BatchReconfigurationRequest {
            joining_servers: vec!["7:127.0.0.1:11070".into()],
            leaving_servers: vec![3],
            f: 1,
        };
        engine
            .on_reconfiguration_request(&request.serialize().unwrap())
            .unwrap();
        assert_eq!(cluster.replicas[0].shareholder_of(7), Some(ShareholderId(8)));
        let parameters = engine.state_manager().reconfiguration_parameters().unwrap();
        assert_eq!(parameters.new_f, 1);
        assert!(parameters.joining_servers.contains(&7));
        assert!(parameters.leaving_servers.contains(&3));

        let malformed = BatchReconfigurationRequest {
            joining_servers: vec!["8:h:1".into(), "bad".into()],
            leaving_servers: vec![],
            f: 1,
        };
        assert!(engine
            .on_reconfiguration_request(&malformed.serialize().unwrap())
            .is_err());
        assert_eq!(cluster.replicas[0].shareholder_of(8), None);
        assert!(engine.on_reconfiguration_request(b"not json").is_err());
        local.shutdown().await;
    }
}
