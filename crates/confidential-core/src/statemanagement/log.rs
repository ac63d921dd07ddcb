//! In-memory command log with periodic checkpoints

use crate::types::{ConsensusId, MessageContext, ProcessId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Commands delivered under one consensus id, with their contexts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsInfo {
    pub commands: Vec<Vec<u8>>,
    pub contexts: Vec<MessageContext>,
}

impl CommandsInfo {
    pub fn new(commands: Vec<Vec<u8>>, contexts: Vec<MessageContext>) -> Self {
        Self { commands, contexts }
    }

    pub fn is_no_op(&self) -> bool {
        self.contexts.first().is_some_and(|context| context.no_op)
    }
}

/// State exchanged during state transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationState {
    pub process_id: ProcessId,
    pub last_checkpoint_cid: Option<ConsensusId>,
    pub last_cid: Option<ConsensusId>,
    /// Serialized snapshot at the last checkpoint, when requested
    pub state: Option<Vec<u8>>,
    pub state_hash: Option<[u8; 32]>,
    /// Batches after the last checkpoint
    pub message_batches: BTreeMap<ConsensusId, CommandsInfo>,
}

impl ApplicationState {
    pub fn is_empty(&self) -> bool {
        self.last_cid.is_none()
    }

    /// Whether the state is internally consistent: the snapshot matches its
    /// hash and every batch up to the last id is present
    pub fn has_certified_decision(&self) -> bool {
        let Some(last_cid) = self.last_cid else {
            return false;
        };
        if let (Some(state), Some(hash)) = (&self.state, &self.state_hash) {
            if blake3::hash(state).as_bytes() != hash {
                return false;
            }
        }
        let first = match self.last_checkpoint_cid {
            Some(checkpoint) => match checkpoint.checked_add(1) {
                Some(first) => first,
                None => return last_cid == checkpoint,
            },
            None => match self.message_batches.keys().next() {
                Some(first) => *first,
                None => return false,
            },
        };
        if first > last_cid {
            return true;
        }
        let present = self.message_batches.range(first..=last_cid).count() as u64;
        (last_cid - first).checked_add(1) == Some(present)
    }
}

/// Log of the batches delivered since the last checkpoint
pub struct ConfidentialStateLog {
    process_id: ProcessId,
    checkpoint_period: u64,
    state: Vec<u8>,
    state_hash: [u8; 32],
    batches: BTreeMap<ConsensusId, CommandsInfo>,
    last_checkpoint_cid: Option<ConsensusId>,
    last_cid: Option<ConsensusId>,
}

impl ConfidentialStateLog {
    pub fn new(process_id: ProcessId, checkpoint_period: u64, state: Vec<u8>, state_hash: [u8; 32]) -> Self {
        Self {
            process_id,
            checkpoint_period,
            state,
            state_hash,
            batches: BTreeMap::new(),
            last_checkpoint_cid: None,
            last_cid: None,
        }
    }

    pub fn checkpoint_period(&self) -> u64 {
        self.checkpoint_period
    }

    pub fn last_checkpoint_cid(&self) -> Option<ConsensusId> {
        self.last_checkpoint_cid
    }

    pub fn last_cid(&self) -> Option<ConsensusId> {
        self.last_cid
    }

    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    /// Replace the log with a snapshot taken at `cid`
    pub fn new_checkpoint(&mut self, state: Vec<u8>, state_hash: [u8; 32], cid: ConsensusId) {
        self.state = state;
        self.state_hash = state_hash;
        self.batches.retain(|batch_cid, _| *batch_cid > cid);
        self.last_checkpoint_cid = Some(cid);
        self.last_cid = Some(self.last_cid.map_or(cid, |last| last.max(cid)));
        debug!(process_id = self.process_id, cid, "Checkpoint stored");
    }

    /// Append a batch, extending an existing batch for the same id
    pub fn add_message_batch(&mut self, commands: Vec<Vec<u8>>, contexts: Vec<MessageContext>, cid: ConsensusId) {
        let batch = self.batches.entry(cid).or_default();
        batch.commands.extend(commands);
        batch.contexts.extend(contexts);
        self.last_cid = Some(self.last_cid.map_or(cid, |last| last.max(cid)));
    }

    pub fn message_batch(&self, cid: ConsensusId) -> Option<&CommandsInfo> {
        self.batches.get(&cid)
    }

    pub fn message_batches(&self) -> impl Iterator<Item = (&ConsensusId, &CommandsInfo)> {
        self.batches.iter()
    }

    /// State up to `cid`, with the snapshot itself only when `send_state`
    pub fn application_state(&self, cid: ConsensusId, send_state: bool) -> Option<ApplicationState> {
        let last_cid = self.last_cid?;
        if cid > last_cid || self.last_checkpoint_cid.is_some_and(|checkpoint| cid < checkpoint) {
            return None;
        }
        Some(ApplicationState {
            process_id: self.process_id,
            last_checkpoint_cid: self.last_checkpoint_cid,
            last_cid: Some(cid),
            state: send_state.then(|| self.state.clone()),
            state_hash: Some(self.state_hash),
            message_batches: self
                .batches
                .range(..=cid)
                .map(|(cid, batch)| (*cid, batch.clone()))
                .collect(),
        })
    }

    /// Adopt a state received from another replica
    pub fn update(&mut self, state: &ApplicationState) {
        if let Some(snapshot) = &state.state {
            self.state = snapshot.clone();
            self.state_hash = state
                .state_hash
                .unwrap_or_else(|| *blake3::hash(snapshot).as_bytes());
        }
        self.last_checkpoint_cid = state.last_checkpoint_cid;
        self.batches = state.message_batches.clone();
        self.last_cid = state.last_cid;
    }
}
