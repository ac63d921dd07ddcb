//! Fixtures shared by unit tests

use crate::config::Configuration;
use crate::crypto::{CommitmentSchemeKind, ConfidentialityScheme, EncryptedPublishedShares, KeyPair};
use crate::server::{ConfidentialExecutable, LocalCluster};
use crate::types::{
    ConfidentialMessage, ConfidentialSnapshot, ConsensusId, MessageContext, ProcessId,
    ShareholderId, VerifiableShare,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;

pub const CLIENT_ID: ProcessId = 1000;

/// `3f + 1` replica schemes plus one client scheme, all knowing each other
pub struct Cluster {
    pub f: usize,
    pub client: Arc<ConfidentialityScheme>,
    pub replicas: Vec<Arc<ConfidentialityScheme>>,
}

impl Cluster {
    pub fn new(f: usize) -> Self {
        Self::with_commitments(f, CommitmentSchemeKind::Feldman)
    }

    pub fn with_commitments(f: usize, kind: CommitmentSchemeKind) -> Self {
        let n = 3 * f + 1;
        let client = Arc::new(ConfidentialityScheme::new(
            CLIENT_ID,
            KeyPair::generate(),
            f,
            kind.build(),
        ));
        let replicas: Vec<_> = (0..n as ProcessId)
            .map(|pid| {
                Arc::new(ConfidentialityScheme::new(pid, KeyPair::generate(), f, kind.build()))
            })
            .collect();

        let everyone: Vec<_> = replicas.iter().chain(std::iter::once(&client)).cloned().collect();
        for scheme in &everyone {
            for other in &everyone {
                scheme.register_process(other.process_id(), other.public_key());
            }
            for replica in &replicas {
                scheme
                    .add_shareholder(replica.process_id(), ShareholderId::for_process(replica.process_id()))
                    .unwrap();
            }
        }

        Self { f, client, replicas }
    }
}

/// Secrets dealt by the client and sealed for every replica
pub fn seal_secrets(cluster: &Cluster, secrets: &[&[u8]], seed: u64) -> Vec<EncryptedPublishedShares> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    secrets
        .iter()
        .map(|secret| {
            let published = cluster.client.share(secret, &mut rng).unwrap();
            cluster.client.encrypt_published(&published).unwrap()
        })
        .collect()
}

/// Route test logs through the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Replicas of `cluster` running [`EchoStore`], wired over the in-memory network
pub fn local_cluster(cluster: &Cluster, config: Configuration) -> LocalCluster {
    init_tracing();
    LocalCluster::start(
        &config,
        &cluster.replicas,
        |_| Box::new(EchoStore::default()),
        Some(7),
    )
    .unwrap()
}

pub fn context(sender: ProcessId, consensus_id: ConsensusId, last_in_batch: bool) -> MessageContext {
    MessageContext {
        sender,
        consensus_id,
        last_in_batch,
        ..Default::default()
    }
}

/// Counts ordered executions, keeps every share it receives and echoes
/// requests. Unordered requests read the count and the stored shares.
#[derive(Default)]
pub struct EchoStore {
    pub executed: u64,
    pub stored: Vec<VerifiableShare>,
}

impl ConfidentialExecutable for EchoStore {
    fn app_execute_ordered(
        &mut self,
        plain_data: Option<&[u8]>,
        shares: &[VerifiableShare],
        _context: &MessageContext,
    ) -> ConfidentialMessage {
        self.executed += 1;
        self.stored.extend_from_slice(shares);
        ConfidentialMessage::new(plain_data.map(<[u8]>::to_vec), shares.to_vec())
    }

    fn app_execute_unordered(
        &mut self,
        _plain_data: Option<&[u8]>,
        _shares: &[VerifiableShare],
        _context: &MessageContext,
    ) -> ConfidentialMessage {
        ConfidentialMessage::new(Some(self.executed.to_be_bytes().to_vec()), self.stored.clone())
    }

    fn get_confidential_snapshot(&self) -> ConfidentialSnapshot {
        ConfidentialSnapshot::new(Some(self.executed.to_be_bytes().to_vec()), self.stored.clone())
    }

    fn install_confidential_snapshot(&mut self, snapshot: ConfidentialSnapshot) {
        self.executed = snapshot
            .plain_data
            .as_deref()
            .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(u64::from_be_bytes)
            .unwrap_or_default();
        self.stored = snapshot.shares;
    }
}
