//! Confidential node CLI
//!
//! Command-line interface for the confidentiality layer:
//! - Key material generation
//! - In-process cluster simulation of a confidential request
//! - Resharing round over the simulated cluster

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use confidential_core::client::{ExtractedResponse, RequestType, ServersResponseHandler, ServiceReply};
use confidential_core::codec::{encode_client_request, EncodedRequest};
use confidential_core::crypto::{ConfidentialityScheme, KeyPair};
use confidential_core::server::{ConfidentialExecutable, LocalCluster};
use confidential_core::statemanagement::BatchReconfigurationRequest;
use confidential_core::types::{ConfidentialMessage, ConfidentialSnapshot, VerifiableShare};
use confidential_core::{Configuration, MessageContext, Metadata, ProcessId, ShareholderId};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// Confidential Node - confidentiality layer for BFT replication
#[derive(Parser)]
#[command(name = "confidential-node")]
#[command(about = "Confidentiality layer node for BFT state machine replication")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Process ID of this node
    #[arg(short, long, env = "PROCESS_ID", default_value_t = 0)]
    process_id: ProcessId,

    /// Data directory for key material
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the x25519 key pair of this process
    Keys {
        /// Derive the public key of an existing hex encoded secret instead
        #[arg(long)]
        from: Option<String>,
    },

    /// Run an in-process cluster and reconstruct one confidential request
    Simulate {
        /// Fault threshold; the cluster has 3f+1 replicas
        #[arg(short, long, default_value_t = 1)]
        f: usize,

        /// Plain part of the request
        #[arg(long, default_value = "ping")]
        plain: String,

        /// Secret shared among the replicas
        #[arg(long, default_value = "top secret")]
        secret: String,

        /// Client process ID
        #[arg(long, default_value_t = 1000)]
        client_id: ProcessId,

        /// Run a resharing round afterwards
        #[arg(long)]
        reshare: bool,
    },
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    process_id: ProcessId,
    public_key: String,
    secret_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Configuration::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    };

    match cli.command {
        Commands::Keys { ref from } => {
            generate_keys(&cli, from.as_deref())?;
        }
        Commands::Simulate {
            f,
            ref plain,
            ref secret,
            client_id,
            reshare,
        } => {
            simulate(&config, f, plain, secret, client_id, reshare).await?;
        }
    }

    Ok(())
}

fn generate_keys(cli: &Cli, from: Option<&str>) -> Result<()> {
    let keys = match from {
        Some(secret) => KeyPair::from_hex(secret)?,
        None => KeyPair::generate(),
    };
    let public_key = hex::encode(keys.public().as_bytes());

    if from.is_none() {
        std::fs::create_dir_all(&cli.dest)?;
        let path = cli.dest.join(format!("keys.{}.json", cli.process_id));
        let file = KeyFile {
            process_id: cli.process_id,
            public_key: public_key.clone(),
            secret_key: keys.secret_hex(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        info!(process_id = cli.process_id, path = ?path, "Key pair saved");
    }

    println!("Public Key: {}", public_key);
    Ok(())
}

/// Stores the shares it receives under the request's plain data and answers
/// with the shares stored under that key
#[derive(Default)]
struct SecretStore {
    entries: BTreeMap<Vec<u8>, Vec<VerifiableShare>>,
}

#[derive(Serialize, Deserialize)]
struct StoreIndex {
    keys: Vec<(Vec<u8>, usize)>,
}

impl ConfidentialExecutable for SecretStore {
    fn app_execute_ordered(
        &mut self,
        plain_data: Option<&[u8]>,
        shares: &[VerifiableShare],
        context: &MessageContext,
    ) -> ConfidentialMessage {
        let key = plain_data.unwrap_or_default().to_vec();
        if !shares.is_empty() {
            info!(sender = context.sender, cid = context.consensus_id, "Storing shares");
            self.entries.insert(key.clone(), shares.to_vec());
        }
        self.app_execute_unordered(Some(&key), &[], context)
    }

    fn app_execute_unordered(
        &mut self,
        plain_data: Option<&[u8]>,
        _shares: &[VerifiableShare],
        _context: &MessageContext,
    ) -> ConfidentialMessage {
        let key = plain_data.unwrap_or_default();
        ConfidentialMessage::new(
            Some(key.to_vec()),
            self.entries.get(key).cloned().unwrap_or_default(),
        )
    }

    fn get_confidential_snapshot(&self) -> ConfidentialSnapshot {
        let index = StoreIndex {
            keys: self
                .entries
                .iter()
                .map(|(key, shares)| (key.clone(), shares.len()))
                .collect(),
        };
        ConfidentialSnapshot::new(
            serde_json::to_vec(&index).ok(),
            self.entries.values().flatten().cloned().collect(),
        )
    }

    fn install_confidential_snapshot(&mut self, snapshot: ConfidentialSnapshot) {
        let index: StoreIndex = match snapshot
            .plain_data
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
        {
            Ok(index) => index.unwrap_or(StoreIndex { keys: Vec::new() }),
            Err(e) => {
                warn!(error = %e, "Invalid snapshot index");
                return;
            }
        };
        let mut shares = snapshot.shares.into_iter();
        self.entries = index
            .keys
            .into_iter()
            .map(|(key, count)| (key, shares.by_ref().take(count).collect()))
            .collect();
    }
}

/// Client scheme plus one scheme per replica, all knowing each other's keys
fn build_schemes(
    config: &Configuration,
    f: usize,
    client_id: ProcessId,
) -> Result<(Arc<ConfidentialityScheme>, Vec<Arc<ConfidentialityScheme>>)> {
    let n = 3 * f + 1;
    if (client_id as usize) < n {
        bail!("Client ID {} collides with a replica ID", client_id);
    }
    let scheme = |process_id| {
        Arc::new(ConfidentialityScheme::new(
            process_id,
            KeyPair::generate(),
            f,
            config.commitment_scheme.build(),
        ))
    };
    let client = scheme(client_id);
    let replicas: Vec<_> = (0..n as ProcessId).map(scheme).collect();

    for member in replicas.iter().chain(std::iter::once(&client)) {
        for other in replicas.iter().chain(std::iter::once(&client)) {
            member.register_process(other.process_id(), other.public_key());
        }
        for replica in &replicas {
            member.add_shareholder(
                replica.process_id(),
                ShareholderId::for_process(replica.process_id()),
            )?;
        }
    }
    Ok((client, replicas))
}

async fn simulate(
    config: &Configuration,
    f: usize,
    plain: &str,
    secret: &str,
    client_id: ProcessId,
    reshare: bool,
) -> Result<()> {
    info!(f, replicas = 3 * f + 1, "Starting simulated cluster");
    let (client, replicas) = build_schemes(config, f, client_id)?;
    let cluster = LocalCluster::start(
        config,
        &replicas,
        |_| Box::new(SecretStore::default()),
        None,
    )?;

    let published = client.share(secret.as_bytes(), &mut OsRng)?;
    let sealed = client.encrypt_published(&published)?;
    let (common, private) = match encode_client_request(
        Some(plain.as_bytes()),
        Some(&[sealed]),
        config.send_all_shares_together,
        &client.shareholders(),
    )? {
        EncodedRequest::Combined(common) => (common, BTreeMap::new()),
        EncodedRequest::Split { common, private } => (common, private),
    };

    let replies: Vec<Option<ServiceReply>> = cluster
        .sequencer
        .order(client_id, Metadata::Verify, &common, &private)
        .ok_or_else(|| anyhow!("Request rejected by the replicas"))?
        .into_iter()
        .zip(replicas.iter())
        .map(|(content, replica)| {
            content.map(|content| ServiceReply {
                sender: replica.process_id(),
                session: 0,
                sequence: 1,
                operation_id: 1,
                view_id: 0,
                request_type: RequestType::Ordered,
                content,
            })
        })
        .collect();

    let handler = ServersResponseHandler::new(client.clone());
    let reply = handler
        .extract_response(&replies, 2 * f + 1, 0)
        .ok_or_else(|| anyhow!("Not enough equivalent replies"))?;
    let response = ExtractedResponse::deserialize(&reply.content)?;
    if let Some(error) = &response.error {
        bail!("Reconstruction failed: {}", error);
    }

    println!(
        "Plain: {}",
        String::from_utf8_lossy(response.plain_data.as_deref().unwrap_or_default())
    );
    for secret in &response.confidential_data {
        println!("Secret: {}", String::from_utf8_lossy(secret));
    }

    if reshare {
        run_resharing(&cluster, f).await?;
    }

    cluster.shutdown().await;
    Ok(())
}

async fn run_resharing(cluster: &LocalCluster, f: usize) -> Result<()> {
    let mut receivers: Vec<_> = cluster
        .replicas
        .iter()
        .map(|replica| replica.state_manager.subscribe())
        .collect();

    let request = BatchReconfigurationRequest {
        joining_servers: Vec::new(),
        leaving_servers: Vec::new(),
        f,
    }
    .serialize()?;
    let consensus_id = cluster.replicas[0]
        .state_manager
        .last_cid()
        .map_or(1, |cid| cid + 1);
    info!(cid = consensus_id, "Starting resharing");
    for replica in &cluster.replicas {
        replica.engine.on_reconfiguration_request(&request)?;
        replica.engine.on_reconfiguration_complete(consensus_id);
    }

    let mut succeeded = 0;
    for receiver in &mut receivers {
        let outcome = tokio::time::timeout(Duration::from_secs(30), receiver.recv())
            .await
            .context("Resharing timed out")??;
        match outcome.result {
            Ok(points) => {
                succeeded += 1;
                info!(creation_id = outcome.context.id, points = points.len(), "Resharing succeeded");
            }
            Err(error) => warn!(creation_id = outcome.context.id, %error, "Resharing failed"),
        }
    }
    println!("Resharing: {}/{} replicas succeeded", succeeded, cluster.replicas.len());
    Ok(())
}
