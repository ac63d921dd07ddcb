//! # Confidential Core
//!
//! Confidentiality layer of a Byzantine fault-tolerant replicated state
//! machine.
//!
//! Clients secret-share their data among the replicas, the replicas execute
//! on their shares without any coalition of at most `f` of them learning the
//! secret, and the client combines a quorum of replies into one response.
//!
//! This crate provides:
//! - The request codec carrying plain data and sealed shares through an
//!   untrusted ordering layer
//! - The confidential execution engine with checkpointing and state transfer
//! - Distributed creation of resharing and recovery polynomials
//! - Client side reconciliation of replica replies
//!
//! ## Example
//!
//! ```rust,ignore
//! use confidential_core::{client::ServersResponseHandler, codec::encode_client_request};
//!
//! let sealed = scheme.encrypt_published(&scheme.share(b"secret", &mut rng)?)?;
//! let request = encode_client_request(Some(b"put"), Some(&[sealed]), false, &scheme.shareholders())?;
//! // submit through the ordering layer, then:
//! let reply = ServersResponseHandler::new(scheme).extract_response(&replies, 2 * f + 1, last)?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod polynomial;
pub mod server;
pub mod statemanagement;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Configuration;
pub use error::{Error, Result};
pub use types::{ConsensusId, MessageContext, MessageType, Metadata, ProcessId, ShareholderId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
