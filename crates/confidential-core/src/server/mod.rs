//! Replica side of the confidentiality layer

mod communication;
mod memory;
mod recoverable;
mod request_cache;

pub use communication::{
    InterServerMessage, InterServersCommunication, InterServersMessageType, ServerTransport,
};
pub use memory::{
    LocalCluster, LocalReplica, MemoryNetwork, MemorySequencer, MemoryTransport,
    OrderedSubmission,
};
pub use recoverable::ConfidentialRecoverable;
pub use request_cache::{RequestCache, RequestKey};

use crate::types::{ConfidentialMessage, ConfidentialSnapshot, MessageContext, VerifiableShare};

/// Application executed over secret-shared data.
///
/// The engine serializes every call through its execution lock.
pub trait ConfidentialExecutable: Send {
    fn app_execute_ordered(
        &mut self,
        plain_data: Option<&[u8]>,
        shares: &[VerifiableShare],
        context: &MessageContext,
    ) -> ConfidentialMessage;

    fn app_execute_unordered(
        &mut self,
        plain_data: Option<&[u8]>,
        shares: &[VerifiableShare],
        context: &MessageContext,
    ) -> ConfidentialMessage;

    fn get_confidential_snapshot(&self) -> ConfidentialSnapshot;

    fn install_confidential_snapshot(&mut self, snapshot: ConfidentialSnapshot);
}
