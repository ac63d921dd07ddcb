use super::{ExtractedResponse, ServiceReply};
use crate::crypto::{Commitment, ConfidentialityScheme, Mode, OpenPublishedShares};
use crate::types::{EncryptedConfidentialMessage, ShareholderId};
use crate::{Error, Result};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone)]
struct ParsedReply {
    message: Arc<EncryptedConfidentialMessage>,
    hash: u64,
}

/// Turns the replies of a quorum of replicas into one response.
///
/// Parsed replies are cached by their raw content until [`reset`](Self::reset).
pub struct ServersResponseHandler {
    scheme: Arc<ConfidentialityScheme>,
    pre_computed: bool,
    parsed: DashMap<Vec<u8>, Option<ParsedReply>>,
}

impl ServersResponseHandler {
    pub fn new(scheme: Arc<ConfidentialityScheme>) -> Self {
        Self {
            scheme,
            pre_computed: false,
            parsed: DashMap::new(),
        }
    }

    /// Replies are already in the clear; hand back the designated one as is
    pub fn set_pre_computed(&mut self, pre_computed: bool) {
        self.pre_computed = pre_computed;
    }

    /// Number of distinct reply contents seen since the last reset
    pub fn cached_replies(&self) -> usize {
        self.parsed.len()
    }

    pub fn reset(&self) {
        self.parsed.clear();
    }

    fn parse(&self, content: &[u8]) -> Option<ParsedReply> {
        if let Some(parsed) = self.parsed.get(content) {
            return parsed.value().clone();
        }
        let parsed = match EncryptedConfidentialMessage::deserialize(content) {
            Ok(message) => Some(ParsedReply {
                hash: message.structural_hash(),
                message: Arc::new(message),
            }),
            Err(e) => {
                warn!(error = %e, "Failed to deserialize reply");
                None
            }
        };
        self.parsed.insert(content.to_vec(), parsed.clone());
        parsed
    }

    /// Order replies by content. Missing or unreadable replies sort last.
    pub fn compare(&self, a: Option<&[u8]>, b: Option<&[u8]>) -> Ordering {
        let a = a.and_then(|content| self.parse(content));
        let b = b.and_then(|content| self.parse(content));
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.hash.cmp(&b.hash),
        }
    }

    /// Reconstruct the response agreed on by `same_content` replicas, or
    /// `None` if no group of replies is large enough
    pub fn reconstruct(
        &self,
        replies: &[Option<ServiceReply>],
        same_content: usize,
    ) -> Option<ExtractedResponse> {
        let mut groups: BTreeMap<u64, Vec<Arc<EncryptedConfidentialMessage>>> = BTreeMap::new();
        for reply in replies.iter().flatten() {
            match self.parse(&reply.content) {
                Some(parsed) => groups.entry(parsed.hash).or_default().push(parsed.message),
                None => warn!(sender = reply.sender, "Ignoring unreadable reply"),
            }
        }

        let Some(quorum) = groups
            .into_values()
            .find(|group| group.len() >= same_content && !group.is_empty())
        else {
            error!(same_content, "Not enough equivalent responses");
            return None;
        };
        Some(self.combine_quorum(&quorum[..same_content.max(1)]))
    }

    fn combine_quorum(&self, quorum: &[Arc<EncryptedConfidentialMessage>]) -> ExtractedResponse {
        let first = &quorum[0];
        let plain_data = first.plain_data.clone();
        let mut confidential_data = Vec::with_capacity(first.shares.len());

        for position in 0..first.shares.len() {
            match self.combine_position(quorum, position) {
                Ok(secret) => confidential_data.push(secret),
                Err(e) => {
                    error!(position, error = %e, "Failed to reconstruct secret");
                    return ExtractedResponse::failed(plain_data, confidential_data, &e);
                }
            }
        }
        debug!(secrets = confidential_data.len(), "Response reconstructed");
        ExtractedResponse::new(plain_data, confidential_data)
    }

    fn combine_position(
        &self,
        quorum: &[Arc<EncryptedConfidentialMessage>],
        position: usize,
    ) -> Result<Vec<u8>> {
        let me = self.scheme.process_id();
        let mut shares = Vec::with_capacity(quorum.len());
        let mut commitments = BTreeMap::new();
        let mut shared_data = None;

        for message in quorum {
            let Some(Some(sealed)) = message.shares.get(position) else {
                warn!(position, "Replica sent no share for this secret");
                continue;
            };
            if shared_data.is_none() {
                shared_data = Some(sealed.shared_data.clone());
            }
            match self.scheme.decrypt_share_for(me, &sealed.share) {
                Ok(share) if share.shareholder == sealed.shareholder => shares.push(share),
                Ok(share) => warn!(
                    claimed = sealed.shareholder.0,
                    actual = share.shareholder.0,
                    "Share addressed to another shareholder"
                ),
                Err(e) => error!(shareholder = sealed.shareholder.0, error = %e, "Failed to decrypt share"),
            }
            commitments.insert(sealed.shareholder, sealed.commitment.clone());
        }

        let shared_data: Option<Vec<u8>> = shared_data.flatten();
        let commitment = self.combine_commitments(&commitments)?;
        let open = OpenPublishedShares {
            shares,
            commitment,
            shared_data,
        };
        let mode = Mode::for_shared_data(open.shared_data.as_deref());
        self.scheme.combine(&open, mode)
    }

    fn combine_commitments(
        &self,
        commitments: &BTreeMap<ShareholderId, Commitment>,
    ) -> Result<Commitment> {
        if commitments.is_empty() {
            return Err(Error::Crypto("No shares for this secret".into()));
        }
        self.scheme.commitment_scheme().combine_commitments(commitments)
    }

    /// Build the reply handed to the caller, reusing the envelope of the
    /// reply at `last_received`
    pub fn extract_response(
        &self,
        replies: &[Option<ServiceReply>],
        same_content: usize,
        last_received: usize,
    ) -> Option<ServiceReply> {
        let designated = replies
            .get(last_received)
            .and_then(Option::as_ref)
            .or_else(|| replies.iter().flatten().next());
        if self.pre_computed {
            return designated.cloned();
        }

        let response = self.reconstruct(replies, same_content)?;
        let content = match response.serialize() {
            Ok(content) => content,
            Err(e) => {
                error!(error = %e, "Failed to serialize extracted response");
                return None;
            }
        };
        designated.map(|reply| reply.with_content(content))
    }
}
