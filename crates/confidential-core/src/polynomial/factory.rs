//! Selection of the creator driving a run

use super::creator::{PolynomialCreator, RecoveryPolynomialCreator, ResharingPolynomialCreator};
use super::{CreationReason, PolynomialCreationContext};
use crate::crypto::ConfidentialityScheme;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

pub type CreatorBuilder = Arc<
    dyn Fn(PolynomialCreationContext, Arc<ConfidentialityScheme>) -> Box<dyn PolynomialCreator>
        + Send
        + Sync,
>;

/// Wrap a closure building a creator
pub fn creator_builder<F>(build: F) -> CreatorBuilder
where
    F: Fn(PolynomialCreationContext, Arc<ConfidentialityScheme>) -> Box<dyn PolynomialCreator>
        + Send
        + Sync
        + 'static,
{
    Arc::new(build)
}

/// Creators available to a replica, keyed by creation reason
#[derive(Clone)]
pub struct PolynomialCreatorRegistry {
    builders: HashMap<CreationReason, CreatorBuilder>,
}

impl PolynomialCreatorRegistry {
    /// A registry without any creator
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, reason: CreationReason, builder: CreatorBuilder) {
        self.builders.insert(reason, builder);
    }

    pub fn supports(&self, reason: CreationReason) -> bool {
        self.builders.contains_key(&reason)
    }

    /// Build the creator for `context`, or `None` when its reason has no creator
    pub fn create(
        &self,
        context: PolynomialCreationContext,
        scheme: Arc<ConfidentialityScheme>,
    ) -> Option<Box<dyn PolynomialCreator>> {
        match self.builders.get(&context.reason) {
            Some(builder) => Some(builder(context, scheme)),
            None => {
                error!(reason = ?context.reason, creation_id = context.id, "Unknown polynomial creation reason");
                None
            }
        }
    }
}

impl Default for PolynomialCreatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            CreationReason::Recovery,
            creator_builder(|context, scheme| {
                Box::new(RecoveryPolynomialCreator::new(context, scheme))
            }),
        );
        registry.register(
            CreationReason::Resharing,
            creator_builder(|context, scheme| {
                Box::new(ResharingPolynomialCreator::new(context, scheme))
            }),
        );
        registry
    }
}
