//! Destination inspection: what, if anything, already exists at the
//! destination repository for a spec's tag.

use std::sync::Arc;

use tracing::{error, info};

use crate::errors::DestinationError;
use crate::models::{ItemStatus, MirrorSpec};
use crate::services::{DestinationRegistry, ImageDetail};

/// Known destination state for a spec that may still be copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationState {
    /// Repository exists, tag does not.
    Missing,
    Present(ImageDetail),
}

/// Result of inspecting the destination for one spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Proceed(DestinationState),
    /// Terminal status; no further calls for this item.
    Reject(ItemStatus),
}

/// Map a lookup result onto the inspection outcome.
pub fn classify(result: Result<ImageDetail, DestinationError>) -> Inspection {
    match result {
        Ok(detail) => Inspection::Proceed(DestinationState::Present(detail)),
        Err(DestinationError::ImageNotFound(_)) => Inspection::Proceed(DestinationState::Missing),
        Err(e @ DestinationError::InvalidParameter(_)) => {
            Inspection::Reject(ItemStatus::InvalidParameter(e.to_string()))
        }
        Err(e @ DestinationError::RepositoryNotFound(_)) => {
            Inspection::Reject(ItemStatus::RepositoryMissing(e.to_string()))
        }
        // TODO: decide whether throttling and server errors should be
        // retried or skipped instead of failing the item outright.
        Err(e @ (DestinationError::Other(_) | DestinationError::DeadlineExceeded)) => {
            Inspection::Reject(ItemStatus::Failed(e.to_string()))
        }
    }
}

/// Looks up specs at the destination registry.
pub struct DestinationInspector {
    registry: Arc<dyn DestinationRegistry>,
}

impl DestinationInspector {
    pub fn new(registry: Arc<dyn DestinationRegistry>) -> Self {
        Self { registry }
    }

    pub async fn inspect(&self, spec: &MirrorSpec) -> Inspection {
        let repository = spec.repository_name();
        let tag = spec.destination_tag();
        let inspection = classify(self.registry.describe_image(repository, tag).await);

        match &inspection {
            Inspection::Proceed(DestinationState::Missing) => {
                info!(repository, tag, "image not found at destination, will attempt to mirror");
            }
            Inspection::Proceed(DestinationState::Present(detail)) => {
                info!(repository, tag, digest = %detail.digest, "image present at destination");
            }
            Inspection::Reject(status) => {
                error!(repository, tag, %status, "destination lookup rejected item");
            }
        }
        inspection
    }
}
