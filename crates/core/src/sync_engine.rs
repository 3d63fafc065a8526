//! Mirror synchronization engine.
//!
//! The [`SyncEngine`] drives every spec of a run through the same decision
//! state machine:
//!
//! 1. Look the tag up at the destination.
//! 2. If an image is present, resolve the upstream digest and compare.
//! 3. Copy when the destination is missing or stale, unless in dry-run mode.
//!
//! Specs are dispatched onto a bounded worker pool. Each worker owns its
//! spec and hands it back finished; totals are computed once after the
//! pool has drained. All network calls of a run share one deadline.

use std::sync::Arc;

use futures::future;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{MirrorConfig, REMOTE_TRANSPORT};
use crate::destination::{DestinationInspector, DestinationState, Inspection};
use crate::digest::DigestResolver;
use crate::errors::{CoreError, DestinationError, RegistryError};
use crate::models::{ItemStatus, MirrorSpec};
use crate::report::SyncReport;
use crate::retry::retry_with_backoff;
use crate::services::{
    DestinationRegistry, ImageTransfer, ManifestFetcher, PolicyContext,
    SystemContext, TokenProvider, TransferRequest,
};

// ---------------------------------------------------------------------------
// Decision policy
// ---------------------------------------------------------------------------

/// What to do with one spec once the destination state is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Copy,
    Skip(ItemStatus),
}

/// Pure decision policy. `upstream_digest` is only consulted when an image
/// is present at the destination.
pub fn decide(state: &DestinationState, upstream_digest: Option<&str>) -> Decision {
    match state {
        DestinationState::Missing => Decision::Copy,
        DestinationState::Present(detail) => match upstream_digest {
            Some(digest) if digest != detail.digest => Decision::Copy,
            Some(_) => Decision::Skip(ItemStatus::AlreadyMirrored),
            None => Decision::Skip(ItemStatus::DigestUnknown),
        },
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// External services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn DestinationRegistry>,
    pub fetcher: Arc<dyn ManifestFetcher>,
    pub transfer: Arc<dyn ImageTransfer>,
    pub tokens: Arc<dyn TokenProvider>,
}

/// Runs mirror specs against the destination registry.
pub struct SyncEngine {
    config: Arc<MirrorConfig>,
    inspector: Arc<DestinationInspector>,
    resolver: Arc<DigestResolver>,
    transfer: Arc<dyn ImageTransfer>,
    source_ctx: SystemContext,
    destination_ctx: SystemContext,
    policy: PolicyContext,
}

/// Read-only state shared by the workers of one run.
struct RunContext {
    dry_run: bool,
    deadline: Instant,
    inspector: Arc<DestinationInspector>,
    resolver: Arc<DigestResolver>,
    transfer: Arc<dyn ImageTransfer>,
    config: Arc<MirrorConfig>,
    source_ctx: SystemContext,
    destination_ctx: SystemContext,
    policy: PolicyContext,
}

impl SyncEngine {
    /// Build an engine, fetching the destination authorization token once.
    /// The token is never refreshed during a run.
    pub async fn new(
        config: Arc<MirrorConfig>,
        collaborators: Collaborators,
    ) -> Result<Self, CoreError> {
        let token = collaborators.tokens.authorization_token().await?;
        info!(expires_at = ?token.expires_at, "obtained destination authorization token");

        let source_ctx = config.source_context()?;
        let destination_ctx = SystemContext {
            auth: token.as_auth(),
            cert_dir: config.destination.cert_dir.clone(),
            auth_file: config.transfer.auth_file.clone(),
        };
        let resolver = DigestResolver::new(
            collaborators.fetcher,
            config.retry.clone(),
            config.sync.target_platform.clone(),
            source_ctx.clone(),
        );

        Ok(Self {
            inspector: Arc::new(DestinationInspector::new(collaborators.registry)),
            resolver: Arc::new(resolver),
            transfer: collaborators.transfer,
            policy: config.policy_context(),
            source_ctx,
            destination_ctx,
            config,
        })
    }

    /// Process every spec and wait for all of them. Per-item failures are
    /// recorded on the returned specs, never returned as errors.
    pub async fn run(&self, specs: Vec<MirrorSpec>) -> SyncReport {
        let started = std::time::Instant::now();
        let pool_size = self.config.pool_size(specs.len()).max(1);
        info!("Batch size for syncing images: {}", pool_size);

        let ctx = Arc::new(RunContext {
            dry_run: self.config.sync.dry_run,
            deadline: Instant::now() + self.config.command_timeout(),
            inspector: Arc::clone(&self.inspector),
            resolver: Arc::clone(&self.resolver),
            transfer: Arc::clone(&self.transfer),
            config: Arc::clone(&self.config),
            source_ctx: self.source_ctx.clone(),
            destination_ctx: self.destination_ctx.clone(),
            policy: self.policy.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(pool_size));

        let handles: Vec<_> = specs
            .iter()
            .cloned()
            .map(|spec| {
                let ctx = Arc::clone(&ctx);
                let semaphore = Arc::clone(&semaphore);
                let span = info_span!(
                    "mirror",
                    from = %spec.source_reference(),
                    to = %spec.destination_reference()
                );
                tokio::spawn(
                    async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                return finish(spec, ItemStatus::Failed("worker pool closed".into()))
                            }
                        };
                        ctx.process(spec).await
                    }
                    .instrument(span),
                )
            })
            .collect();

        let results = future::join_all(handles).await;

        let finished = specs
            .into_iter()
            .zip(results)
            .map(|(original, result)| match result {
                Ok(spec) => spec,
                Err(e) => {
                    error!(
                        from = %original.source_reference(),
                        error = %e,
                        "mirror worker did not complete"
                    );
                    finish(original, ItemStatus::Failed(format!("worker aborted: {}", e)))
                }
            })
            .collect();

        SyncReport::new(finished, started.elapsed())
    }
}

fn finish(mut spec: MirrorSpec, status: ItemStatus) -> MirrorSpec {
    spec.status = Some(status);
    spec
}

impl RunContext {
    async fn process(&self, mut spec: MirrorSpec) -> MirrorSpec {
        let state = match self.inspect(&spec).await {
            Inspection::Proceed(state) => state,
            Inspection::Reject(status) => return finish(spec, status),
        };

        let upstream_digest = match state {
            DestinationState::Missing => None,
            DestinationState::Present(_) => {
                info!(
                    "Checking digest for upstream image {} with tag {}",
                    spec.upstream_image, spec.upstream_tag
                );
                match self.resolve_digest(&spec).await {
                    Ok(digest) => digest,
                    Err(e) => {
                        error!(error = %e, "could not resolve upstream digest");
                        return finish(spec, ItemStatus::Failed(e.to_string()));
                    }
                }
            }
        };

        match decide(&state, upstream_digest.as_deref()) {
            Decision::Skip(status) => {
                info!(%status, "not copying");
                finish(spec, status)
            }
            Decision::Copy if self.dry_run => {
                info!("Would have copied image {}", spec.upstream_tag);
                finish(spec, ItemStatus::DryRun)
            }
            Decision::Copy => {
                if let (DestinationState::Present(detail), Some(upstream)) =
                    (&state, upstream_digest.as_deref())
                {
                    info!(
                        destination_digest = %detail.digest,
                        upstream_digest = upstream,
                        "digest differs, attempting to copy"
                    );
                }
                spec.sync_image = true;
                let status = match self.copy(&spec).await {
                    Ok(()) => {
                        info!("image mirrored");
                        ItemStatus::Success
                    }
                    Err(e) => {
                        error!(error = %e, "failed to mirror image");
                        ItemStatus::Failed(e.to_string())
                    }
                };
                finish(spec, status)
            }
        }
    }

    async fn inspect(&self, spec: &MirrorSpec) -> Inspection {
        match tokio::time::timeout_at(self.deadline, self.inspector.inspect(spec)).await {
            Ok(inspection) => inspection,
            Err(_) => {
                warn!("destination lookup hit the run deadline");
                crate::destination::classify(Err(DestinationError::DeadlineExceeded))
            }
        }
    }

    async fn resolve_digest(&self, spec: &MirrorSpec) -> Result<Option<String>, RegistryError> {
        tokio::time::timeout_at(self.deadline, self.resolver.resolve(spec))
            .await
            .unwrap_or(Err(RegistryError::DeadlineExceeded))
    }

    async fn copy(&self, spec: &MirrorSpec) -> Result<(), RegistryError> {
        let source = format!("{}://{}", REMOTE_TRANSPORT, spec.source_reference());
        let request = TransferRequest {
            source_ctx: self.source_ctx.for_source(&source),
            source,
            destination: format!("{}://{}", REMOTE_TRANSPORT, spec.destination_reference()),
            destination_ctx: self.destination_ctx.clone(),
            policy: self.policy.clone(),
            remove_signatures: false,
        };

        let transfer = retry_with_backoff(&self.config.retry, "image copy", || {
            self.transfer.copy_image(&request)
        });
        tokio::time::timeout_at(self.deadline, transfer)
            .await
            .unwrap_or(Err(RegistryError::DeadlineExceeded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ImageDetail;

    fn present(digest: &str) -> DestinationState {
        DestinationState::Present(ImageDetail {
            digest: digest.into(),
            tags: vec![],
        })
    }

    #[test]
    fn test_missing_destination_copies() {
        assert_eq!(decide(&DestinationState::Missing, None), Decision::Copy);
        assert_eq!(
            decide(&DestinationState::Missing, Some("sha256:a")),
            Decision::Copy
        );
    }

    #[test]
    fn test_present_destination_compares_digests() {
        assert_eq!(decide(&present("sha256:a"), Some("sha256:b")), Decision::Copy);
        assert_eq!(
            decide(&present("sha256:a"), Some("sha256:a")),
            Decision::Skip(ItemStatus::AlreadyMirrored)
        );
    }

    #[test]
    fn test_unknown_digest_skips() {
        assert_eq!(
            decide(&present("sha256:a"), None),
            Decision::Skip(ItemStatus::DigestUnknown)
        );
    }
}
