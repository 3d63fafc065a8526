//! Upstream digest resolution.
//!
//! The raw manifest is decoded into one of two shapes: a single-platform
//! manifest, identified by its `config` field, whose digest is the SHA-256
//! of the raw bytes, or a manifest list, identified by its `manifests`
//! array, whose entry for the target platform carries the digest.

use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::config::{TargetPlatform, REMOTE_TRANSPORT};
use crate::errors::RegistryError;
use crate::models::MirrorSpec;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::services::{ManifestFetcher, SystemContext};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Single {
        #[allow(dead_code)]
        config: serde_json::Value,
    },
    List {
        manifests: Vec<ManifestDescriptor>,
    },
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

impl ManifestDescriptor {
    fn matches(&self, target: &TargetPlatform) -> bool {
        self.platform
            .as_ref()
            .map(|p| p.architecture == target.architecture && p.os == target.os)
            .unwrap_or(false)
    }
}

/// `sha256:<hex>` of the raw manifest bytes.
pub fn canonical_digest(raw: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(raw)))
}

/// Digest of `raw` for `target`, or `None` when the document is of neither
/// shape or has no entry for the target platform.
///
/// When several list entries match, the last one wins.
pub fn resolve_digest(raw: &[u8], target: &TargetPlatform) -> Option<String> {
    match serde_json::from_slice::<ManifestDocument>(raw) {
        Ok(ManifestDocument::Single { .. }) => Some(canonical_digest(raw)),
        Ok(ManifestDocument::List { manifests }) => manifests
            .iter()
            .filter(|m| m.matches(target))
            .filter_map(|m| m.digest.clone())
            .last(),
        Err(e) => {
            debug!(error = %e, "manifest is neither a single manifest nor a list");
            None
        }
    }
}

/// Fetches upstream manifests and resolves their digest for one platform.
pub struct DigestResolver {
    fetcher: Arc<dyn ManifestFetcher>,
    retry: RetryPolicy,
    target: TargetPlatform,
    source_ctx: SystemContext,
}

impl DigestResolver {
    pub fn new(
        fetcher: Arc<dyn ManifestFetcher>,
        retry: RetryPolicy,
        target: TargetPlatform,
        source_ctx: SystemContext,
    ) -> Self {
        Self {
            fetcher,
            retry,
            target,
            source_ctx,
        }
    }

    /// Current upstream digest of `spec`. `Ok(None)` means the digest is
    /// unknown; an `Err` is a hard fetch failure after retries.
    #[instrument(skip(self, spec), fields(image = %spec.source_reference()))]
    pub async fn resolve(&self, spec: &MirrorSpec) -> Result<Option<String>, RegistryError> {
        let image_ref = format!("{}://{}", REMOTE_TRANSPORT, spec.source_reference());
        let ctx = self.source_ctx.for_source(&image_ref);

        let raw = retry_with_backoff(&self.retry, "manifest fetch", || {
            self.fetcher.fetch_manifest(&image_ref, &ctx)
        })
        .await?;

        let digest = resolve_digest(&raw, &self.target);
        debug!(digest = ?digest, "resolved upstream digest");
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SINGLE: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"digest": "sha256:abc", "size": 10},
        "layers": []
    }"#;

    fn list(entries: &[(&str, &str, &str)]) -> String {
        let manifests: Vec<serde_json::Value> = entries
            .iter()
            .map(|(digest, arch, os)| {
                serde_json::json!({
                    "digest": digest,
                    "platform": {"architecture": arch, "os": os}
                })
            })
            .collect();
        serde_json::json!({ "schemaVersion": 2, "manifests": manifests }).to_string()
    }

    #[test]
    fn test_canonical_digest() {
        assert_eq!(
            canonical_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_manifest_hashes_raw_bytes() {
        let digest = resolve_digest(SINGLE.as_bytes(), &TargetPlatform::default());
        assert_eq!(digest, Some(canonical_digest(SINGLE.as_bytes())));
    }

    #[test]
    fn test_list_selects_target_platform() {
        let raw = list(&[
            ("sha256:arm", "arm64", "linux"),
            ("sha256:amd", "amd64", "linux"),
            ("sha256:win", "amd64", "windows"),
        ]);
        assert_eq!(
            resolve_digest(raw.as_bytes(), &TargetPlatform::default()).as_deref(),
            Some("sha256:amd")
        );

        let arm = TargetPlatform {
            architecture: "arm64".into(),
            os: "linux".into(),
        };
        assert_eq!(
            resolve_digest(raw.as_bytes(), &arm).as_deref(),
            Some("sha256:arm")
        );
    }

    #[test]
    fn test_list_last_match_wins() {
        let raw = list(&[
            ("sha256:first", "amd64", "linux"),
            ("sha256:second", "amd64", "linux"),
        ]);
        assert_eq!(
            resolve_digest(raw.as_bytes(), &TargetPlatform::default()).as_deref(),
            Some("sha256:second")
        );
    }

    #[test]
    fn test_unknown_shapes() {
        let target = TargetPlatform::default();
        assert_eq!(resolve_digest(b"not json", &target), None);
        assert_eq!(resolve_digest(br#"{"schemaVersion": 1}"#, &target), None);
        let raw = list(&[("sha256:arm", "arm64", "linux")]);
        assert_eq!(resolve_digest(raw.as_bytes(), &target), None);
        // Entries without a platform never match.
        assert_eq!(
            resolve_digest(br#"{"manifests": [{"digest": "sha256:x"}]}"#, &target),
            None
        );
    }

    struct FlakyFetcher {
        calls: AtomicU32,
        fail_first: u32,
        body: Vec<u8>,
    }

    #[async_trait]
    impl ManifestFetcher for FlakyFetcher {
        async fn fetch_manifest(
            &self,
            image_ref: &str,
            _ctx: &SystemContext,
        ) -> Result<Vec<u8>, RegistryError> {
            assert_eq!(image_ref, "docker://nginx:1.25");
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(RegistryError::CommandFailed {
                    exit_code: 1,
                    stderr: "TLS handshake timeout".into(),
                });
            }
            Ok(self.body.clone())
        }
    }

    fn resolver(fetcher: Arc<FlakyFetcher>, max_retries: u32) -> DigestResolver {
        let retry = RetryPolicy {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        };
        DigestResolver::new(fetcher, retry, TargetPlatform::default(), SystemContext::default())
    }

    #[tokio::test]
    async fn test_resolver_retries_fetch() {
        let fetcher = Arc::new(FlakyFetcher {
            calls: AtomicU32::new(0),
            fail_first: 1,
            body: SINGLE.as_bytes().to_vec(),
        });
        let spec = MirrorSpec::new("nginx", "1.25", "123.dkr.ecr.us-east-1.amazonaws.com/nginx");

        let digest = resolver(fetcher.clone(), 2).resolve(&spec).await.unwrap();
        assert_eq!(digest, Some(canonical_digest(SINGLE.as_bytes())));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolver_surfaces_exhaustion() {
        let fetcher = Arc::new(FlakyFetcher {
            calls: AtomicU32::new(0),
            fail_first: 10,
            body: Vec::new(),
        });
        let spec = MirrorSpec::new("nginx", "1.25", "123.dkr.ecr.us-east-1.amazonaws.com/nginx");

        let result = resolver(fetcher.clone(), 1).resolve(&spec).await;
        assert!(result.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
