//! Contracts of the external collaborators the core drives.
//!
//! The orchestrator only sees these traits; the AWS and `skopeo` backed
//! implementations live in [`crate::aws`] and [`crate::skopeo`], and the
//! tests substitute in-memory fakes.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::Regex;

use crate::errors::{DestinationError, DiscoveryError, RegistryError, TokenError};

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// A tagged resource returned by tag discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Structured identifier (ARN) of the resource.
    pub arn: String,
    /// Key/value tag pairs in the order the service returned them.
    pub tags: Vec<(String, String)>,
}

/// An image that already exists at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetail {
    pub digest: String,
    pub tags: Vec<String>,
}

/// How to authenticate against one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Whatever the transfer tool finds on its own (auth file, helpers).
    Default,
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

/// Per-side access settings handed to the transfer tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemContext {
    pub auth: RegistryAuth,
    pub cert_dir: Option<PathBuf>,
    pub auth_file: Option<PathBuf>,
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            auth: RegistryAuth::Default,
            cert_dir: None,
            auth_file: None,
        }
    }
}

impl SystemContext {
    /// Context to use when reading `image_ref`.
    ///
    /// Configured credentials are meant for Docker Hub; images from any
    /// other registry host are expected to be public, so credentials are
    /// dropped for them unless a shared auth file is in use.
    pub fn for_source(&self, image_ref: &str) -> SystemContext {
        let mut ctx = self.clone();
        if names_foreign_registry(image_ref) && self.auth_file.is_none() {
            ctx.auth = match self.auth {
                RegistryAuth::Default => RegistryAuth::Default,
                _ => RegistryAuth::Anonymous,
            };
        }
        ctx
    }
}

fn names_foreign_registry(image_ref: &str) -> bool {
    static HOST_QUALIFIED: OnceLock<Regex> = OnceLock::new();
    let pattern = HOST_QUALIFIED.get_or_init(|| {
        Regex::new(r"([^\s]+)\.([^\s]+)/([^\s]+)").expect("static pattern is valid")
    });
    let name = image_ref.trim_start_matches("docker://");
    pattern.is_match(name) && !name.contains("docker.io")
}

/// Signature verification policy for transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyContext {
    /// The system default policy file.
    Default,
    File(PathBuf),
    InsecureAcceptAnything,
}

/// Everything the transfer collaborator needs for one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Source reference, e.g. `docker://nginx:1.25`.
    pub source: String,
    /// Destination reference, e.g. `docker://<ecr>/nginx:1.25`.
    pub destination: String,
    pub source_ctx: SystemContext,
    pub destination_ctx: SystemContext,
    pub policy: PolicyContext,
    pub remove_signatures: bool,
}

/// Bearer credential for the destination registry, valid for a bounded
/// time and never refreshed during a run.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationToken {
    pub username: String,
    pub password: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub proxy_endpoint: Option<String>,
}

impl std::fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationToken")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .finish()
    }
}

impl AuthorizationToken {
    pub fn as_auth(&self) -> RegistryAuth {
        RegistryAuth::Basic {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Finds resources carrying both tag-filter keys.
#[async_trait]
pub trait TagDiscovery: Send + Sync {
    async fn discover(
        &self,
        upstream_image_key: &str,
        upstream_tags_key: &str,
    ) -> Result<Vec<ResourceRecord>, DiscoveryError>;
}

/// Fetches raw manifest bytes for an image reference.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch_manifest(
        &self,
        image_ref: &str,
        ctx: &SystemContext,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Performs the byte-level copy of one image.
#[async_trait]
pub trait ImageTransfer: Send + Sync {
    async fn copy_image(&self, request: &TransferRequest) -> Result<(), RegistryError>;
}

/// Looks up an image by repository and tag at the destination.
#[async_trait]
pub trait DestinationRegistry: Send + Sync {
    async fn describe_image(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<ImageDetail, DestinationError>;
}

/// Issues the destination registry credential.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn authorization_token(&self) -> Result<AuthorizationToken, TokenError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_creds() -> SystemContext {
        SystemContext {
            auth: RegistryAuth::Basic {
                username: "hub-user".into(),
                password: "hub-pass".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_docker_hub_keeps_credentials() {
        let ctx = with_creds();
        assert_eq!(ctx.for_source("docker://library/nginx:1.25").auth, ctx.auth);
        assert_eq!(
            ctx.for_source("docker://docker.io/library/nginx:1.25").auth,
            ctx.auth
        );
    }

    #[test]
    fn test_foreign_registry_goes_anonymous() {
        let ctx = with_creds();
        assert_eq!(
            ctx.for_source("docker://quay.io/prometheus/node-exporter:v1.7.0")
                .auth,
            RegistryAuth::Anonymous
        );
    }

    #[test]
    fn test_auth_file_keeps_credentials() {
        let ctx = SystemContext {
            auth_file: Some("/run/containers/auth.json".into()),
            ..with_creds()
        };
        assert_eq!(
            ctx.for_source("docker://ghcr.io/org/app:1").auth,
            ctx.auth
        );
    }

    #[test]
    fn test_token_debug_redacts_password() {
        let token = AuthorizationToken {
            username: "AWS".into(),
            password: "very-secret".into(),
            expires_at: None,
            proxy_endpoint: None,
        };
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
