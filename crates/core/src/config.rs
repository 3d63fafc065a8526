//! Run configuration for ecr-mirror-sync.
//!
//! A [`MirrorConfig`] is built once per invocation from defaults, an
//! optional TOML file and command-line overrides, then shared read-only by
//! every worker. Secrets may be referenced through `*_env` fields that name
//! an environment variable; they are resolved by
//! [`MirrorConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use crate::services::{PolicyContext, RegistryAuth, SystemContext};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_UPSTREAM_IMAGE_KEY: &str = "upstream-image";
pub const DEFAULT_UPSTREAM_TAGS_KEY: &str = "upstream-tags";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 20 * 60;
pub const REMOTE_TRANSPORT: &str = "docker";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Immutable configuration for one synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// AWS region of the tagging and ECR endpoints.
    #[serde(default = "default_region")]
    pub region: String,

    /// Tag keys that mark a repository for mirroring.
    #[serde(default)]
    pub tags: TagFilterConfig,

    /// Orchestration behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retry policy for digest fetches and transfers.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Credentials and TLS options for upstream registries.
    #[serde(default)]
    pub source: CredentialOptions,

    /// TLS options for the destination registry.
    #[serde(default)]
    pub destination: DestinationOptions,

    /// Transfer tool settings.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.into()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            tags: TagFilterConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryPolicy::default(),
            source: CredentialOptions::default(),
            destination: DestinationOptions::default(),
            transfer: TransferConfig::default(),
            debug: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tag filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFilterConfig {
    #[serde(default = "default_upstream_image_key")]
    pub upstream_image_key: String,

    #[serde(default = "default_upstream_tags_key")]
    pub upstream_tags_key: String,
}

fn default_upstream_image_key() -> String {
    DEFAULT_UPSTREAM_IMAGE_KEY.into()
}
fn default_upstream_tags_key() -> String {
    DEFAULT_UPSTREAM_TAGS_KEY.into()
}

impl Default for TagFilterConfig {
    fn default() -> Self {
        Self {
            upstream_image_key: default_upstream_image_key(),
            upstream_tags_key: default_upstream_tags_key(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Platform selected from manifest lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPlatform {
    pub architecture: String,
    pub os: String,
}

impl Default for TargetPlatform {
    fn default() -> Self {
        Self {
            architecture: "amd64".into(),
            os: "linux".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Decide only, never copy.
    #[serde(default)]
    pub dry_run: bool,

    /// Render a table instead of a log summary.
    #[serde(default)]
    pub render_table: bool,

    /// Number of concurrent workers; unset means one per item.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    /// Wall-clock budget shared by all network calls of a run.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub target_platform: TargetPlatform,
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            render_table: false,
            worker_pool_size: None,
            command_timeout_secs: default_command_timeout_secs(),
            target_platform: TargetPlatform::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Per-side registry access options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialOptions {
    /// `USERNAME[:PASSWORD]` for accessing the registry.
    #[serde(default)]
    pub creds: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// Resolved password (from the CLI or `password_env`).
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Bearer token used directly against the registry.
    #[serde(default)]
    pub registry_token: Option<String>,

    /// Access the registry anonymously.
    #[serde(default)]
    pub no_creds: bool,

    /// Directory with `*.crt`, `*.cert`, `*.key` files.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
}

impl CredentialOptions {
    /// Reject mutually exclusive combinations. `prefix` names the flag group
    /// (`src-`, `dest-`) in error messages.
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        let conflict = |first: &str, second: &str| ConfigError::ConflictingOptions {
            first: format!("{}{}", prefix, first),
            second: format!("{}{}", prefix, second),
        };

        if self.creds.is_some() && self.no_creds {
            return Err(conflict("creds", "no-creds"));
        }
        if self.username.is_some() && self.no_creds {
            return Err(conflict("username", "no-creds"));
        }
        if self.creds.is_some() && self.username.is_some() {
            return Err(conflict("creds", "username"));
        }
        match (&self.username, &self.password) {
            (Some(_), None) => Err(ConfigError::InvalidValue {
                field: format!("{}password", prefix),
                detail: "password must be specified when username is specified".into(),
            }),
            (None, Some(_)) => Err(ConfigError::InvalidValue {
                field: format!("{}username", prefix),
                detail: "username must be specified when password is specified".into(),
            }),
            _ => Ok(()),
        }
    }

    /// The authentication these options describe.
    pub fn auth(&self) -> Result<RegistryAuth, ConfigError> {
        if self.no_creds {
            return Ok(RegistryAuth::Anonymous);
        }
        if let Some(ref token) = self.registry_token {
            return Ok(RegistryAuth::Bearer(token.clone()));
        }
        if let Some(ref creds) = self.creds {
            let (username, password) = parse_creds(creds)?;
            return Ok(RegistryAuth::Basic { username, password });
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(RegistryAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            });
        }
        Ok(RegistryAuth::Default)
    }
}

/// Destination registry options. Credentials always come from the ECR
/// authorization token, so credential fields are rejected when parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationOptions {
    /// Directory with `*.crt`, `*.cert`, `*.key` files.
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
}

/// Split `USERNAME[:PASSWORD]`.
pub fn parse_creds(creds: &str) -> Result<(String, String), ConfigError> {
    if creds.is_empty() {
        return Err(ConfigError::InvalidCredentials(
            "credentials can't be empty".into(),
        ));
    }
    match creds.split_once(':') {
        None => Ok((creds.to_string(), String::new())),
        Some(("", _)) => Err(ConfigError::InvalidCredentials(
            "username can't be empty".into(),
        )),
        Some((user, pass)) => Ok((user.to_string(), pass.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Transfer tool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Path or name of the `skopeo` binary.
    #[serde(default = "default_skopeo_path")]
    pub skopeo_path: String,

    /// Shared registry auth file (defaults to `$REGISTRY_AUTH_FILE`).
    #[serde(default)]
    pub auth_file: Option<PathBuf>,

    /// Signature verification policy file.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    /// Accept anything, skipping signature verification.
    #[serde(default)]
    pub insecure_policy: bool,
}

fn default_skopeo_path() -> String {
    "skopeo".into()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            skopeo_path: default_skopeo_path(),
            auth_file: None,
            policy_path: None,
            insecure_policy: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading, resolving, validating
// ---------------------------------------------------------------------------

impl MirrorConfig {
    /// Load a [`MirrorConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: MirrorConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` references and environment defaults.
    pub fn resolve_env_vars(&mut self) {
        if self.source.password.is_none() {
            if let Some(ref env_name) = self.source.password_env {
                self.source.password = resolve_optional_env(env_name, "source.password_env");
            }
        }
        if self.transfer.auth_file.is_none() {
            self.transfer.auth_file = std::env::var("REGISTRY_AUTH_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from);
        }
    }

    /// Validate that all values are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "region".into(),
                detail: "region must not be empty".into(),
            });
        }
        if self.tags.upstream_image_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tags.upstream_image_key".into(),
                detail: "tag filter key must not be empty".into(),
            });
        }
        if self.tags.upstream_tags_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tags.upstream_tags_key".into(),
                detail: "tag filter key must not be empty".into(),
            });
        }
        if self.sync.worker_pool_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "sync.worker_pool_size".into(),
                detail: "worker pool size must be > 0".into(),
            });
        }
        if self.sync.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.command_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.transfer.policy_path.is_some() && self.transfer.insecure_policy {
            return Err(ConfigError::ConflictingOptions {
                first: "policy".into(),
                second: "insecure-policy".into(),
            });
        }
        self.source.validate("src-")?;
        // Fail early on a malformed USER[:PASSWORD].
        self.source.auth()?;
        Ok(())
    }

    /// Worker pool size for a run over `items` specs.
    pub fn pool_size(&self, items: usize) -> usize {
        self.sync.worker_pool_size.unwrap_or(items)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.command_timeout_secs)
    }

    /// System context for reading from upstream registries.
    pub fn source_context(&self) -> Result<SystemContext, ConfigError> {
        Ok(SystemContext {
            auth: self.source.auth()?,
            cert_dir: self.source.cert_dir.clone(),
            auth_file: self.transfer.auth_file.clone(),
        })
    }

    /// Signature policy applied to transfers.
    pub fn policy_context(&self) -> PolicyContext {
        if self.transfer.insecure_policy {
            PolicyContext::InsecureAcceptAnything
        } else if let Some(ref path) = self.transfer.policy_path {
            PolicyContext::File(path.clone())
        } else {
            PolicyContext::Default
        }
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
