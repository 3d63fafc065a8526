//! Domain model types shared by the catalog, the orchestrator and the
//! reporter.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mirror spec
// ---------------------------------------------------------------------------

/// One (upstream image, tag, destination repository) work item.
///
/// Created once during catalog expansion with no status; the worker that
/// owns it sets `status` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSpec {
    pub upstream_image: String,
    pub upstream_tag: String,
    /// `<account>.dkr.ecr.<region>.amazonaws.com/<name>`, optionally with a
    /// `:tag` suffix for explicit copies.
    pub destination_repository: String,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    /// Set when the decision for this item was to copy.
    #[serde(default)]
    pub sync_image: bool,
}

impl MirrorSpec {
    pub fn new(
        upstream_image: impl Into<String>,
        upstream_tag: impl Into<String>,
        destination_repository: impl Into<String>,
    ) -> Self {
        Self {
            upstream_image: upstream_image.into(),
            upstream_tag: upstream_tag.into(),
            destination_repository: destination_repository.into(),
            status: None,
            sync_image: false,
        }
    }

    /// `image:tag` of the upstream side.
    pub fn source_reference(&self) -> String {
        format!("{}:{}", self.upstream_image, self.upstream_tag)
    }

    /// `repository:tag` of the destination side. A tag already present in
    /// the destination repository wins over the upstream tag.
    pub fn destination_reference(&self) -> String {
        if self.destination_tag_override().is_some() {
            self.destination_repository.clone()
        } else {
            format!("{}:{}", self.destination_repository, self.upstream_tag)
        }
    }

    /// The tag looked up at the destination.
    pub fn destination_tag(&self) -> &str {
        self.destination_tag_override()
            .unwrap_or(self.upstream_tag.as_str())
    }

    /// Repository name inside the destination registry (path after the
    /// host, without tag).
    pub fn repository_name(&self) -> &str {
        let without_tag = match self.destination_tag_override() {
            Some(tag) => {
                &self.destination_repository[..self.destination_repository.len() - tag.len() - 1]
            }
            None => self.destination_repository.as_str(),
        };
        match without_tag.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => rest,
            _ => without_tag,
        }
    }

    fn destination_tag_override(&self) -> Option<&str> {
        split_tag(&self.destination_repository).map(|(_, tag)| tag)
    }
}

/// Split `name:tag` on the last `:` that follows the last `/`, so that a
/// registry port is never mistaken for a tag.
pub fn split_tag(reference: &str) -> Option<(&str, &str)> {
    let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let colon = reference[last_segment_start..].rfind(':')? + last_segment_start;
    let (name, tag) = (&reference[..colon], &reference[colon + 1..]);
    if name.is_empty() || tag.is_empty() {
        return None;
    }
    Some((name, tag))
}

/// Docker's rule: the first path component is a registry host when it
/// contains a `.` or a `:`, or is `localhost`.
pub fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

// ---------------------------------------------------------------------------
// Item status
// ---------------------------------------------------------------------------

/// Terminal status of one mirror spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ItemStatus {
    /// The image was copied.
    Success,
    /// Destination digest equals upstream digest.
    AlreadyMirrored,
    /// A copy was decided but suppressed by dry-run mode.
    DryRun,
    /// The upstream digest is unknown while the destination has an image.
    DigestUnknown,
    /// The destination repository does not exist.
    RepositoryMissing(String),
    /// The destination lookup rejected its parameters.
    InvalidParameter(String),
    /// A lookup, digest fetch or transfer failed.
    Failed(String),
}

/// How an item counts towards the run totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Success => Outcome::Succeeded,
            Self::Failed(_) => Outcome::Failed,
            Self::AlreadyMirrored
            | Self::DryRun
            | Self::DigestUnknown
            | Self::RepositoryMissing(_)
            | Self::InvalidParameter(_) => Outcome::Skipped,
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::AlreadyMirrored => write!(f, "skipping, image exists already"),
            Self::DryRun => write!(f, "Dry Run"),
            Self::DigestUnknown => write!(
                f,
                "could not retrieve image digest from public upstream, however an image exists in ECR, skipped"
            ),
            Self::RepositoryMissing(e) => write!(f, "ecr repo does not exist: {}", e),
            Self::InvalidParameter(e) => write!(f, "Will not mirror image: {}", e),
            Self::Failed(e) => write!(f, "failed to mirror: {}", e),
        }
    }
}
