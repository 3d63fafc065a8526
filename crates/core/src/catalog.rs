//! Repository catalog: turns tagged ECR repositories into mirror specs.
//!
//! A repository opts into mirroring with two tags: one naming the upstream
//! image and one listing upstream tags. Tag values cannot contain `*`, so
//! `+` stands in for it, and multiple tags are separated by `/`:
//!
//! ```text
//! upstream-image = quay.io/prometheus/node-exporter
//! upstream-tags  = v1.7.0/v1.6+
//! ```

use tracing::{debug, error, info};

use crate::config::MirrorConfig;
use crate::errors::{ConfigError, DiscoveryError};
use crate::models::{split_tag, MirrorSpec};
use crate::services::{ResourceRecord, TagDiscovery};

const TAG_DELIMITER: char = '/';
const WILDCARD_ESCAPE: char = '+';
const WILDCARD: char = '*';

/// Decode an upstream-tags value into individual tags, in order.
pub fn decode_upstream_tags(value: &str) -> Vec<String> {
    value
        .replace(WILDCARD_ESCAPE, &WILDCARD.to_string())
        .split(TAG_DELIMITER)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Repository ARN
// ---------------------------------------------------------------------------

/// The parts of `arn:<partition>:ecr:<region>:<account>:repository/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryArn {
    pub partition: String,
    pub region: String,
    pub account_id: String,
    pub repository_name: String,
}

impl RepositoryArn {
    pub fn parse(arn: &str) -> Result<Self, DiscoveryError> {
        let invalid = |detail: &str| DiscoveryError::InvalidArn {
            arn: arn.to_string(),
            detail: detail.to_string(),
        };

        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" {
            return Err(invalid("not an ARN"));
        }
        let (partition, service, region, account_id, resource) =
            (parts[1], parts[2], parts[3], parts[4], parts[5]);

        if service != "ecr" {
            return Err(invalid("not an ECR resource"));
        }
        if region.is_empty() || account_id.is_empty() {
            return Err(invalid("missing region or account"));
        }
        let repository_name = resource
            .strip_prefix("repository/")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| invalid("resource is not a repository"))?;

        Ok(Self {
            partition: partition.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            repository_name: repository_name.to_string(),
        })
    }

    /// Registry host serving this repository.
    pub fn registry_host(&self) -> String {
        let domain = match self.partition.as_str() {
            "aws-cn" => "amazonaws.com.cn",
            _ => "amazonaws.com",
        };
        format!("{}.dkr.ecr.{}.{}", self.account_id, self.region, domain)
    }

    /// `<host>/<repository>`.
    pub fn repository_uri(&self) -> String {
        format!("{}/{}", self.registry_host(), self.repository_name)
    }
}

// ---------------------------------------------------------------------------
// Catalog expansion
// ---------------------------------------------------------------------------

/// Expand discovered records into mirror specs, one per decoded tag,
/// preserving discovery order.
pub fn build_catalog(
    records: &[ResourceRecord],
    upstream_image_key: &str,
    upstream_tags_key: &str,
) -> Vec<MirrorSpec> {
    let mut specs = Vec::new();

    for record in records {
        let arn = match RepositoryArn::parse(&record.arn) {
            Ok(arn) => arn,
            Err(e) => {
                error!(error = %e, "skipping tagged resource");
                continue;
            }
        };

        let mut upstream_image = None;
        let mut upstream_tags = Vec::new();
        for (key, value) in &record.tags {
            if key == upstream_image_key {
                upstream_image = Some(value.trim().to_string());
            } else if key == upstream_tags_key {
                upstream_tags = decode_upstream_tags(value);
            }
        }

        let upstream_image = match upstream_image {
            Some(image) if !image.is_empty() => image,
            _ => {
                debug!(arn = %record.arn, "no upstream image tag, skipping");
                continue;
            }
        };

        let destination = arn.repository_uri();
        for tag in upstream_tags {
            specs.push(MirrorSpec::new(upstream_image.clone(), tag, destination.clone()));
        }
    }

    specs
}

/// Discover tagged repositories and expand them into the run's catalog.
///
/// Discovery failures are fatal for the run and are not retried here.
pub async fn discover_catalog(
    discovery: &dyn TagDiscovery,
    config: &MirrorConfig,
) -> Result<Vec<MirrorSpec>, DiscoveryError> {
    let keys = &config.tags;
    let records = discovery
        .discover(&keys.upstream_image_key, &keys.upstream_tags_key)
        .await?;
    debug!(count = records.len(), "discovered tagged repositories");

    let specs = build_catalog(&records, &keys.upstream_image_key, &keys.upstream_tags_key);
    info!("Total Images to Mirror: {}", specs.len());
    Ok(specs)
}

/// Build the single spec of an explicit `copy <src> <dest>` request.
pub fn explicit_spec(source: &str, destination: &str) -> Result<MirrorSpec, ConfigError> {
    let source = source.trim();
    let destination = destination.trim();
    if source.is_empty() || destination.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "src/dest".into(),
            detail: "upstream image tag or ecr repository missing".into(),
        });
    }
    let (image, tag) = split_tag(source).ok_or_else(|| ConfigError::InvalidValue {
        field: "src".into(),
        detail: format!("'{}' is not in image:tag form", source),
    })?;
    Ok(MirrorSpec::new(image, tag, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const ARN: &str = "arn:aws:ecr:us-east-1:123456789012:repository/mirror/nginx";

    fn record(arn: &str, tags: &[(&str, &str)]) -> ResourceRecord {
        ResourceRecord {
            arn: arn.into(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_decode_tags_with_escape() {
        assert_eq!(
            decode_upstream_tags("1.25/1.2+/latest"),
            vec!["1.25", "1.2*", "latest"]
        );
        assert_eq!(decode_upstream_tags("+"), vec!["*"]);
        assert_eq!(decode_upstream_tags("a//b/"), vec!["a", "b"]);
        assert!(decode_upstream_tags("").is_empty());
    }

    #[test]
    fn test_parse_arn() {
        let arn = RepositoryArn::parse(ARN).unwrap();
        assert_eq!(arn.account_id, "123456789012");
        assert_eq!(arn.region, "us-east-1");
        assert_eq!(arn.repository_name, "mirror/nginx");
        assert_eq!(
            arn.repository_uri(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/mirror/nginx"
        );
    }

    #[test]
    fn test_parse_china_partition() {
        let arn =
            RepositoryArn::parse("arn:aws-cn:ecr:cn-north-1:123456789012:repository/app").unwrap();
        assert_eq!(
            arn.registry_host(),
            "123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn"
        );
    }

    #[test]
    fn test_parse_arn_rejects_garbage() {
        assert!(RepositoryArn::parse("not-an-arn").is_err());
        assert!(RepositoryArn::parse("arn:aws:s3:::bucket/key:x").is_err());
        assert!(RepositoryArn::parse("arn:aws:ecr:us-east-1:123:repository/").is_err());
    }

    #[test]
    fn test_build_catalog_expands_in_order() {
        let records = vec![
            record(
                ARN,
                &[("upstream-image", "nginx"), ("upstream-tags", "1.25/1.2+")],
            ),
            record(
                "arn:aws:ecr:us-east-1:123456789012:repository/redis",
                &[("upstream-tags", "7"), ("upstream-image", "redis")],
            ),
        ];

        let specs = build_catalog(&records, "upstream-image", "upstream-tags");
        let summary: Vec<(&str, &str)> = specs
            .iter()
            .map(|s| (s.upstream_image.as_str(), s.upstream_tag.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("nginx", "1.25"), ("nginx", "1.2*"), ("redis", "7")]
        );
        assert!(specs.iter().all(|s| s.status.is_none()));
        assert_eq!(
            specs[2].destination_repository,
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/redis"
        );
    }

    #[test]
    fn test_build_catalog_skips_incomplete_records() {
        let records = vec![
            record("garbage", &[("upstream-image", "nginx"), ("upstream-tags", "1")]),
            record(ARN, &[("upstream-tags", "1")]),
            record(ARN, &[("upstream-image", "nginx")]),
        ];
        assert!(build_catalog(&records, "upstream-image", "upstream-tags").is_empty());
    }

    #[test]
    fn test_explicit_spec() {
        let spec = explicit_spec("quay.io/org/app:v2", "123.dkr.ecr.us-east-1.amazonaws.com/app")
            .unwrap();
        assert_eq!(spec.upstream_image, "quay.io/org/app");
        assert_eq!(spec.upstream_tag, "v2");

        assert!(explicit_spec("nginx", "repo").is_err());
        assert!(explicit_spec("nginx:1", "").is_err());
    }

    struct FailingDiscovery;

    #[async_trait]
    impl TagDiscovery for FailingDiscovery {
        async fn discover(&self, _: &str, _: &str) -> Result<Vec<ResourceRecord>, DiscoveryError> {
            Err(DiscoveryError::InvalidArn {
                arn: "x".into(),
                detail: "boom".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let result = discover_catalog(&FailingDiscovery, &MirrorConfig::default()).await;
        assert!(result.is_err());
    }
}
