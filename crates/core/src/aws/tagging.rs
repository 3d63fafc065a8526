//! Resource tagging API: finds ECR repositories carrying the mirror tags.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::client::{AwsJsonClient, TAGGING};
use crate::errors::DiscoveryError;
use crate::services::{ResourceRecord, TagDiscovery};

const GET_RESOURCES: &str = "ResourceGroupsTaggingAPI_20170126.GetResources";
const ECR_REPOSITORY_TYPE: &str = "ecr:repository";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourcesRequest<'a> {
    resource_type_filters: [&'a str; 1],
    tag_filters: [TagFilter<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pagination_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TagFilter<'a> {
    key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourcesResponse {
    #[serde(default)]
    pagination_token: Option<String>,
    #[serde(default)]
    resource_tag_mapping_list: Vec<ResourceTagMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceTagMapping {
    #[serde(rename = "ResourceARN")]
    resource_arn: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    #[serde(default)]
    value: String,
}

/// Tag discovery backed by `GetResources`.
#[derive(Clone)]
pub struct TaggingClient {
    client: AwsJsonClient,
}

impl TaggingClient {
    pub fn new(client: AwsJsonClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TagDiscovery for TaggingClient {
    #[instrument(skip(self))]
    async fn discover(
        &self,
        upstream_image_key: &str,
        upstream_tags_key: &str,
    ) -> Result<Vec<ResourceRecord>, DiscoveryError> {
        let mut records = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let request = GetResourcesRequest {
                resource_type_filters: [ECR_REPOSITORY_TYPE],
                tag_filters: [
                    TagFilter {
                        key: upstream_image_key,
                    },
                    TagFilter {
                        key: upstream_tags_key,
                    },
                ],
                pagination_token: token.as_deref(),
            };
            let resp: GetResourcesResponse =
                self.client.call(&TAGGING, GET_RESOURCES, &request).await?;
            pages += 1;

            records.extend(resp.resource_tag_mapping_list.into_iter().map(|m| {
                ResourceRecord {
                    arn: m.resource_arn,
                    tags: m.tags.into_iter().map(|t| (t.key, t.value)).collect(),
                }
            }));

            match resp.pagination_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(pages, count = records.len(), "fetched tagged resources");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::sigv4::Credentials;
    use crate::aws::test_server;

    fn client(endpoint: String) -> TaggingClient {
        let creds = Credentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: Some("session".into()),
        };
        TaggingClient::new(
            AwsJsonClient::new("us-east-1", creds, std::time::Duration::from_secs(10))
                .unwrap()
                .with_endpoint(endpoint),
        )
    }

    #[tokio::test]
    async fn test_discover_follows_pagination() {
        let first = r#"{
            "PaginationToken": "page-2",
            "ResourceTagMappingList": [{
                "ResourceARN": "arn:aws:ecr:us-east-1:123456789012:repository/nginx",
                "Tags": [{"Key": "upstream-image", "Value": "nginx"},
                         {"Key": "upstream-tags", "Value": "1.25/1.2+"}]
            }]
        }"#;
        let second = r#"{
            "PaginationToken": "",
            "ResourceTagMappingList": [{
                "ResourceARN": "arn:aws:ecr:us-east-1:123456789012:repository/redis",
                "Tags": [{"Key": "upstream-image", "Value": "redis"}]
            }]
        }"#;
        let (endpoint, server) =
            test_server::serve(vec![(200, first.into()), (200, second.into())]).await;

        let records = client(endpoint)
            .discover("upstream-image", "upstream-tags")
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].tags[1],
            ("upstream-tags".to_string(), "1.25/1.2+".to_string())
        );

        let requests = server.await.unwrap();
        assert!(requests[0].contains(r#""ResourceTypeFilters":["ecr:repository"]"#));
        assert!(requests[0]
            .contains(r#""TagFilters":[{"Key":"upstream-image"},{"Key":"upstream-tags"}]"#));
        assert!(!requests[0].contains("PaginationToken"));
        assert!(requests[1].contains(r#""PaginationToken":"page-2""#));
    }

    #[tokio::test]
    async fn test_discover_failure_is_reported() {
        let (endpoint, _server) = test_server::serve(vec![(
            400,
            r#"{"__type":"AccessDeniedException","Message":"not allowed"}"#.into(),
        )])
        .await;

        let err = client(endpoint)
            .discover("upstream-image", "upstream-tags")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to get resource(s): AccessDeniedException: not allowed"
        );
    }
}
