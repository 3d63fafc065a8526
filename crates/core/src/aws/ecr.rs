//! ECR: destination image lookup and the registry authorization token.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::client::{AwsJsonClient, ECR};
use crate::errors::{DestinationError, TokenError};
use crate::services::{AuthorizationToken, DestinationRegistry, ImageDetail, TokenProvider};

const DESCRIBE_IMAGES: &str = "AmazonEC2ContainerRegistry_V20150921.DescribeImages";
const GET_AUTHORIZATION_TOKEN: &str = "AmazonEC2ContainerRegistry_V20150921.GetAuthorizationToken";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImagesRequest<'a> {
    repository_name: &'a str,
    image_ids: Vec<ImageId<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageId<'a> {
    image_tag: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImagesResponse {
    #[serde(default)]
    image_details: Vec<RawImageDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageDetail {
    image_digest: String,
    #[serde(default)]
    image_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationResponse {
    #[serde(default)]
    authorization_data: Vec<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    authorization_token: String,
    /// Epoch seconds.
    #[serde(default)]
    expires_at: Option<f64>,
    #[serde(default)]
    proxy_endpoint: Option<String>,
}

/// ECR API client.
#[derive(Clone)]
pub struct EcrClient {
    client: AwsJsonClient,
}

impl EcrClient {
    pub fn new(client: AwsJsonClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DestinationRegistry for EcrClient {
    #[instrument(skip(self))]
    async fn describe_image(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<ImageDetail, DestinationError> {
        let request = DescribeImagesRequest {
            repository_name: repository,
            image_ids: vec![ImageId { image_tag: tag }],
        };
        let resp: DescribeImagesResponse =
            self.client.call(&ECR, DESCRIBE_IMAGES, &request).await?;

        let detail = resp.image_details.into_iter().next().ok_or_else(|| {
            DestinationError::ImageNotFound(format!(
                "no image with tag '{}' in repository '{}'",
                tag, repository
            ))
        })?;
        debug!(digest = %detail.image_digest, "found destination image");
        Ok(ImageDetail {
            digest: detail.image_digest,
            tags: detail.image_tags,
        })
    }
}

#[async_trait]
impl TokenProvider for EcrClient {
    #[instrument(skip(self))]
    async fn authorization_token(&self) -> Result<AuthorizationToken, TokenError> {
        let resp: AuthorizationResponse = self
            .client
            .call(&ECR, GET_AUTHORIZATION_TOKEN, &serde_json::json!({}))
            .await?;
        let data = resp
            .authorization_data
            .into_iter()
            .next()
            .ok_or(TokenError::Empty)?;

        let (username, password) = decode_token(&data.authorization_token)?;
        let expires_at = data
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

        Ok(AuthorizationToken {
            username,
            password,
            expires_at,
            proxy_endpoint: data.proxy_endpoint,
        })
    }
}

/// Decode a base64 `user:password` authorization token.
pub fn decode_token(encoded: &str) -> Result<(String, String), TokenError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| TokenError::Decode(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| TokenError::Decode(e.to_string()))?;
    match text.split_once(':') {
        Some((user, password)) if !user.is_empty() => Ok((user.to_string(), password.to_string())),
        _ => Err(TokenError::Decode("token is not in user:password form".into())),
    }
}
