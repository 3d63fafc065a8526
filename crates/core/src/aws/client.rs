//! Signed JSON-1.1 client shared by the ECR and resource tagging APIs.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::credentials::CredentialSources;
use super::sigv4::{self, Credentials, SignableRequest};
use crate::errors::AwsError;

const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Endpoint and signing name of one AWS service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub signing_name: &'static str,
    pub endpoint_prefix: &'static str,
}

pub const ECR: Service = Service {
    signing_name: "ecr",
    endpoint_prefix: "api.ecr",
};

pub const TAGGING: Service = Service {
    signing_name: "tagging",
    endpoint_prefix: "tagging",
};

/// Asynchronous client for AWS JSON-1.1 APIs.
#[derive(Clone)]
pub struct AwsJsonClient {
    http: reqwest::Client,
    credentials: Credentials,
    region: String,
    /// Base URL used instead of the regional endpoint (local testing).
    endpoint: Option<String>,
}

impl AwsJsonClient {
    /// Client with fixed credentials. Every request, including the
    /// response body, must complete within `request_timeout`.
    pub fn new(
        region: impl Into<String>,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Self, AwsError> {
        Ok(Self::with_http(
            http_client(request_timeout)?,
            region.into(),
            credentials,
        ))
    }

    /// Client with credentials resolved from the environment, the shared
    /// AWS files, or the container and instance metadata endpoints.
    pub async fn from_default_chain(
        region: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, AwsError> {
        Self::from_sources(region, request_timeout, &CredentialSources::from_env()).await
    }

    pub async fn from_sources(
        region: impl Into<String>,
        request_timeout: Duration,
        sources: &CredentialSources,
    ) -> Result<Self, AwsError> {
        let http = http_client(request_timeout)?;
        let credentials = sources.resolve(&http).await?;
        Ok(Self::with_http(http, region.into(), credentials))
    }

    fn with_http(http: reqwest::Client, region: String, credentials: Credentials) -> Self {
        info!(region = %region, "created AWS client");
        Self {
            http,
            credentials,
            region,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn url_and_host(&self, service: &Service) -> (String, String) {
        match self.endpoint {
            Some(ref endpoint) => {
                let host = endpoint
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(endpoint)
                    .to_string();
                (format!("{}/", endpoint), host)
            }
            None => {
                let domain = if self.region.starts_with("cn-") {
                    "amazonaws.com.cn"
                } else {
                    "amazonaws.com"
                };
                let host = format!("{}.{}.{}", service.endpoint_prefix, self.region, domain);
                (format!("https://{}/", host), host)
            }
        }
    }

    /// Invoke `operation` (e.g. `AmazonEC2ContainerRegistry_V20150921.DescribeImages`)
    /// with a JSON body and decode the JSON answer.
    #[instrument(skip(self, body), fields(service = service.signing_name))]
    pub async fn call<Req, Resp>(
        &self,
        service: &Service,
        operation: &str,
        body: &Req,
    ) -> Result<Resp, AwsError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(body).map_err(|e| AwsError::ParseError(e.to_string()))?;
        let (url, host) = self.url_and_host(service);

        let unsigned = SignableRequest {
            method: "POST",
            path: "/",
            query: "",
            headers: vec![
                ("content-type".into(), JSON_CONTENT_TYPE.into()),
                ("host".into(), host),
                ("x-amz-target".into(), operation.into()),
            ],
            payload: &payload,
        };
        let signed = sigv4::sign(
            &unsigned,
            &self.credentials,
            &self.region,
            service.signing_name,
            Utc::now(),
        );

        let mut headers = HeaderMap::new();
        for (name, value) in signed.iter().filter(|(name, _)| name != "host") {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AwsError::ParseError(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| AwsError::ParseError(e.to_string()))?;
            headers.insert(name, value);
        }

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .body(payload)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            let err = parse_error(status.as_u16(), &bytes);
            warn!(operation, error = %err, "AWS API call failed");
            return Err(err);
        }
        debug!(operation, bytes = bytes.len(), "AWS API call succeeded");
        serde_json::from_slice(&bytes).map_err(|e| AwsError::ParseError(e.to_string()))
    }
}

fn http_client(request_timeout: Duration) -> Result<reqwest::Client, AwsError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("ecr-mirror-sync/0.1"));
    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(request_timeout)
        .build()?)
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    error_type: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// Build an [`AwsError::ApiError`] from a JSON-1.1 error document.
pub(crate) fn parse_error(status: u16, body: &[u8]) -> AwsError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let code = parsed
        .error_type
        .rsplit('#')
        .next()
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP{}", status));
    let message = if parsed.message.is_empty() {
        String::from_utf8_lossy(body).trim().to_string()
    } else {
        parsed.message
    };
    AwsError::ApiError {
        status,
        code,
        message,
    }
}
