//! Credential resolution for the AWS clients.
//!
//! Sources are tried in order and the first one that yields keys wins:
//!
//! 1. `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
//! 2. the shared credentials and config files for `AWS_PROFILE`
//!    (`~/.aws/credentials`, `~/.aws/config`)
//! 3. the container credentials endpoint (ECS task roles, EKS pod identity)
//! 4. the EC2 instance metadata service (IMDSv2)
//!
//! Profiles that need STS or an external process (`role_arn`, SSO,
//! `credential_process`, web identity) are rejected with an explicit error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{debug, info};

use super::sigv4::Credentials;
use crate::errors::AwsError;

const DEFAULT_PROFILE: &str = "default";
const ECS_CONTAINER_HOST: &str = "http://169.254.170.2";
const IMDS_DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const IMDS_TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const IMDS_TOKEN_TTL_SECS: &str = "21600";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

const UNSUPPORTED_PROFILE_KEYS: &[&str] = &[
    "role_arn",
    "sso_session",
    "sso_start_url",
    "credential_process",
    "web_identity_token_file",
];

#[derive(Debug, Clone)]
struct ContainerEndpoint {
    url: String,
    token: Option<String>,
    token_file: Option<PathBuf>,
}

/// Where credentials may be found, captured once from the environment.
#[derive(Debug, Clone)]
pub struct CredentialSources {
    static_env: Option<Credentials>,
    profile: String,
    credentials_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
    container: Option<ContainerEndpoint>,
    /// `None` when instance metadata is disabled.
    imds_endpoint: Option<String>,
}

impl CredentialSources {
    /// Sources described by the process environment and home directory.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok(), dirs::home_dir().as_deref())
    }

    /// Sources described by the variables `lookup` returns and `home`.
    pub fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let aws_dir = home.map(|h| h.join(".aws"));

        let static_env = match (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }),
            _ => None,
        };

        let container = var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
            .map(|path| format!("{}{}", ECS_CONTAINER_HOST, path))
            .or_else(|| var("AWS_CONTAINER_CREDENTIALS_FULL_URI"))
            .map(|url| ContainerEndpoint {
                url,
                token: var("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
                token_file: var("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE").map(PathBuf::from),
            });

        let imds_disabled = var("AWS_EC2_METADATA_DISABLED")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        let imds_endpoint = (!imds_disabled).then(|| {
            var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
                .unwrap_or_else(|| IMDS_DEFAULT_ENDPOINT.into())
                .trim_end_matches('/')
                .to_string()
        });

        Self {
            static_env,
            profile: var("AWS_PROFILE")
                .or_else(|| var("AWS_DEFAULT_PROFILE"))
                .unwrap_or_else(|| DEFAULT_PROFILE.into()),
            credentials_file: var("AWS_SHARED_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir.as_ref().map(|d| d.join("credentials"))),
            config_file: var("AWS_CONFIG_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir.as_ref().map(|d| d.join("config"))),
            container,
            imds_endpoint,
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Resolve credentials, trying each source in order.
    pub async fn resolve(&self, http: &reqwest::Client) -> Result<Credentials, AwsError> {
        if let Some(ref creds) = self.static_env {
            debug!("using credentials from the environment");
            return Ok(creds.clone());
        }
        if let Some(creds) = self.profile_credentials()? {
            info!(profile = %self.profile, "using credentials from the shared AWS files");
            return Ok(creds);
        }
        if let Some(ref endpoint) = self.container {
            let creds = fetch_container(http, endpoint).await?;
            info!("using credentials from the container endpoint");
            return Ok(creds);
        }
        if let Some(ref endpoint) = self.imds_endpoint {
            if let Some(creds) = fetch_imds(http, endpoint).await? {
                info!("using credentials from the instance metadata service");
                return Ok(creds);
            }
        }
        Err(AwsError::MissingCredentials(format!(
            "nothing in the environment, the shared files for profile '{}', \
             the container endpoint or instance metadata",
            self.profile
        )))
    }

    /// Static keys of the selected profile. Entries of the credentials file
    /// override the config file.
    fn profile_credentials(&self) -> Result<Option<Credentials>, AwsError> {
        let config_section = if self.profile == DEFAULT_PROFILE {
            DEFAULT_PROFILE.to_string()
        } else {
            format!("profile {}", self.profile)
        };
        let files = [
            (self.config_file.as_deref(), config_section.as_str()),
            (self.credentials_file.as_deref(), self.profile.as_str()),
        ];

        let mut keys = HashMap::new();
        let mut found = false;
        for (path, section) in files {
            let Some(path) = path else { continue };
            if let Some(entries) = read_section(path, section)? {
                found = true;
                keys.extend(entries);
            }
        }

        if !found {
            if self.profile != DEFAULT_PROFILE {
                return Err(AwsError::MissingCredentials(format!(
                    "profile '{}' not found in the shared AWS files",
                    self.profile
                )));
            }
            return Ok(None);
        }
        if let Some(key) = UNSUPPORTED_PROFILE_KEYS
            .iter()
            .find(|key| keys.contains_key(**key))
        {
            return Err(AwsError::MissingCredentials(format!(
                "profile '{}' uses {}, which is not supported; \
                 use static keys or a container or instance role",
                self.profile, key
            )));
        }

        match (
            keys.remove("aws_access_key_id"),
            keys.remove("aws_secret_access_key"),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Some(Credentials {
                access_key_id,
                secret_access_key,
                session_token: keys.remove("aws_session_token"),
            })),
            _ => Ok(None),
        }
    }
}

/// Entries of `[section]` in an INI-style AWS file, or `None` when the file
/// or the section is absent.
fn read_section(path: &Path, section: &str) -> Result<Option<HashMap<String, String>>, AwsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_section(&contents, section)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AwsError::MissingCredentials(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn parse_section(contents: &str, section: &str) -> Option<HashMap<String, String>> {
    let mut entries: Option<HashMap<String, String>> = None;
    let mut in_section = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.split_whitespace().collect::<Vec<_>>().join(" ") == section;
            if in_section {
                entries.get_or_insert_with(HashMap::new);
            }
            continue;
        }
        if !in_section {
            continue;
        }
        if let (Some((key, value)), Some(map)) = (line.split_once('='), entries.as_mut()) {
            map.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    entries
}

/// Temporary credentials document served by the container and instance
/// metadata endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataCredentials {
    #[serde(default)]
    code: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

async fn decode_metadata(resp: reqwest::Response) -> Result<Credentials, AwsError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    if !status.is_success() {
        return Err(AwsError::MissingCredentials(format!(
            "credentials endpoint answered {}: {}",
            status,
            String::from_utf8_lossy(&bytes).trim()
        )));
    }

    let doc: MetadataCredentials =
        serde_json::from_slice(&bytes).map_err(|e| AwsError::ParseError(e.to_string()))?;
    if let Some(code) = doc.code.as_deref().filter(|c| *c != "Success") {
        return Err(AwsError::MissingCredentials(format!(
            "credentials endpoint reported {}",
            code
        )));
    }
    debug!(expiration = ?doc.expiration, "fetched temporary credentials");
    Ok(Credentials {
        access_key_id: doc.access_key_id,
        secret_access_key: doc.secret_access_key,
        session_token: doc.token,
    })
}

async fn fetch_container(
    http: &reqwest::Client,
    endpoint: &ContainerEndpoint,
) -> Result<Credentials, AwsError> {
    let token = match endpoint.token_file {
        Some(ref path) => Some(
            std::fs::read_to_string(path)
                .map_err(|e| {
                    AwsError::MissingCredentials(format!(
                        "cannot read container token {}: {}",
                        path.display(),
                        e
                    ))
                })?
                .trim()
                .to_string(),
        ),
        None => endpoint.token.clone(),
    };

    let mut request = http.get(&endpoint.url).timeout(METADATA_TIMEOUT);
    if let Some(token) = token {
        request = request.header(AUTHORIZATION, token);
    }
    decode_metadata(request.send().await?).await
}

/// `Ok(None)` when no metadata service or no instance profile is available.
async fn fetch_imds(
    http: &reqwest::Client,
    endpoint: &str,
) -> Result<Option<Credentials>, AwsError> {
    let token = match http
        .put(format!("{}/latest/api/token", endpoint))
        .header(IMDS_TOKEN_TTL_HEADER, IMDS_TOKEN_TTL_SECS)
        .timeout(METADATA_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp.text().await?,
        Ok(resp) => {
            debug!(status = %resp.status(), "instance metadata token refused");
            return Ok(None);
        }
        Err(e) => {
            debug!(error = %e, "instance metadata service unreachable");
            return Ok(None);
        }
    };

    let base = format!("{}/latest/meta-data/iam/security-credentials/", endpoint);
    let resp = http
        .get(&base)
        .header(IMDS_TOKEN_HEADER, token.trim())
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        debug!("no instance profile attached");
        return Ok(None);
    }
    let roles = resp.error_for_status()?.text().await?;
    let Some(role) = roles.lines().map(str::trim).find(|r| !r.is_empty()) else {
        return Ok(None);
    };

    let resp = http
        .get(format!("{}{}", base, role))
        .header(IMDS_TOKEN_HEADER, token.trim())
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?;
    decode_metadata(resp).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::test_server;

    fn sources(vars: &[(&str, &str)], home: &Path) -> CredentialSources {
        let mut vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.entry("AWS_EC2_METADATA_DISABLED".into())
            .or_insert_with(|| "true".into());
        CredentialSources::from_lookup(|name| vars.get(name).cloned(), Some(home))
    }

    fn write_aws_file(home: &Path, name: &str, contents: &str) {
        let dir = home.join(".aws");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_shared_credentials_file_default_profile() {
        let home = tempfile::tempdir().unwrap();
        write_aws_file(
            home.path(),
            "credentials",
            "# managed by hand\n[default]\naws_access_key_id = AKIDFILE\naws_secret_access_key = filesecret\n",
        );

        let creds = sources(&[], home.path())
            .resolve(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDFILE");
        assert_eq!(creds.secret_access_key, "filesecret");
        assert_eq!(creds.session_token, None);
    }

    #[tokio::test]
    async fn test_named_profile_merges_config_and_credentials() {
        let home = tempfile::tempdir().unwrap();
        write_aws_file(
            home.path(),
            "config",
            "[default]\nregion = us-east-1\n\n[profile  mirror]\naws_access_key_id = AKIDCONFIG\naws_secret_access_key = configsecret\n",
        );
        write_aws_file(
            home.path(),
            "credentials",
            "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = x\n\n[mirror]\naws_secret_access_key = credsecret\naws_session_token = session\n",
        );

        let sources = sources(&[("AWS_PROFILE", "mirror")], home.path());
        assert_eq!(sources.profile(), "mirror");
        let creds = sources.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "AKIDCONFIG");
        assert_eq!(creds.secret_access_key, "credsecret");
        assert_eq!(creds.session_token.as_deref(), Some("session"));
    }

    #[tokio::test]
    async fn test_environment_wins_over_files() {
        let home = tempfile::tempdir().unwrap();
        write_aws_file(
            home.path(),
            "credentials",
            "[default]\naws_access_key_id = AKIDFILE\naws_secret_access_key = filesecret\n",
        );

        let creds = sources(
            &[
                ("AWS_ACCESS_KEY_ID", "AKIDENV"),
                ("AWS_SECRET_ACCESS_KEY", "envsecret"),
                ("AWS_SESSION_TOKEN", "envsession"),
            ],
            home.path(),
        )
        .resolve(&reqwest::Client::new())
        .await
        .unwrap();
        assert_eq!(creds.access_key_id, "AKIDENV");
        assert_eq!(creds.session_token.as_deref(), Some("envsession"));
    }

    #[tokio::test]
    async fn test_unknown_or_unsupported_profile_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        write_aws_file(
            home.path(),
            "config",
            "[profile assumed]\nrole_arn = arn:aws:iam::123456789012:role/mirror\nsource_profile = default\n",
        );
        let http = reqwest::Client::new();

        let err = sources(&[("AWS_PROFILE", "missing")], home.path())
            .resolve(&http)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("profile 'missing' not found"), "{}", err);

        let err = sources(&[("AWS_PROFILE", "assumed")], home.path())
            .resolve(&http)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("uses role_arn"), "{}", err);
    }

    #[tokio::test]
    async fn test_nothing_configured() {
        let home = tempfile::tempdir().unwrap();
        let err = sources(&[], home.path())
            .resolve(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AwsError::MissingCredentials(_)));
        assert!(err.to_string().contains("profile 'default'"));
    }

    #[tokio::test]
    async fn test_container_endpoint() {
        let (endpoint, server) = test_server::serve(vec![(
            200,
            r#"{"AccessKeyId":"ASIATASK","SecretAccessKey":"tasksecret","Token":"tasktoken","Expiration":"2030-01-01T00:00:00Z"}"#
                .to_string(),
        )])
        .await;
        let home = tempfile::tempdir().unwrap();
        let url = format!("{}/v2/credentials/task", endpoint);

        let creds = sources(
            &[
                ("AWS_CONTAINER_CREDENTIALS_FULL_URI", url.as_str()),
                ("AWS_CONTAINER_AUTHORIZATION_TOKEN", "pod-token"),
            ],
            home.path(),
        )
        .resolve(&reqwest::Client::new())
        .await
        .unwrap();
        assert_eq!(creds.access_key_id, "ASIATASK");
        assert_eq!(creds.session_token.as_deref(), Some("tasktoken"));

        let request = server.await.unwrap()[0].to_ascii_lowercase();
        assert!(request.starts_with("get /v2/credentials/task "));
        assert!(request.contains("authorization: pod-token"));
    }

    #[tokio::test]
    async fn test_instance_metadata() {
        let (endpoint, server) = test_server::serve(vec![
            (200, "imds-token".to_string()),
            (200, "mirror-role\n".to_string()),
            (
                200,
                r#"{"Code":"Success","AccessKeyId":"ASIANODE","SecretAccessKey":"nodesecret","Token":"nodetoken"}"#
                    .to_string(),
            ),
        ])
        .await;
        let home = tempfile::tempdir().unwrap();

        let creds = sources(
            &[
                ("AWS_EC2_METADATA_DISABLED", "false"),
                ("AWS_EC2_METADATA_SERVICE_ENDPOINT", endpoint.as_str()),
            ],
            home.path(),
        )
        .resolve(&reqwest::Client::new())
        .await
        .unwrap();
        assert_eq!(creds.access_key_id, "ASIANODE");
        assert_eq!(creds.session_token.as_deref(), Some("nodetoken"));

        let requests: Vec<String> = server
            .await
            .unwrap()
            .iter()
            .map(|r| r.to_ascii_lowercase())
            .collect();
        assert!(requests[0].starts_with("put /latest/api/token "));
        assert!(requests[0].contains("x-aws-ec2-metadata-token-ttl-seconds: 21600"));
        assert!(requests[2].starts_with("get /latest/meta-data/iam/security-credentials/mirror-role "));
        assert!(requests[2].contains("x-aws-ec2-metadata-token: imds-token"));
    }

    #[test]
    fn test_parse_section_ignores_other_sections() {
        let contents = "[a]\nkey = 1\n[b]\n; comment\nKEY = 2\nother=x=y\n";
        let b = parse_section(contents, "b").unwrap();
        assert_eq!(b.get("key").map(String::as_str), Some("2"));
        assert_eq!(b.get("other").map(String::as_str), Some("x=y"));
        assert!(parse_section(contents, "c").is_none());
    }
}
