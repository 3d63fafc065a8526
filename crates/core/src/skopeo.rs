//! `skopeo` CLI wrapper: raw manifest inspection and image copies.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::errors::RegistryError;
use crate::services::{
    ImageTransfer, ManifestFetcher, PolicyContext, RegistryAuth, SystemContext, TransferRequest,
};

/// Destination manifests are always written as Docker v2 schema 2.
const COPY_FORMAT: &str = "v2s2";

const SECRET_FLAGS: &[&str] = &[
    "--creds",
    "--src-creds",
    "--dest-creds",
    "--registry-token",
    "--src-registry-token",
    "--dest-registry-token",
];

/// Runs `skopeo` for manifest fetches and transfers.
#[derive(Debug, Clone)]
pub struct SkopeoClient {
    binary: String,
}

impl SkopeoClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, RegistryError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = %redacted(&self.binary, args), "running skopeo");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RegistryError::BinaryNotFound(self.binary.clone())
            } else {
                RegistryError::IoError(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "skopeo failed");
            return Err(RegistryError::CommandFailed { exit_code, stderr });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ManifestFetcher for SkopeoClient {
    #[instrument(skip(self, ctx))]
    async fn fetch_manifest(
        &self,
        image_ref: &str,
        ctx: &SystemContext,
    ) -> Result<Vec<u8>, RegistryError> {
        let args = inspect_args(image_ref, ctx)?;
        let raw = self.run(&args).await?;
        debug!(bytes = raw.len(), "fetched raw manifest");
        Ok(raw)
    }
}

#[async_trait]
impl ImageTransfer for SkopeoClient {
    #[instrument(skip(self, request), fields(from = %request.source, to = %request.destination))]
    async fn copy_image(&self, request: &TransferRequest) -> Result<(), RegistryError> {
        let args = copy_args(request)?;
        self.run(&args).await?;
        info!("copy completed");
        Ok(())
    }
}

fn check_reference(image_ref: &str) -> Result<(), RegistryError> {
    let valid = image_ref
        .split_once("://")
        .map(|(transport, name)| !transport.is_empty() && !name.is_empty())
        .unwrap_or(false);
    if !valid || image_ref.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidReference(image_ref.to_string()));
    }
    Ok(())
}

/// Arguments of `skopeo inspect --raw`.
pub fn inspect_args(image_ref: &str, ctx: &SystemContext) -> Result<Vec<String>, RegistryError> {
    check_reference(image_ref)?;
    let mut args = vec!["inspect".to_string(), "--raw".to_string()];
    if let Some(ref auth_file) = ctx.auth_file {
        args.push("--authfile".into());
        args.push(auth_file.display().to_string());
    }
    push_context(&mut args, "", ctx);
    args.push(image_ref.to_string());
    Ok(args)
}

/// Arguments of `skopeo copy`. Policy flags are global and precede the
/// subcommand.
pub fn copy_args(request: &TransferRequest) -> Result<Vec<String>, RegistryError> {
    check_reference(&request.source)?;
    check_reference(&request.destination)?;

    let mut args = Vec::new();
    match request.policy {
        PolicyContext::Default => {}
        PolicyContext::File(ref path) => {
            args.push("--policy".to_string());
            args.push(path.display().to_string());
        }
        PolicyContext::InsecureAcceptAnything => args.push("--insecure-policy".to_string()),
    }

    args.push("copy".into());
    args.push("--format".into());
    args.push(COPY_FORMAT.into());
    args.push("--preserve-digests".into());
    if request.remove_signatures {
        args.push("--remove-signatures".into());
    }
    if let Some(auth_file) = request
        .source_ctx
        .auth_file
        .as_ref()
        .or(request.destination_ctx.auth_file.as_ref())
    {
        args.push("--authfile".into());
        args.push(auth_file.display().to_string());
    }
    push_context(&mut args, "src-", &request.source_ctx);
    push_context(&mut args, "dest-", &request.destination_ctx);
    args.push(request.source.clone());
    args.push(request.destination.clone());
    Ok(args)
}

fn push_context(args: &mut Vec<String>, prefix: &str, ctx: &SystemContext) {
    match ctx.auth {
        RegistryAuth::Default => {}
        RegistryAuth::Anonymous => args.push(format!("--{}no-creds", prefix)),
        RegistryAuth::Basic {
            ref username,
            ref password,
        } => {
            args.push(format!("--{}creds", prefix));
            args.push(if password.is_empty() {
                username.clone()
            } else {
                format!("{}:{}", username, password)
            });
        }
        RegistryAuth::Bearer(ref token) => {
            args.push(format!("--{}registry-token", prefix));
            args.push(token.clone());
        }
    }
    if let Some(ref dir) = ctx.cert_dir {
        args.push(format!("--{}cert-dir", prefix));
        args.push(dir.display().to_string());
    }
}

/// Command line for logs, with credentials masked.
fn redacted(binary: &str, args: &[String]) -> String {
    let mut out = vec![binary.to_string()];
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("***".into());
            mask_next = false;
        } else {
            mask_next = SECRET_FLAGS.contains(&arg.as_str());
            out.push(arg.clone());
        }
    }
    out.join(" ")
}
