//! ecr-mirror-sync command-line tool.
//!
//! Mirrors upstream container images into ECR repositories that carry the
//! `upstream-image` / `upstream-tags` tags. Subcommands list the catalog,
//! copy a single image, run a full sync, or validate a configuration file.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ecrsync_core::aws::{AwsJsonClient, EcrClient, TaggingClient};
use ecrsync_core::catalog::{discover_catalog, explicit_spec};
use ecrsync_core::config::MirrorConfig;
use ecrsync_core::report::catalog_table;
use ecrsync_core::{Collaborators, MirrorSpec, ReportMode, SkopeoClient, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// ecr-mirror-sync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "ecr-mirror-sync",
    version,
    about = "Mirror upstream container images into tagged ECR repositories"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// (default: ~/.config/ecr-mirror-sync/config.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    shared: SharedArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the images that tagged ECR repositories want mirrored.
    List,

    /// Copy a single upstream image into an ECR repository.
    Copy {
        /// Upstream image with tag, e.g. `nginx:1.25`.
        #[arg(short, long)]
        src: Option<String>,

        /// Destination ECR repository, optionally with a tag.
        #[arg(short, long)]
        dest: Option<String>,
    },

    /// Mirror every image listed by tagged ECR repositories.
    Sync,

    /// Validate the configuration and print a summary.
    Validate,
}

/// Flags shared by every subcommand. Each one overrides the configuration
/// file.
#[derive(Args, Debug, Default)]
struct SharedArgs {
    /// AWS region of the ECR and tagging endpoints.
    #[arg(long, global = true)]
    region: Option<String>,

    /// Decide what would be copied without copying anything.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Render results as a table.
    #[arg(long, global = true)]
    render_table: bool,

    /// Number of retries for manifest fetches and copies.
    #[arg(long, global = true)]
    retry_times: Option<u32>,

    /// Number of images mirrored concurrently (default: all at once).
    #[arg(long, global = true)]
    worker_pool_size: Option<usize>,

    /// Wall-clock budget for all network calls of the run, in seconds.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Repository tag key naming the upstream image.
    #[arg(long, global = true)]
    upstream_image_key: Option<String>,

    /// Repository tag key listing the upstream tags.
    #[arg(long, global = true)]
    upstream_tags_key: Option<String>,

    /// Use `USERNAME[:PASSWORD]` for accessing the source registry.
    #[arg(long, global = true)]
    src_creds: Option<String>,

    /// Username for accessing the source registry.
    #[arg(long, global = true)]
    src_username: Option<String>,

    /// Password for accessing the source registry.
    #[arg(long, global = true)]
    src_password: Option<String>,

    /// Bearer token for accessing the source registry.
    #[arg(long, global = true)]
    src_registry_token: Option<String>,

    /// Access the source registry anonymously.
    #[arg(long, global = true)]
    src_no_creds: bool,

    /// Directory with certificates for the source registry.
    #[arg(long, global = true)]
    src_cert_dir: Option<PathBuf>,

    /// Directory with certificates for the destination registry.
    #[arg(long, global = true)]
    dest_cert_dir: Option<PathBuf>,

    /// Registry auth file (default: $REGISTRY_AUTH_FILE).
    #[arg(long, global = true)]
    authfile: Option<PathBuf>,

    /// Signature verification policy file.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Run without any signature verification policy.
    #[arg(long, global = true)]
    insecure_policy: bool,

    /// Path of the skopeo binary.
    #[arg(long, global = true)]
    skopeo_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), &cli.shared) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.debug);

    match run(cli.command, Arc::new(config)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--debug`.
fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(command: Commands, config: Arc<MirrorConfig>) -> Result<()> {
    match command {
        Commands::List => cmd_list(&config).await,
        Commands::Copy { src, dest } => {
            cmd_copy(config, src.as_deref().unwrap_or(""), dest.as_deref().unwrap_or("")).await
        }
        Commands::Sync => cmd_sync(config).await,
        Commands::Validate => cmd_validate(&config),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("ecr-mirror-sync").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_config(path: Option<&Path>, shared: &SharedArgs) -> Result<MirrorConfig> {
    let path = path.map(Path::to_path_buf).or_else(default_config_path);
    let mut config = match path {
        Some(ref path) => {
            MirrorConfig::load_from_file(path).context("failed to load configuration file")?
        }
        None => MirrorConfig::default(),
    };
    config.resolve_env_vars();
    apply_overrides(&mut config, shared);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut MirrorConfig, args: &SharedArgs) {
    if let Some(ref region) = args.region {
        config.region = region.clone();
    }
    config.sync.dry_run |= args.dry_run;
    config.debug |= args.debug;
    config.sync.render_table |= args.render_table;
    if let Some(retries) = args.retry_times {
        config.retry.max_retries = retries;
    }
    if args.worker_pool_size.is_some() {
        config.sync.worker_pool_size = args.worker_pool_size;
    }
    if let Some(secs) = args.timeout_secs {
        config.sync.command_timeout_secs = secs;
    }
    if let Some(ref key) = args.upstream_image_key {
        config.tags.upstream_image_key = key.clone();
    }
    if let Some(ref key) = args.upstream_tags_key {
        config.tags.upstream_tags_key = key.clone();
    }

    let source = &mut config.source;
    if args.src_creds.is_some() {
        source.creds = args.src_creds.clone();
    }
    if args.src_username.is_some() {
        source.username = args.src_username.clone();
    }
    if args.src_password.is_some() {
        source.password = args.src_password.clone();
    }
    if args.src_registry_token.is_some() {
        source.registry_token = args.src_registry_token.clone();
    }
    source.no_creds |= args.src_no_creds;
    if args.src_cert_dir.is_some() {
        source.cert_dir = args.src_cert_dir.clone();
    }
    if args.dest_cert_dir.is_some() {
        config.destination.cert_dir = args.dest_cert_dir.clone();
    }

    if args.authfile.is_some() {
        config.transfer.auth_file = args.authfile.clone();
    }
    if args.policy.is_some() {
        config.transfer.policy_path = args.policy.clone();
    }
    config.transfer.insecure_policy |= args.insecure_policy;
    if let Some(ref path) = args.skopeo_path {
        config.transfer.skopeo_path = path.clone();
    }
}

/// AWS client whose requests are each bounded by the run timeout.
async fn aws_client(config: &MirrorConfig) -> Result<AwsJsonClient> {
    AwsJsonClient::from_default_chain(config.region.clone(), config.command_timeout())
        .await
        .context("failed to create AWS client")
}

async fn build_engine(config: Arc<MirrorConfig>, aws: AwsJsonClient) -> Result<SyncEngine> {
    let ecr = Arc::new(EcrClient::new(aws));
    let skopeo = Arc::new(SkopeoClient::new(config.transfer.skopeo_path.clone()));

    let collaborators = Collaborators {
        registry: ecr.clone(),
        tokens: ecr,
        fetcher: skopeo.clone(),
        transfer: skopeo,
    };
    SyncEngine::new(config, collaborators)
        .await
        .context("failed to initialise sync engine")
}

async fn discover(config: &MirrorConfig, aws: AwsJsonClient) -> Result<Vec<MirrorSpec>> {
    let tagging = TaggingClient::new(aws);
    discover_catalog(&tagging, config)
        .await
        .context("failed to discover tagged repositories")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_list(config: &MirrorConfig) -> Result<()> {
    let specs = discover(config, aws_client(config).await?).await?;
    if ReportMode::from_config(config) == ReportMode::Table {
        println!("{}", catalog_table(&specs));
    }
    Ok(())
}

async fn cmd_copy(config: Arc<MirrorConfig>, src: &str, dest: &str) -> Result<()> {
    let started = Instant::now();
    let spec = explicit_spec(src, dest).context("invalid copy request")?;

    info!("Attempting to copy public image to private ecr repository...");
    let aws = aws_client(&config).await?;
    let engine = build_engine(Arc::clone(&config), aws).await?;
    let report = engine.run(vec![spec]).await;

    report
        .present(ReportMode::from_config(&config), &mut std::io::stdout().lock())
        .context("failed to write report")?;
    info!("Copy completed in {:.2?}", started.elapsed());
    Ok(())
}

async fn cmd_sync(config: Arc<MirrorConfig>) -> Result<()> {
    let started = Instant::now();
    info!("Attempting to sync public images to private ecr repositories...");

    let aws = aws_client(&config).await?;
    let specs = discover(&config, aws.clone()).await?;
    let engine = build_engine(Arc::clone(&config), aws).await?;
    let report = engine.run(specs).await;

    report
        .present(ReportMode::from_config(&config), &mut std::io::stdout().lock())
        .context("failed to write report")?;
    info!("Sync completed in {:.2?}", started.elapsed());
    Ok(())
}

fn cmd_validate(config: &MirrorConfig) -> Result<()> {
    println!("  [OK] Configuration is valid");
    println!();
    println!("Configuration summary:");
    println!("  Region            : {}", config.region);
    println!("  Image tag key     : {}", config.tags.upstream_image_key);
    println!("  Tags tag key      : {}", config.tags.upstream_tags_key);
    println!(
        "  Worker pool       : {}",
        config
            .sync
            .worker_pool_size
            .map(|n| n.to_string())
            .unwrap_or_else(|| "one per image".into())
    );
    println!("  Retries           : {}", config.retry.max_retries);
    println!("  Timeout           : {}s", config.sync.command_timeout_secs);
    println!(
        "  Target platform   : {}/{}",
        config.sync.target_platform.os, config.sync.target_platform.architecture
    );
    let auth = config.source.auth().context("invalid source credentials")?;
    println!("  Source auth       : {}", auth_kind(&auth));
    println!("  Dry run           : {}", config.sync.dry_run);
    println!("  Skopeo            : {}", config.transfer.skopeo_path);
    Ok(())
}

fn auth_kind(auth: &ecrsync_core::services::RegistryAuth) -> &'static str {
    use ecrsync_core::services::RegistryAuth;
    match auth {
        RegistryAuth::Default => "default",
        RegistryAuth::Anonymous => "anonymous",
        RegistryAuth::Basic { .. } => "username/password",
        RegistryAuth::Bearer(_) => "registry token",
    }
}
