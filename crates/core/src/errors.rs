//! Error types for the mirror core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that only care
//! about fatal, run-aborting failures.
//!
//! Per-item errors ([`RegistryError`], [`DestinationError`]) never leave a
//! worker; the orchestrator folds them into an
//! [`ItemStatus`](crate::models::ItemStatus).

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for fatal failures of a run.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation. Always fatal, raised
/// before any work is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Two mutually exclusive options were both set.
    #[error("{first} and {second} cannot be specified at the same time")]
    ConflictingOptions { first: String, second: String },

    /// A `USER[:PASSWORD]` credential string could not be parsed.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// AWS API errors
// ---------------------------------------------------------------------------

/// Errors from the AWS JSON-1.1 APIs (ECR, resource tagging).
#[derive(Debug, Error)]
pub enum AwsError {
    /// No usable credentials in the environment.
    #[error("AWS credentials not found: {0}")]
    MissingCredentials(String),

    /// HTTP-level transport error (network, TLS, etc.).
    #[error("AWS HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API answered with an error document.
    #[error("{code}: {message}")]
    ApiError {
        status: u16,
        code: String,
        message: String,
    },

    /// The response body could not be decoded.
    #[error("AWS response parse error: {0}")]
    ParseError(String),
}

impl AwsError {
    /// The service error code (`RepositoryNotFoundException`, ...), if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ApiError { code, .. } => Some(code),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery errors
// ---------------------------------------------------------------------------

/// Errors from tag discovery. Fatal for the whole run, never retried.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The tagging API call failed.
    #[error("failed to get resource(s): {0}")]
    Request(#[from] AwsError),

    /// A resource identifier could not be parsed.
    #[error("invalid resource ARN '{arn}': {detail}")]
    InvalidArn { arn: String, detail: String },
}

// ---------------------------------------------------------------------------
// Registry (manifest fetch / transfer) errors
// ---------------------------------------------------------------------------

/// Errors from the manifest fetch and image transfer collaborators.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The transfer tool binary was not found on `$PATH`.
    #[error("{0} binary not found")]
    BinaryNotFound(String),

    /// The transfer tool exited with a non-zero status.
    #[error("command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// An image reference was rejected before any call was made.
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    /// The run's shared deadline expired while the call was in flight.
    #[error("timed out: run deadline exceeded")]
    DeadlineExceeded,

    /// Generic I/O wrapper.
    #[error("registry I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Markers in tool output for failures a retry cannot fix.
const PERMANENT_FAILURE_MARKERS: &[&str] = &[
    "manifest unknown",
    "unauthorized",
    "denied",
    "invalid reference format",
];

impl RegistryError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CommandFailed { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                !PERMANENT_FAILURE_MARKERS
                    .iter()
                    .any(|marker| stderr.contains(marker))
            }
            Self::IoError(_) => true,
            Self::BinaryNotFound(_) | Self::InvalidReference(_) | Self::DeadlineExceeded => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Destination lookup errors
// ---------------------------------------------------------------------------

/// Classified outcome of a failed destination image lookup.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("InvalidParameterException: {0}")]
    InvalidParameter(String),

    #[error("RepositoryNotFoundException: {0}")]
    RepositoryNotFound(String),

    #[error("ImageNotFoundException: {0}")]
    ImageNotFound(String),

    /// Any other failure class (throttling, server errors, transport).
    #[error("destination lookup failed: {0}")]
    Other(String),

    #[error("destination lookup timed out: run deadline exceeded")]
    DeadlineExceeded,
}

impl From<AwsError> for DestinationError {
    fn from(err: AwsError) -> Self {
        match err {
            AwsError::ApiError { code, message, .. } => match code.as_str() {
                "InvalidParameterException" => Self::InvalidParameter(message),
                "RepositoryNotFoundException" => Self::RepositoryNotFound(message),
                "ImageNotFoundException" => Self::ImageNotFound(message),
                _ => Self::Other(format!("{}: {}", code, message)),
            },
            other => Self::Other(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization token errors
// ---------------------------------------------------------------------------

/// Errors obtaining or decoding the destination registry token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("could not get ECR authorization token: {0}")]
    Request(#[from] AwsError),

    #[error("ECR returned no authorization data")]
    Empty,

    #[error("could not decode ECR authorization token: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: &str) -> AwsError {
        AwsError::ApiError {
            status: 400,
            code: code.into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_destination_error_classification() {
        assert!(matches!(
            DestinationError::from(api_error("RepositoryNotFoundException")),
            DestinationError::RepositoryNotFound(_)
        ));
        assert!(matches!(
            DestinationError::from(api_error("ImageNotFoundException")),
            DestinationError::ImageNotFound(_)
        ));
        assert!(matches!(
            DestinationError::from(api_error("InvalidParameterException")),
            DestinationError::InvalidParameter(_)
        ));
        assert!(matches!(
            DestinationError::from(api_error("ThrottlingException")),
            DestinationError::Other(_)
        ));
        assert!(matches!(
            DestinationError::from(AwsError::ParseError("bad json".into())),
            DestinationError::Other(_)
        ));
    }

    #[test]
    fn test_destination_error_display_keeps_code() {
        let err = DestinationError::RepositoryNotFound("The repository 'x' does not exist".into());
        assert_eq!(
            err.to_string(),
            "RepositoryNotFoundException: The repository 'x' does not exist"
        );
    }

    #[test]
    fn test_registry_error_retryable() {
        let transient = RegistryError::CommandFailed {
            exit_code: 1,
            stderr: "connection reset by peer".into(),
        };
        assert!(transient.is_retryable());

        let permanent = RegistryError::CommandFailed {
            exit_code: 1,
            stderr: "Error reading manifest: manifest unknown".into(),
        };
        assert!(!permanent.is_retryable());

        assert!(!RegistryError::DeadlineExceeded.is_retryable());
        assert!(!RegistryError::BinaryNotFound("skopeo".into()).is_retryable());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = DiscoveryError::from(api_error("AccessDeniedException")).into();
        assert!(matches!(err, CoreError::Discovery(_)));
        assert!(err.to_string().contains("AccessDeniedException"));

        let err: CoreError = ConfigError::ConflictingOptions {
            first: "src-creds".into(),
            second: "src-no-creds".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "src-creds and src-no-creds cannot be specified at the same time"
        );
    }
}
