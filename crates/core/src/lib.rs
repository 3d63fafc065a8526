//! ecr-mirror-sync core library.
//!
//! This crate provides the components for mirroring upstream container
//! images into ECR: configuration, the repository catalog, upstream digest
//! resolution, destination inspection, the sync engine, result reporting,
//! and the AWS and `skopeo` backed collaborators.

pub mod aws;
pub mod catalog;
pub mod config;
pub mod destination;
pub mod digest;
pub mod errors;
pub mod models;
pub mod report;
pub mod retry;
pub mod services;
pub mod skopeo;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::MirrorConfig;
pub use models::{ItemStatus, MirrorSpec};
pub use report::{ReportMode, RunTotals, SyncReport};
pub use retry::RetryPolicy;
pub use skopeo::SkopeoClient;
pub use sync_engine::{Collaborators, SyncEngine};
