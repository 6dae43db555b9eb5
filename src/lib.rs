//! Memoria: turns a cloud photo library into a behavioural profile.
//!
//! A run authenticates against a [`cloud::CloudPhotoStore`], ingests and
//! deduplicates the library, groups the survivors into time batches, describes
//! each batch with a vision-language model (Phase 1) and folds those
//! descriptions into a six-section profile (Phase 2). [`jobs::AnalysisService`]
//! owns the job lifecycle, including suspension while a password or a
//! verification code is outstanding.

pub mod clip;
pub mod cloud;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod jobs;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod protagonist;
pub mod scanner;

pub use config::Config;
pub use error::{AnalysisError, ServiceError};
pub use jobs::{AnalysisJob, AnalysisService, JobId, JobStatus};
