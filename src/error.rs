//! Error taxonomy for a pipeline run and for the job-control surface.

use thiserror::Error;

use crate::cloud::CloudError;
use crate::jobs::{JobId, JobStatus};

/// Why a single run of the pipeline stopped.
///
/// Authentication-class variants suspend the job; every other variant fails it.
/// `AssetDownloadFailed`, `OracleCallFailed` and `ProfileParseFailed` are
/// normally absorbed inside the pipeline and only escape from helpers that
/// callers choose to surface.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("second-factor verification required")]
    SecondFactorRequired,

    #[error("verification code rejected")]
    SecondFactorRejected,

    #[error("no assets found in the photo library")]
    NoAssetsFound,

    #[error("every asset was filtered out")]
    AllAssetsFilteredOut,

    #[error("failed to download asset {asset_id}: {message}")]
    AssetDownloadFailed { asset_id: String, message: String },

    #[error("oracle call failed: {0}")]
    OracleCallFailed(String),

    #[error("could not parse profile: {0}")]
    ProfileParseFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CloudError> for AnalysisError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::AuthenticationFailed(msg) => AnalysisError::AuthenticationFailed(msg),
            CloudError::SecondFactorRequired => AnalysisError::SecondFactorRequired,
            CloudError::SecondFactorRejected => AnalysisError::SecondFactorRejected,
            CloudError::Other(msg) => AnalysisError::Other(anyhow::anyhow!(msg)),
        }
    }
}

/// Errors returned to whoever drives jobs (the CLI, or an embedding application).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job is not awaiting this input: expected {expected}, job is {actual}")]
    NotAwaiting { expected: JobStatus, actual: JobStatus },

    #[error("job {0} already has a run in flight")]
    AlreadyRunning(JobId),

    #[error("no credentials available for job {0}")]
    MissingCredentials(JobId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
