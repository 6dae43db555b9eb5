//! Analysis jobs: persisted state, run bookkeeping and the service that drives them.

pub mod credentials;
pub mod registry;
mod service;

pub use credentials::{CredentialVault, Credentials};
pub use registry::RunRegistry;
pub use service::AnalysisService;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::llm::TokenUsage;
use crate::pipeline::{Phase1Result, Phase2Profile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Suspended until a password is supplied.
    NeedsPassword,
    /// Suspended until a second-factor code is supplied.
    NeedsVerification,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::NeedsPassword => "needs_password",
            JobStatus::NeedsVerification => "needs_verification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "needs_password" => Some(JobStatus::NeedsPassword),
            "needs_verification" => Some(JobStatus::NeedsVerification),
            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, JobStatus::NeedsPassword | JobStatus::NeedsVerification)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive capture-date range, formatted `%Y-%m-%d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Wall-clock timings and token counters for one completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_secs: f64,
    pub download_secs: f64,
    pub filter_secs: f64,
    pub process_secs: f64,
    pub phase1_secs: f64,
    pub phase1_usage: TokenUsage,
    pub phase2_secs: f64,
    pub phase2_usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub user_id: String,
    pub prompt_set_id: String,
    pub status: JobStatus,
    pub phase1_results: Vec<Phase1Result>,
    pub phase2_profile: Option<Phase2Profile>,
    pub error_message: Option<String>,
    pub image_count: Option<usize>,
    pub time_range: Option<TimeRange>,
    pub stats: Option<RunStats>,
    /// Content hashes of the photos the profile was built from.
    pub used_photos: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Everything written when a run finishes successfully.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub phase1_results: Vec<Phase1Result>,
    pub phase2_profile: Phase2Profile,
    pub image_count: usize,
    pub time_range: TimeRange,
    pub stats: RunStats,
    pub used_photos: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::NeedsPassword,
            JobStatus::NeedsVerification,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
        assert!(JobStatus::NeedsVerification.is_suspended());
        assert!(!JobStatus::Failed.is_suspended());
    }
}
