//! Boundary to the remote photo library.
//!
//! Adapters classify their own failures into [`CloudError`] so the job state
//! machine never has to inspect message text.

mod local;

pub use local::LocalLibraryStore;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("{0}")]
    AuthenticationFailed(String),

    #[error("second-factor verification required")]
    SecondFactorRequired,

    #[error("verification code rejected")]
    SecondFactorRejected,

    #[error("{0}")]
    Other(String),
}

/// Opaque handle to one item in the remote library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub id: String,
    pub filename: String,
    /// Library-relative directory, when the store exposes one.
    pub path: Option<String>,
    pub created_at: NaiveDateTime,
}

pub trait CloudPhotoStore: Send + Sync {
    fn authenticate(&self, email: &str, password: &str)
        -> Result<Arc<dyn CloudSession>, CloudError>;
}

/// An authenticated session. Implementations need not support concurrent
/// downloads; the pipeline issues them one at a time.
pub trait CloudSession: Send + Sync {
    fn requires_second_factor(&self) -> bool;

    fn validate_second_factor(&self, code: &str) -> Result<bool, CloudError>;

    fn list_assets(&self, limit: usize) -> Result<Vec<RemoteAsset>, CloudError>;

    fn download(&self, asset: &RemoteAsset) -> Result<Vec<u8>, CloudError>;
}
