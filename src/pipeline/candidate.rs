//! Per-stage photo records. Each stage hands the next a new value instead of
//! annotating a shared one.

use chrono::NaiveDateTime;
use std::fmt;
use std::time::Duration;

use crate::cloud::RemoteAsset;
use crate::features::FeatureSet;
use crate::llm::ImagePayload;
use crate::scanner::GpsPoint;

/// An asset as listed by the cloud store, before any bytes are fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoCandidate {
    pub asset: RemoteAsset,
}

impl PhotoCandidate {
    pub fn new(asset: RemoteAsset) -> Self {
        Self { asset }
    }

    pub fn filename(&self) -> &str {
        &self.asset.filename
    }

    /// Lowercased extension without the dot, or empty.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.asset.filename)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    /// Lowercased library-relative directory components.
    pub fn directories(&self) -> Vec<String> {
        self.asset
            .path
            .as_deref()
            .map(|p| {
                p.split(['/', '\\'])
                    .filter(|c| !c.is_empty())
                    .map(|c| c.to_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// What a successful fetch adds to a candidate.
#[derive(Debug, Clone)]
pub struct FetchedPhoto {
    pub content_hash: String,
    pub captured_at: NaiveDateTime,
    pub gps: Option<GpsPoint>,
    /// Absent when the embedding oracle could not score the photo.
    pub features: Option<FeatureSet>,
    /// Bytes sent to the vision oracle.
    pub payload: ImagePayload,
}

/// A candidate that passed every exclusion stage.
#[derive(Debug, Clone)]
pub struct FilteredPhoto {
    pub candidate: PhotoCandidate,
    pub fetched: Option<FetchedPhoto>,
}

impl FilteredPhoto {
    pub fn unfetched(candidate: PhotoCandidate) -> Self {
        Self {
            candidate,
            fetched: None,
        }
    }

    /// EXIF capture time when known, else the store's creation time.
    pub fn captured_at(&self) -> NaiveDateTime {
        self.fetched
            .as_ref()
            .map(|f| f.captured_at)
            .unwrap_or(self.candidate.asset.created_at)
    }

    pub fn features(&self) -> Option<&FeatureSet> {
        self.fetched.as_ref().and_then(|f| f.features.as_ref())
    }

    pub fn gps(&self) -> Option<&GpsPoint> {
        self.fetched.as_ref().and_then(|f| f.gps.as_ref())
    }

    pub fn payload(&self) -> Option<&ImagePayload> {
        self.fetched.as_ref().map(|f| &f.payload)
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.fetched.as_ref().map(|f| f.content_hash.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exclusion {
    Video,
    Screenshot,
    Download,
    IncompatibleFormat,
    Duplicate,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Exclusion::Video => "video",
            Exclusion::Screenshot => "screenshot",
            Exclusion::Download => "download",
            Exclusion::IncompatibleFormat => "incompatible",
            Exclusion::Duplicate => "duplicate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct Excluded {
    pub candidate: PhotoCandidate,
    pub reason: Exclusion,
}

#[derive(Debug, Clone)]
pub struct FilterReport {
    pub survivors: Vec<FilteredPhoto>,
    pub excluded: Vec<Excluded>,
    pub elapsed: Duration,
}

impl FilterReport {
    pub fn excluded_count(&self, reason: Exclusion) -> usize {
        self.excluded.iter().filter(|e| e.reason == reason).count()
    }
}

/// Fetches bytes for a candidate and turns them into features.
///
/// Returning `None` means the bytes could not be obtained; the candidate is
/// kept without features.
pub trait FeatureSource {
    fn fetch(&mut self, candidate: &PhotoCandidate) -> Option<FetchedPhoto>;
}
