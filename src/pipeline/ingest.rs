use std::time::{Duration, Instant};

use super::candidate::{FeatureSource, FetchedPhoto, PhotoCandidate};
use super::content_store::ContentStore;
use crate::cloud::CloudSession;
use crate::config::CompressionConfig;
use crate::db::NewStoredPhoto;
use crate::error::AnalysisError;
use crate::features::EmbeddingOracle;
use crate::llm::ImagePayload;
use crate::scanner::{compress_image, content_hash, extract_capture_info};

/// Pulls each candidate from the cloud session, one download at a time, and
/// resolves its features through the content store.
pub struct CloudIngestor<'a> {
    session: &'a dyn CloudSession,
    store: &'a ContentStore,
    embedder: &'a dyn EmbeddingOracle,
    compression: &'a CompressionConfig,
    owner_id: &'a str,
    download_time: Duration,
    process_time: Duration,
    failures: usize,
}

impl<'a> CloudIngestor<'a> {
    pub fn new(
        session: &'a dyn CloudSession,
        store: &'a ContentStore,
        embedder: &'a dyn EmbeddingOracle,
        compression: &'a CompressionConfig,
        owner_id: &'a str,
    ) -> Self {
        Self {
            session,
            store,
            embedder,
            compression,
            owner_id,
            download_time: Duration::ZERO,
            process_time: Duration::ZERO,
            failures: 0,
        }
    }

    pub fn download_time(&self) -> Duration {
        self.download_time
    }

    pub fn process_time(&self) -> Duration {
        self.process_time
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}

impl FeatureSource for CloudIngestor<'_> {
    fn fetch(&mut self, candidate: &PhotoCandidate) -> Option<FetchedPhoto> {
        let started = Instant::now();
        let downloaded = self.session.download(&candidate.asset);
        self.download_time += started.elapsed();

        let bytes = match downloaded {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = AnalysisError::AssetDownloadFailed {
                    asset_id: candidate.asset.id.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "skipping asset");
                self.failures += 1;
                return None;
            }
        };

        let started = Instant::now();
        let capture = extract_capture_info(&bytes, candidate.asset.created_at);
        let hash = content_hash(&bytes);

        let stored = self.store.get_or_create(&hash, || {
            tracing::debug!(filename = candidate.filename(), "extracting features");
            let features = self.embedder.extract(&bytes);
            let compressed = compress_image(&bytes, self.compression);
            NewStoredPhoto {
                content_hash: hash.clone(),
                owner_id: self.owner_id.to_string(),
                filename: candidate.filename().to_string(),
                captured_at: Some(capture.captured_at),
                features,
                compression: compressed.info,
                compressed_data: compressed.data,
                image_data: bytes.clone(),
            }
        });

        let fetched = match stored {
            Ok(stored) => FetchedPhoto {
                content_hash: hash,
                captured_at: capture.captured_at,
                gps: capture.gps,
                features: Some(stored.features),
                payload: match stored.compressed_data {
                    Some(data) => ImagePayload::jpeg(data),
                    None => ImagePayload::from_bytes(bytes),
                },
            },
            Err(e) => {
                tracing::warn!(filename = candidate.filename(), error = %e, "content store unavailable");
                FetchedPhoto {
                    content_hash: hash,
                    captured_at: capture.captured_at,
                    gps: capture.gps,
                    features: None,
                    payload: ImagePayload::from_bytes(bytes),
                }
            }
        };

        self.process_time += started.elapsed();
        Some(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, RemoteAsset};
    use crate::db::test_db;
    use crate::features::FeatureSet;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StaticSession;

    impl CloudSession for StaticSession {
        fn requires_second_factor(&self) -> bool {
            false
        }

        fn validate_second_factor(&self, _code: &str) -> Result<bool, CloudError> {
            Ok(true)
        }

        fn list_assets(&self, _limit: usize) -> Result<Vec<RemoteAsset>, CloudError> {
            Ok(Vec::new())
        }

        fn download(&self, asset: &RemoteAsset) -> Result<Vec<u8>, CloudError> {
            if asset.id == "gone" {
                Err(CloudError::Other("404".into()))
            } else {
                Ok(asset.id.as_bytes().to_vec())
            }
        }
    }

    struct CountingOracle(AtomicUsize);

    impl EmbeddingOracle for CountingOracle {
        fn extract(&self, _image_bytes: &[u8]) -> FeatureSet {
            self.0.fetch_add(1, Ordering::SeqCst);
            FeatureSet {
                visual_vector: vec![1.0, 0.0],
                ..Default::default()
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn candidate(id: &str) -> PhotoCandidate {
        PhotoCandidate::new(RemoteAsset {
            id: id.to_string(),
            filename: format!("{}.jpg", id),
            path: None,
            created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap(),
        })
    }

    #[test]
    fn test_identical_bytes_are_embedded_once() {
        let store = ContentStore::new(Arc::new(test_db()));
        let oracle = CountingOracle(AtomicUsize::new(0));
        let compression = CompressionConfig::default();
        let mut ingestor = CloudIngestor::new(&StaticSession, &store, &oracle, &compression, "alice");

        let a = ingestor.fetch(&candidate("same")).unwrap();
        let b = ingestor.fetch(&candidate("same")).unwrap();

        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(oracle.0.load(Ordering::SeqCst), 1);
        // Not a decodable image: capture time falls back, payload is the original bytes.
        assert_eq!(a.captured_at, candidate("same").asset.created_at);
        assert_eq!(a.payload.data, b"same".to_vec());
        assert!(a.features.unwrap().has_visual());
    }

    #[test]
    fn test_download_failure_is_skipped() {
        let store = ContentStore::new(Arc::new(test_db()));
        let oracle = CountingOracle(AtomicUsize::new(0));
        let compression = CompressionConfig::default();
        let mut ingestor = CloudIngestor::new(&StaticSession, &store, &oracle, &compression, "alice");

        assert!(ingestor.fetch(&candidate("gone")).is_none());
        assert_eq!(ingestor.failures(), 1);
        assert_eq!(oracle.0.load(Ordering::SeqCst), 0);
    }
}
