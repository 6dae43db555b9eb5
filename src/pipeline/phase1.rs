//! Map step: one vision-oracle call per batch.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::batcher::Batch;
use crate::jobs::TimeRange;
use crate::llm::{LlmClient, OracleRequest, TokenUsage};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const SUMMARY_SCAN_LINES: usize = 5;
const SUMMARY_KEEP_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Result {
    pub batch_id: String,
    pub raw_output: String,
    pub summary: String,
    pub image_count: usize,
    pub time_range: TimeRange,
    #[serde(default)]
    pub usage: TokenUsage,
    pub processed_at: String,
    /// The oracle call failed; `raw_output` holds the failure text.
    #[serde(default)]
    pub failed: bool,
}

pub struct Phase1Mapper {
    llm: LlmClient,
    max_images: usize,
}

fn timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

impl Phase1Mapper {
    pub fn new(llm: LlmClient, max_images: usize) -> Self {
        Self { llm, max_images }
    }

    /// Prompt (plus protagonist block), then images for the first
    /// `max_images` photos that have bytes, then the listing with capture
    /// time and, when EXIF had it, GPS position.
    pub fn build_request(&self, batch: &Batch, prompt: &str, protagonist: Option<&Value>) -> OracleRequest {
        let mut text = prompt.to_string();
        if let Some(features) = protagonist {
            text.push_str("\n\n**Protagonist features**:\n");
            text.push_str(&features.to_string());
        }

        let mut request = OracleRequest::new().text(text);
        let mut listing = Vec::new();
        for photo in batch.photos.iter().take(self.max_images) {
            let mut line = format!(
                "- {} (captured: {}",
                photo.candidate.filename(),
                timestamp(photo.captured_at())
            );
            if let Some(gps) = photo.gps() {
                line.push_str(&format!(", gps: {:.5},{:.5}", gps.latitude, gps.longitude));
            }
            line.push(')');
            listing.push(line);
            if let Some(payload) = photo.payload() {
                request = request.image(payload.clone());
            }
        }
        if batch.photos.len() > self.max_images {
            listing.push(format!("... +{} more", batch.photos.len() - self.max_images));
        }

        request.text(format!("\n**Batch photos**:\n{}", listing.join("\n")))
    }

    /// Blocking. Oracle failures become a failed result rather than an error.
    pub fn map(&self, batch: &Batch, prompt: &str, protagonist: Option<&Value>) -> Phase1Result {
        let request = self.build_request(batch, prompt, protagonist);
        tracing::info!(
            batch_id = %batch.batch_id,
            photos = batch.image_count,
            images = request.image_count(),
            "analysing batch"
        );

        let time_range = TimeRange {
            start: timestamp(batch.time_range.0),
            end: timestamp(batch.time_range.1),
        };
        let processed_at = Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string();

        match self.llm.generate(&request) {
            Ok(response) => {
                let raw_output = response.text.trim().to_string();
                tracing::info!(
                    batch_id = %batch.batch_id,
                    total_tokens = response.usage.total,
                    prompt_tokens = response.usage.prompt,
                    completion_tokens = response.usage.completion,
                    "batch analysed"
                );
                Phase1Result {
                    batch_id: batch.batch_id.clone(),
                    summary: extract_summary(&raw_output),
                    raw_output,
                    image_count: batch.image_count,
                    time_range,
                    usage: response.usage,
                    processed_at,
                    failed: false,
                }
            }
            Err(e) => {
                tracing::error!(batch_id = %batch.batch_id, error = %e, "batch analysis failed");
                Phase1Result {
                    batch_id: batch.batch_id.clone(),
                    raw_output: format!("Analysis failed: {}", e),
                    summary: "analysis failed".to_string(),
                    image_count: batch.image_count,
                    time_range,
                    usage: TokenUsage::default(),
                    processed_at,
                    failed: true,
                }
            }
        }
    }
}

/// Non-empty lines among the first five, first three of those joined by spaces.
pub fn extract_summary(text: &str) -> String {
    text.lines()
        .take(SUMMARY_SCAN_LINES)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(SUMMARY_KEEP_LINES)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::RemoteAsset;
    use crate::llm::{ImagePayload, LlmProvider, OracleResponse, RequestPart};
    use crate::pipeline::candidate::{FetchedPhoto, FilteredPhoto, PhotoCandidate};
    use crate::scanner::GpsPoint;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Arc;

    struct Scripted(Result<&'static str, &'static str>);

    impl LlmProvider for Scripted {
        fn generate(&self, _request: &OracleRequest) -> anyhow::Result<OracleResponse> {
            match self.0 {
                Ok(text) => Ok(OracleResponse {
                    text: text.to_string(),
                    usage: TokenUsage { total: 30, prompt: 20, completion: 10 },
                }),
                Err(e) => Err(anyhow::anyhow!(e)),
            }
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn mapper(reply: Result<&'static str, &'static str>, max_images: usize) -> Phase1Mapper {
        Phase1Mapper::new(LlmClient::with_provider(Arc::new(Scripted(reply))), max_images)
    }

    fn batch(count: usize, with_payload: bool) -> Batch {
        let at = NaiveDate::from_ymd_opt(2024, 1, 15)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap();
        let photos: Vec<FilteredPhoto> = (0..count)
            .map(|i| {
                let candidate = PhotoCandidate::new(RemoteAsset {
                    id: i.to_string(),
                    filename: format!("IMG_{}.jpg", i),
                    path: None,
                    created_at: at,
                });
                let fetched = with_payload.then(|| FetchedPhoto {
                    content_hash: i.to_string(),
                    captured_at: at,
                    gps: None,
                    features: None,
                    payload: ImagePayload::jpeg(vec![i as u8]),
                });
                FilteredPhoto { candidate, fetched }
            })
            .collect();
        Batch {
            batch_id: "2024-01".to_string(),
            image_count: photos.len(),
            time_range: (at, at),
            photos,
        }
    }

    #[test]
    fn test_request_layout() {
        let m = mapper(Ok(""), 2);
        let features = json!({"gender": "female"});
        let request = m.build_request(&batch(3, true), "Describe.", Some(&features));

        assert_eq!(request.image_count(), 2);
        match &request.parts[0] {
            RequestPart::Text(t) => {
                assert!(t.starts_with("Describe.\n\n**Protagonist features**:\n"));
                assert!(t.contains("\"gender\":\"female\""));
            }
            other => panic!("unexpected first part {:?}", other),
        }
        match request.parts.last() {
            Some(RequestPart::Text(t)) => {
                assert!(t.contains("- IMG_0.jpg (captured: 2024-01-15T09:00:00)"));
                assert!(t.contains("- IMG_1.jpg"));
                assert!(!t.contains("IMG_2.jpg"));
                assert!(t.ends_with("... +1 more"));
            }
            other => panic!("unexpected last part {:?}", other),
        }
    }

    #[test]
    fn test_listing_carries_gps() {
        let m = mapper(Ok(""), 5);
        let mut b = batch(2, true);
        if let Some(fetched) = b.photos[1].fetched.as_mut() {
            fetched.gps = Some(GpsPoint {
                latitude: 48.858_37,
                longitude: -2.294_48,
            });
        }

        let request = m.build_request(&b, "Describe.", None);
        match request.parts.last() {
            Some(RequestPart::Text(t)) => {
                assert!(t.contains("- IMG_0.jpg (captured: 2024-01-15T09:00:00)\n"));
                assert!(t.contains("- IMG_1.jpg (captured: 2024-01-15T09:00:00, gps: 48.85837,-2.29448)"));
            }
            other => panic!("unexpected last part {:?}", other),
        }
    }

    #[test]
    fn test_photos_without_bytes_are_listed_only() {
        let request = mapper(Ok(""), 10).build_request(&batch(2, false), "Describe.", None);
        assert_eq!(request.image_count(), 0);
        assert_eq!(request.parts.len(), 2);
    }

    #[test]
    fn test_successful_map() {
        let result = mapper(Ok("  Beach day.\n\nTwo people.\nSunset.\nDog.\n"), 10)
            .map(&batch(2, true), "Describe.", None);
        assert!(!result.failed);
        assert_eq!(result.summary, "Beach day. Two people. Sunset.");
        assert_eq!(result.usage.total, 30);
        assert_eq!(result.image_count, 2);
        assert_eq!(result.time_range.start, "2024-01-15T09:00:00");
    }

    #[test]
    fn test_failed_call_is_absorbed() {
        let result = mapper(Err("quota exceeded"), 10).map(&batch(1, true), "Describe.", None);
        assert!(result.failed);
        assert_eq!(result.raw_output, "Analysis failed: quota exceeded");
        assert_eq!(result.summary, "analysis failed");
        assert_eq!(result.usage, TokenUsage::default());
    }

    #[test]
    fn test_summary_only_scans_five_lines() {
        assert_eq!(extract_summary("a\n\n\n\n\nb\nc"), "a");
        assert_eq!(extract_summary(""), "");
    }
}
