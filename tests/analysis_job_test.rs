//! End-to-end runs of `AnalysisService` against a directory-backed library and
//! scripted oracles.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memoria::cloud::LocalLibraryStore;
use memoria::config::{CloudAccount, CloudConfig};
use memoria::db::Database;
use memoria::features::{EmbeddingOracle, FeatureSet};
use memoria::jobs::Credentials;
use memoria::llm::{LlmClient, LlmProvider, OracleRequest, OracleResponse, RequestPart, TokenUsage};
use memoria::pipeline::phase2::SECTION_KEYS;
use memoria::{AnalysisService, Config, JobId, JobStatus, ServiceError};
use tempfile::TempDir;

const EMAIL: &str = "me@example.com";
const PASSWORD: &str = "secret";

const PROFILE: &str = r#"```json
{
  "meta": {"scan_summary": "Weekend walks", "timeline_chapters": ["spring"]},
  "L1_Spatio_Temporal": {"life_radius": "local park", "biological_clock": "mornings"},
  "L3_Social_Graph": {"core_circle": ["friend"], "relationship_dynamics": []},
  "L4_Behavior_Trends": {"social_mask": "relaxed", "consumption_shift": "none"},
  "L5_Psychology": {"personality_type": "calm", "emotional_curve": "flat"},
  "L6_Hooks": {"story_trigger": "the bench"}
}
```"#;

struct FakeLlm {
    phase2: Result<&'static str, &'static str>,
    delay: Duration,
    /// Phase 1 calls whose listing mentions this filename fail.
    failing_photo: Option<&'static str>,
    phase1_calls: AtomicUsize,
    phase2_calls: AtomicUsize,
    phase1_in_flight: AtomicUsize,
    phase1_peak: AtomicUsize,
    phase1_prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    fn new(phase2: Result<&'static str, &'static str>) -> Self {
        Self {
            phase2,
            delay: Duration::ZERO,
            failing_photo: None,
            phase1_calls: AtomicUsize::new(0),
            phase2_calls: AtomicUsize::new(0),
            phase1_in_flight: AtomicUsize::new(0),
            phase1_peak: AtomicUsize::new(0),
            phase1_prompts: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_on(mut self, filename: &'static str) -> Self {
        self.failing_photo = Some(filename);
        self
    }
}

fn texts(request: &OracleRequest) -> Vec<&str> {
    request
        .parts
        .iter()
        .filter_map(|p| match p {
            RequestPart::Text(t) => Some(t.as_str()),
            RequestPart::Image(_) => None,
        })
        .collect()
}

impl LlmProvider for FakeLlm {
    fn generate(&self, request: &OracleRequest) -> anyhow::Result<OracleResponse> {
        let usage = TokenUsage {
            total: 12,
            prompt: 10,
            completion: 2,
        };
        let parts = texts(request);

        if parts.iter().any(|t| t.contains("portrait photographer")) {
            return Ok(OracleResponse {
                text: r#"{"gender": "female", "key_identifiers": ["red scarf"]}"#.to_string(),
                usage,
            });
        }

        if parts.iter().any(|t| t.contains("**Phase 1 results**")) {
            std::thread::sleep(self.delay);
            self.phase2_calls.fetch_add(1, Ordering::SeqCst);
            return match self.phase2 {
                Ok(text) => Ok(OracleResponse {
                    text: text.to_string(),
                    usage,
                }),
                Err(e) => Err(anyhow::anyhow!(e)),
            };
        }

        self.phase1_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.phase1_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.phase1_peak.fetch_max(in_flight, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.phase1_in_flight.fetch_sub(1, Ordering::SeqCst);

        let prompt = parts.join("\n");
        self.phase1_prompts.lock().unwrap().push(prompt.clone());
        if let Some(name) = self.failing_photo {
            if prompt.contains(name) {
                anyhow::bail!("model overloaded");
            }
        }
        Ok(OracleResponse {
            text: "A sunny park.\nTwo people on a bench.\n".to_string(),
            usage,
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

/// One-hot visual vector chosen by the first byte, so identical bytes collide
/// and different leading bytes do not.
struct FakeEmbedder;

impl EmbeddingOracle for FakeEmbedder {
    fn extract(&self, image_bytes: &[u8]) -> FeatureSet {
        let mut visual = vec![0.0; 8];
        if let Some(first) = image_bytes.first() {
            visual[(*first % 8) as usize] = 1.0;
        }
        FeatureSet {
            visual_vector: visual,
            semantic_vector: vec![0.2; 5],
            aesthetic_score: 0.5,
            information_score: 0.5,
            error: None,
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Six files: a video, a screenshot, an unsupported format, two byte-identical
/// photos and one distinct photo. Two survive filtering.
fn write_library(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("clip.mp4"), b"video").unwrap();
    std::fs::write(dir.join("Screenshot_2024.jpg"), b"S-shot").unwrap();
    std::fs::write(dir.join("scan.tiff"), b"T-scan").unwrap();
    std::fs::write(dir.join("a.jpg"), b"A-photo").unwrap();
    std::fs::write(dir.join("a_copy.jpg"), b"A-photo").unwrap();
    std::fs::write(dir.join("plain.png"), b"P-photo").unwrap();
}

struct Harness {
    service: AnalysisService,
    llm: Arc<FakeLlm>,
    library: std::path::PathBuf,
    _dir: TempDir,
}

fn harness(second_factor: Option<&str>, llm: FakeLlm) -> Harness {
    harness_with(second_factor, llm, |_| {})
}

fn harness_with(second_factor: Option<&str>, llm: FakeLlm, configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("library");
    let library = root.join(EMAIL);
    write_library(&library);

    let mut config = Config::default();
    config.cloud = CloudConfig {
        library_root: root,
        max_assets: 100,
        accounts: vec![CloudAccount {
            email: EMAIL.to_string(),
            password: PASSWORD.to_string(),
            second_factor_code: second_factor.map(str::to_string),
        }],
    };
    config.analysis.temp_dir = dir.path().join("tmp");
    config.db_path = dir.path().join("memoria.db");
    configure(&mut config);

    let db = Arc::new(Database::open(&config.db_path).unwrap());
    db.initialize().unwrap();

    let cloud = Arc::new(LocalLibraryStore::new(&config.cloud));
    let llm = Arc::new(llm);
    let provider: Arc<dyn LlmProvider> = llm.clone();
    let service = AnalysisService::new(
        config,
        db,
        cloud,
        LlmClient::with_provider(provider),
        Arc::new(FakeEmbedder),
    );

    Harness {
        service,
        llm,
        library,
        _dir: dir,
    }
}

fn credentials(password: &str) -> Credentials {
    Credentials::new(EMAIL, Some(password.to_string()))
}

fn png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        16,
        16,
        image::Rgb([10, 200, 30]),
    ));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn test_full_run_completes() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.image_count, Some(2));
    assert_eq!(job.used_photos.len(), 2);
    assert_eq!(job.phase1_results.len(), 1);
    assert_eq!(job.phase1_results[0].summary, "A sunny park. Two people on a bench.");

    let profile = job.phase2_profile.unwrap();
    assert_eq!(profile.meta.scan_summary, "Weekend walks");
    assert!(profile.raw_output.contains("```json"));
    assert!(profile.error.is_none());

    let stats = job.stats.unwrap();
    assert_eq!(stats.phase1_usage.total, 12);
    assert_eq!(stats.phase2_usage.total, 12);

    let range = job.time_range.unwrap();
    assert_eq!(range.start.len(), "2024-01-15".len());
    assert!(job.completed_at.is_some());
    assert!(!h.service.is_running(id));
}

#[tokio::test]
async fn test_phase2_failure_still_completes_with_error_profile() {
    let h = harness(None, FakeLlm::new(Err("model overloaded")));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let profile = job.phase2_profile.unwrap();
    assert_eq!(profile.error.as_deref(), Some("model overloaded"));
    assert_eq!(profile.meta.scan_summary, "Analyzed 2 images");

    let document = serde_json::to_value(&profile).unwrap();
    for key in SECTION_KEYS {
        assert!(document[key].is_object(), "missing section {}", key);
    }
}

#[tokio::test]
async fn test_wrong_password_suspends_until_resumed() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials("wrong"))
        .await
        .unwrap();
    let suspended = h.service.wait(id).await.unwrap();
    assert_eq!(suspended.status, JobStatus::NeedsPassword);
    assert!(suspended.error_message.is_some());

    // Wrong kind of input: rejected and the job is left exactly as it was.
    let err = h
        .service
        .resume_with_verification(id, "123456".to_string())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::NotAwaiting {
            expected: JobStatus::NeedsVerification,
            actual: JobStatus::NeedsPassword,
        }
    ));
    let unchanged = h.service.get_job(id).await.unwrap();
    assert_eq!(unchanged.status, JobStatus::NeedsPassword);
    assert_eq!(unchanged.error_message, suspended.error_message);
    assert_eq!(unchanged.updated_at, suspended.updated_at);

    h.service
        .resume_with_password(id, PASSWORD.to_string())
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());
}

#[tokio::test]
async fn test_second_factor_flow() {
    let h = harness(Some("123456"), FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    assert_eq!(
        h.service.wait(id).await.unwrap().status,
        JobStatus::NeedsVerification
    );

    let err = h
        .service
        .resume_with_password(id, PASSWORD.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotAwaiting { .. }));

    h.service
        .resume_with_verification(id, "123456".to_string())
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
}

#[tokio::test]
async fn test_rejected_code_fails_the_job() {
    let h = harness(Some("123456"), FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    h.service.wait(id).await.unwrap();

    h.service
        .resume_with_verification(id, "000000".to_string())
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("verification code rejected"));
}

#[tokio::test]
async fn test_empty_library_fails() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));
    for entry in std::fs::read_dir(&h.library).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("no assets found in the photo library"));
    assert!(job.phase2_profile.is_none());
}

#[tokio::test]
async fn test_everything_filtered_out_fails() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));
    for name in ["a.jpg", "a_copy.jpg", "plain.png"] {
        std::fs::remove_file(h.library.join(name)).unwrap();
    }

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("every asset was filtered out"));
    assert_eq!(h.llm.phase1_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reanalyze_reuses_cached_phase1() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    h.service.wait(id).await.unwrap();
    assert_eq!(h.llm.phase1_calls.load(Ordering::SeqCst), 1);

    h.service.reanalyze(id).await.unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.phase1_results.len(), 1);
    assert_eq!(h.llm.phase1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.llm.phase2_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_inputs_rejected_while_processing() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)).slow(Duration::from_millis(300)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    assert!(h.service.is_running(id));

    let err = h.service.reanalyze(id).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::NotAwaiting {
            actual: JobStatus::Processing,
            ..
        }
    ));
    let err = h
        .service
        .resume_with_password(id, PASSWORD.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotAwaiting { .. }));

    assert_eq!(h.service.wait(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_protagonist_features_reach_phase1() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));

    let features = h
        .service
        .extract_protagonist("alice", png(), "default")
        .await
        .unwrap();
    assert_eq!(features["gender"], "female");

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    h.service.wait(id).await.unwrap();

    let prompts = h.llm.phase1_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("**Protagonist features**"));
    assert!(prompts[0].contains("red scarf"));
}

#[tokio::test]
async fn test_unknown_job() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));
    let err = h.service.get_job(JobId(999)).await.unwrap_err();
    assert!(matches!(err, ServiceError::JobNotFound(JobId(999))));
}

fn write_dated(dir: &Path, name: &str, bytes: &[u8], month: u32) {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    let at = chrono::NaiveDate::from_ymd_opt(2024, month, 15)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
        .and_local_timezone(chrono::Local)
        .single()
        .unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::SystemTime::from(at)).unwrap();
}

#[tokio::test]
async fn test_multi_month_run_bounds_concurrency_and_absorbs_batch_failure() {
    let h = harness_with(
        None,
        FakeLlm::new(Ok(PROFILE))
            .slow(Duration::from_millis(150))
            .failing_on("may.jpg"),
        |config| config.analysis.phase1_concurrency = 2,
    );
    for entry in std::fs::read_dir(&h.library).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }
    write_dated(&h.library, "jul.jpg", b"D-photo", 7);
    write_dated(&h.library, "jan.jpg", b"A-photo", 1);
    write_dated(&h.library, "may.jpg", b"C-photo", 5);
    write_dated(&h.library, "mar.jpg", b"B-photo", 3);

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let job = h.service.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.image_count, Some(4));

    let batch_ids: Vec<&str> = job.phase1_results.iter().map(|r| r.batch_id.as_str()).collect();
    assert_eq!(batch_ids, vec!["2024-01", "2024-03", "2024-05", "2024-07"]);

    let failed: Vec<&str> = job
        .phase1_results
        .iter()
        .filter(|r| r.failed)
        .map(|r| r.batch_id.as_str())
        .collect();
    assert_eq!(failed, vec!["2024-05"]);
    let may = &job.phase1_results[2];
    assert!(may.raw_output.starts_with("Analysis failed:"));
    assert!(may.raw_output.contains("model overloaded"));
    assert_eq!(job.phase1_results[0].summary, "A sunny park. Two people on a bench.");

    assert_eq!(h.llm.phase1_calls.load(Ordering::SeqCst), 4);
    let peak = h.llm.phase1_peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);

    let range = job.time_range.unwrap();
    assert_eq!(range.start, "2024-01-15");
    assert_eq!(range.end, "2024-07-15");
    // Fresh usage only counts successful calls.
    assert_eq!(job.stats.unwrap().phase1_usage.total, 36);
}

#[tokio::test]
async fn test_resume_as_soon_as_suspension_is_visible() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials("wrong"))
        .await
        .unwrap();

    // Poll the persisted status instead of waiting on the run itself.
    loop {
        let job = h.service.get_job(id).await.unwrap();
        if job.status == JobStatus::NeedsPassword {
            break;
        }
        assert_eq!(job.status, JobStatus::Processing);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    h.service
        .resume_with_password(id, PASSWORD.to_string())
        .await
        .unwrap();
    assert_eq!(h.service.wait(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_rejected_password_resume_keeps_stored_credentials() {
    let h = harness(None, FakeLlm::new(Ok(PROFILE)).slow(Duration::from_millis(200)));

    let id = h
        .service
        .start_analysis("alice", "default", credentials(PASSWORD))
        .await
        .unwrap();
    let err = h
        .service
        .resume_with_password(id, "wrong".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotAwaiting { .. }));
    assert_eq!(h.service.wait(id).await.unwrap().status, JobStatus::Completed);

    // The rerun still authenticates with the original password.
    h.service.reanalyze(id).await.unwrap();
    assert_eq!(h.service.wait(id).await.unwrap().status, JobStatus::Completed);
}
