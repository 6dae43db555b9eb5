use anyhow::anyhow;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::registry::RunTicket;
use super::{
    AnalysisJob, CredentialVault, Credentials, JobCompletion, JobId, JobStatus, RunRegistry,
    RunStats, TimeRange,
};
use crate::cloud::{CloudPhotoStore, CloudSession};
use crate::config::Config;
use crate::db::Database;
use crate::error::{AnalysisError, ServiceError};
use crate::features::EmbeddingOracle;
use crate::llm::{LlmClient, TokenUsage};
use crate::pipeline::{
    Batch, CloudIngestor, ContentStore, FilterPipeline, Phase1Mapper, Phase1Result,
    Phase2Reducer, PhotoCandidate, PromptKind, TimeBatcher,
};
use crate::protagonist::ProtagonistExtractor;

/// Drives analysis jobs: creation, background runs, suspension and resumption.
///
/// Cloning is cheap and every clone shares the same registry and vault.
#[derive(Clone)]
pub struct AnalysisService {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Database>,
    cloud: Arc<dyn CloudPhotoStore>,
    llm: LlmClient,
    embedder: Arc<dyn EmbeddingOracle>,
    config: Config,
    registry: RunRegistry,
    vault: CredentialVault,
}

/// Run a blocking closure on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, AnalysisError>
where
    F: FnOnce() -> Result<T, AnalysisError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking task failed: {}", e))?
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "run was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("run panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("run panicked: {}", msg)
    } else {
        "run panicked".to_string()
    }
}

impl AnalysisService {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        cloud: Arc<dyn CloudPhotoStore>,
        llm: LlmClient,
        embedder: Arc<dyn EmbeddingOracle>,
    ) -> Self {
        tracing::info!(
            llm = llm.provider_name(),
            embedder = embedder.name(),
            "analysis service ready"
        );
        Self {
            inner: Arc::new(Inner {
                db,
                cloud,
                llm,
                embedder,
                config,
                registry: RunRegistry::new(),
                vault: CredentialVault::new(),
            }),
        }
    }

    /// Create a job and start its first run. Returns without waiting for it.
    pub async fn start_analysis(
        &self,
        user_id: &str,
        prompt_set_id: &str,
        credentials: Credentials,
    ) -> Result<JobId, ServiceError> {
        let job_id = self.inner.db.create_job(user_id, prompt_set_id)?;
        tracing::info!(job_id = %job_id, user_id, prompt_set_id, "analysis job created");

        self.inner.vault.store(job_id, credentials);
        self.launch(job_id, JobStatus::Pending, None)?;
        Ok(job_id)
    }

    pub async fn resume_with_password(&self, job_id: JobId, password: String) -> Result<(), ServiceError> {
        self.expect_status(job_id, JobStatus::NeedsPassword)?;
        if self.inner.vault.get(job_id).is_none() {
            return Err(ServiceError::MissingCredentials(job_id));
        }
        // Stored credentials change only once the job is ours.
        let ticket = self.claim(job_id, JobStatus::NeedsPassword)?;
        self.inner.vault.set_password(job_id, password);
        self.spawn_run(ticket, None);
        Ok(())
    }

    pub async fn resume_with_verification(&self, job_id: JobId, code: String) -> Result<(), ServiceError> {
        self.expect_status(job_id, JobStatus::NeedsVerification)?;
        self.launch(job_id, JobStatus::NeedsVerification, Some(code))
    }

    /// Restart a finished job from scratch with the credentials on file.
    pub async fn reanalyze(&self, job_id: JobId) -> Result<(), ServiceError> {
        let job = self.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Err(ServiceError::NotAwaiting {
                expected: JobStatus::Completed,
                actual: job.status,
            });
        }
        if self.inner.vault.get(job_id).is_none() {
            return Err(ServiceError::MissingCredentials(job_id));
        }
        self.launch(job_id, job.status, None)
    }

    /// Provide credentials for an existing job, e.g. after a process restart
    /// emptied the in-memory vault.
    pub async fn set_credentials(&self, job_id: JobId, credentials: Credentials) -> Result<(), ServiceError> {
        self.get_job(job_id).await?;
        self.inner.vault.store(job_id, credentials);
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<AnalysisJob, ServiceError> {
        self.inner
            .db
            .get_job(job_id)?
            .ok_or(ServiceError::JobNotFound(job_id))
    }

    pub async fn list_jobs(&self, user_id: &str) -> Result<Vec<AnalysisJob>, ServiceError> {
        Ok(self.inner.db.list_jobs(user_id)?)
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner.registry.is_running(job_id)
    }

    /// Wait for the in-flight run of `job_id`, if any, then return the job.
    pub async fn wait(&self, job_id: JobId) -> Result<AnalysisJob, ServiceError> {
        self.inner.registry.wait(job_id).await;
        self.get_job(job_id).await
    }

    /// Describe the user from a reference photo and keep the result on their
    /// profile for later Phase 1 calls.
    pub async fn extract_protagonist(
        &self,
        user_id: &str,
        image_bytes: Vec<u8>,
        prompt_set_id: &str,
    ) -> Result<Value, ServiceError> {
        let prompt = self
            .inner
            .db
            .load_prompt_set(prompt_set_id)?
            .get(PromptKind::Protagonist)
            .to_string();
        let extractor = ProtagonistExtractor::new(
            self.inner.llm.clone(),
            self.inner.config.analysis.temp_dir.clone(),
        );

        let features = tokio::task::spawn_blocking(move || extractor.extract(&image_bytes, &prompt))
            .await
            .map_err(|e| anyhow!("protagonist extraction failed: {}", e))?
            .map_err(|e| ServiceError::Other(e.into()))?;

        self.inner.db.save_protagonist_features(user_id, &features)?;
        tracing::info!(user_id, "protagonist features saved");
        Ok(features)
    }

    fn expect_status(&self, job_id: JobId, expected: JobStatus) -> Result<(), ServiceError> {
        let job = self
            .inner
            .db
            .get_job(job_id)?
            .ok_or(ServiceError::JobNotFound(job_id))?;
        if job.status != expected {
            return Err(ServiceError::NotAwaiting {
                expected,
                actual: job.status,
            });
        }
        Ok(())
    }

    fn launch(&self, job_id: JobId, from: JobStatus, code: Option<String>) -> Result<(), ServiceError> {
        let ticket = self.claim(job_id, from)?;
        self.spawn_run(ticket, code);
        Ok(())
    }

    /// Take the run slot and move the job `from -> processing`.
    fn claim(&self, job_id: JobId, from: JobStatus) -> Result<RunTicket, ServiceError> {
        let ticket = self.inner.registry.register(job_id)?;

        if !self.inner.db.mark_processing(job_id, from)? {
            let actual = self
                .inner
                .db
                .get_job(job_id)?
                .ok_or(ServiceError::JobNotFound(job_id))?
                .status;
            return Err(ServiceError::NotAwaiting {
                expected: from,
                actual,
            });
        }
        Ok(ticket)
    }

    /// Spawn the run under a supervisor that records its outcome, panics included.
    fn spawn_run(&self, ticket: RunTicket, code: Option<String>) {
        let job_id = ticket.job_id();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let run = tokio::spawn(Arc::clone(&inner).run(job_id, code));
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => Err(AnalysisError::Other(anyhow!(panic_message(e)))),
            };
            ticket.settle();
            inner.record_outcome(job_id, outcome);
            drop(ticket);
        });
    }
}

impl Inner {
    fn record_outcome(&self, job_id: JobId, outcome: Result<JobCompletion, AnalysisError>) {
        let written = match outcome {
            Ok(completion) => {
                tracing::info!(
                    job_id = %job_id,
                    images = completion.image_count,
                    batches = completion.phase1_results.len(),
                    total_secs = completion.stats.total_secs,
                    "analysis completed"
                );
                self.db.complete_job(job_id, &completion)
            }
            Err(e @ AnalysisError::AuthenticationFailed(_)) => {
                tracing::warn!(job_id = %job_id, error = %e, "waiting for password");
                self.db.set_status(job_id, JobStatus::NeedsPassword, Some(&e.to_string()))
            }
            Err(e @ AnalysisError::SecondFactorRequired) => {
                tracing::info!(job_id = %job_id, "waiting for verification code");
                self.db.set_status(job_id, JobStatus::NeedsVerification, Some(&e.to_string()))
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "analysis failed");
                self.db.set_status(job_id, JobStatus::Failed, Some(&e.to_string()))
            }
        };

        if let Err(e) = written {
            tracing::error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }
    }

    async fn run(self: Arc<Self>, job_id: JobId, code: Option<String>) -> Result<JobCompletion, AnalysisError> {
        let started = Instant::now();
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| anyhow!("job {} disappeared", job_id))?;
        tracing::info!(job_id = %job_id, user_id = %job.user_id, "analysis run started");

        let session = self.authenticate(job_id, code).await?;

        let listing = Arc::clone(&session);
        let limit = self.config.cloud.max_assets;
        let assets = blocking(move || Ok(listing.list_assets(limit)?)).await?;
        if assets.is_empty() {
            return Err(AnalysisError::NoAssetsFound);
        }
        tracing::info!(job_id = %job_id, assets = assets.len(), "assets listed");

        let inner = Arc::clone(&self);
        let owner = job.user_id.clone();
        let (report, download_time, process_time) = blocking(move || {
            let store = ContentStore::new(Arc::clone(&inner.db));
            let mut ingestor = CloudIngestor::new(
                session.as_ref(),
                &store,
                inner.embedder.as_ref(),
                &inner.config.compression,
                &owner,
            );
            let candidates = assets.into_iter().map(PhotoCandidate::new).collect();
            let report = FilterPipeline::new(&inner.config.filter).filter(candidates, &mut ingestor);
            if ingestor.failures() > 0 {
                tracing::warn!(failures = ingestor.failures(), "some assets could not be downloaded");
            }
            if let Ok(count) = store.photo_count() {
                tracing::debug!(stored = count, "content store size");
            }
            Ok((report, ingestor.download_time(), ingestor.process_time()))
        })
        .await?;

        let survivors = report.survivors;
        if survivors.is_empty() {
            return Err(AnalysisError::AllAssetsFilteredOut);
        }

        let image_count = survivors.len();
        let used_photos: Vec<String> = survivors
            .iter()
            .filter_map(|p| p.content_hash().map(str::to_string))
            .collect();
        let time_range = {
            let first = survivors.iter().map(|p| p.captured_at()).min();
            let last = survivors.iter().map(|p| p.captured_at()).max();
            match (first, last) {
                (Some(first), Some(last)) => TimeRange {
                    start: first.format("%Y-%m-%d").to_string(),
                    end: last.format("%Y-%m-%d").to_string(),
                },
                _ => TimeRange {
                    start: String::new(),
                    end: String::new(),
                },
            }
        };

        let batches = TimeBatcher::new(self.config.batching.max_batch_size).group(survivors);
        tracing::info!(job_id = %job_id, photos = image_count, batches = batches.len(), "photos batched");

        let prompts = self.db.load_prompt_set(&job.prompt_set_id)?;
        let protagonist = match self.db.get_protagonist_features(&job.user_id) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(user_id = %job.user_id, error = %e, "ignoring unreadable protagonist features");
                None
            }
        };

        let phase1_started = Instant::now();
        let (phase1_results, phase1_usage) = self
            .run_phase1(job_id, batches, prompts.get(PromptKind::Phase1).to_string(), protagonist)
            .await?;
        let phase1_secs = phase1_started.elapsed().as_secs_f64();
        tracing::info!(
            job_id = %job_id,
            secs = phase1_secs,
            total_tokens = phase1_usage.total,
            "phase 1 complete"
        );

        let phase2_started = Instant::now();
        let reducer = Phase2Reducer::new(self.llm.clone());
        let phase2_prompt = prompts.get(PromptKind::Phase2).to_string();
        let reduce_input = phase1_results.clone();
        let (phase2_profile, phase2_usage) =
            blocking(move || Ok(reducer.reduce(&reduce_input, &phase2_prompt))).await?;
        let phase2_secs = phase2_started.elapsed().as_secs_f64();

        let filter_time = report
            .elapsed
            .saturating_sub(download_time + process_time);

        Ok(JobCompletion {
            phase1_results,
            phase2_profile,
            image_count,
            time_range,
            stats: RunStats {
                total_secs: started.elapsed().as_secs_f64(),
                download_secs: download_time.as_secs_f64(),
                filter_secs: filter_time.as_secs_f64(),
                process_secs: process_time.as_secs_f64(),
                phase1_secs,
                phase1_usage,
                phase2_secs,
                phase2_usage,
            },
            used_photos,
        })
    }

    /// Log in, then settle the second factor: validate the supplied code, or
    /// suspend if the store wants one and none was given.
    async fn authenticate(&self, job_id: JobId, code: Option<String>) -> Result<Arc<dyn CloudSession>, AnalysisError> {
        let (email, password) = match self.vault.get(job_id) {
            Some(Credentials {
                email,
                password: Some(password),
            }) => (email, password),
            Some(_) => {
                return Err(AnalysisError::AuthenticationFailed(
                    "a password is required".to_string(),
                ))
            }
            None => {
                return Err(AnalysisError::AuthenticationFailed(
                    "no credentials on file for this job".to_string(),
                ))
            }
        };

        let cloud = Arc::clone(&self.cloud);
        let session = blocking(move || Ok(cloud.authenticate(&email, &password)?)).await?;

        match code {
            Some(code) => {
                let verifying = Arc::clone(&session);
                let accepted = blocking(move || Ok(verifying.validate_second_factor(&code)?)).await?;
                if !accepted {
                    return Err(AnalysisError::SecondFactorRejected);
                }
                tracing::info!(job_id = %job_id, "verification code accepted");
            }
            None if session.requires_second_factor() => {
                return Err(AnalysisError::SecondFactorRequired);
            }
            None => {}
        }

        Ok(session)
    }

    /// Map every batch with bounded concurrency. Results come back in batch
    /// order; fresh successes are cached for later runs of the same job.
    async fn run_phase1(
        &self,
        job_id: JobId,
        batches: Vec<Batch>,
        prompt: String,
        protagonist: Option<Value>,
    ) -> Result<(Vec<Phase1Result>, TokenUsage), AnalysisError> {
        let mapper = Arc::new(Phase1Mapper::new(
            self.llm.clone(),
            self.config.analysis.max_images_per_batch,
        ));
        let permits = Arc::new(Semaphore::new(self.config.analysis.phase1_concurrency.max(1)));
        let prompt = Arc::new(prompt);
        let protagonist = Arc::new(protagonist);

        let mut slots: Vec<Option<Phase1Result>> = vec![None; batches.len()];
        let mut tasks = JoinSet::new();

        for (idx, batch) in batches.into_iter().enumerate() {
            match self.db.cached_phase1_result(job_id, &batch.batch_id) {
                Ok(Some(cached)) => {
                    tracing::info!(job_id = %job_id, batch_id = %batch.batch_id, "reusing cached phase 1 result");
                    slots[idx] = Some(cached);
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(batch_id = %batch.batch_id, error = %e, "phase 1 cache lookup failed"),
            }

            let mapper = Arc::clone(&mapper);
            let permits = Arc::clone(&permits);
            let prompt = Arc::clone(&prompt);
            let protagonist = Arc::clone(&protagonist);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let mapped = tokio::task::spawn_blocking(move || {
                    mapper.map(&batch, &prompt, Option::as_ref(&protagonist))
                })
                .await;
                (idx, mapped)
            });
        }

        let mut usage = TokenUsage::default();
        while let Some(joined) = tasks.join_next().await {
            let (idx, mapped) = joined.map_err(|e| anyhow!("phase 1 task failed: {}", e))?;
            let result = mapped.map_err(|e| anyhow!("phase 1 task failed: {}", e))?;

            usage += result.usage;
            if !result.failed {
                if let Err(e) = self.db.cache_phase1_result(job_id, &result) {
                    tracing::warn!(batch_id = %result.batch_id, error = %e, "could not cache phase 1 result");
                }
            }
            slots[idx] = Some(result);
        }

        Ok((slots.into_iter().flatten().collect(), usage))
    }
}
