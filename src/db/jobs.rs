use anyhow::{Context, Result};
use rusqlite::OptionalExtension;

use super::Database;
use crate::jobs::{AnalysisJob, JobCompletion, JobId, JobStatus, RunStats, TimeRange};
use crate::pipeline::{Phase1Result, Phase2Profile};

const JOB_COLUMNS: &str = "id, user_id, prompt_set_id, status, phase1_results, phase2_profile, \
     error_message, image_count, time_range_start, time_range_end, stats, used_photos, \
     created_at, updated_at, completed_at";

/// Column values as stored; JSON columns are decoded after the row is read.
struct JobRow {
    id: i64,
    user_id: String,
    prompt_set_id: String,
    status: String,
    phase1_results: Option<String>,
    phase2_profile: Option<String>,
    error_message: Option<String>,
    image_count: Option<i64>,
    time_range_start: Option<String>,
    time_range_end: Option<String>,
    stats: Option<String>,
    used_photos: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            prompt_set_id: row.get(2)?,
            status: row.get(3)?,
            phase1_results: row.get(4)?,
            phase2_profile: row.get(5)?,
            error_message: row.get(6)?,
            image_count: row.get(7)?,
            time_range_start: row.get(8)?,
            time_range_end: row.get(9)?,
            stats: row.get(10)?,
            used_photos: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<AnalysisJob> {
        let status = JobStatus::parse(&self.status)
            .with_context(|| format!("job {} has unknown status '{}'", self.id, self.status))?;

        let phase1_results: Vec<Phase1Result> = match self.phase1_results {
            Some(json) => serde_json::from_str(&json).context("decoding phase1_results")?,
            None => Vec::new(),
        };
        let phase2_profile: Option<Phase2Profile> = match self.phase2_profile {
            Some(json) => Some(serde_json::from_str(&json).context("decoding phase2_profile")?),
            None => None,
        };
        let stats: Option<RunStats> = match self.stats {
            Some(json) => Some(serde_json::from_str(&json).context("decoding stats")?),
            None => None,
        };
        let used_photos: Vec<String> = match self.used_photos {
            Some(json) => serde_json::from_str(&json).context("decoding used_photos")?,
            None => Vec::new(),
        };
        let time_range = match (self.time_range_start, self.time_range_end) {
            (Some(start), Some(end)) => Some(TimeRange { start, end }),
            _ => None,
        };

        Ok(AnalysisJob {
            id: JobId(self.id),
            user_id: self.user_id,
            prompt_set_id: self.prompt_set_id,
            status,
            phase1_results,
            phase2_profile,
            error_message: self.error_message,
            image_count: self.image_count.map(|n| n as usize),
            time_range,
            stats,
            used_photos,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

impl Database {
    pub fn create_job(&self, user_id: &str, prompt_set_id: &str) -> Result<JobId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO analysis_jobs (user_id, prompt_set_id, status) VALUES (?, ?, ?)",
            rusqlite::params![user_id, prompt_set_id, JobStatus::Pending.as_str()],
        )?;
        Ok(JobId(conn.last_insert_rowid()))
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<AnalysisJob>> {
        let row = self
            .conn()?
            .query_row(
                &format!("SELECT {} FROM analysis_jobs WHERE id = ?", JOB_COLUMNS),
                [id.0],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self, user_id: &str) -> Result<Vec<AnalysisJob>> {
        let rows: Vec<JobRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM analysis_jobs WHERE user_id = ? ORDER BY id",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map([user_id], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Move a job from `from` into `processing`, clearing the outputs of any
    /// earlier run. Returns false if the job was not in `from`.
    pub fn mark_processing(&self, id: JobId, from: JobStatus) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE analysis_jobs
            SET status = ?, error_message = NULL,
                phase1_results = NULL, phase2_profile = NULL, stats = NULL,
                image_count = NULL, time_range_start = NULL, time_range_end = NULL,
                used_photos = NULL, completed_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ?
            "#,
            rusqlite::params![JobStatus::Processing.as_str(), id.0, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn set_status(&self, id: JobId, status: JobStatus, error_message: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE analysis_jobs
            SET status = ?, error_message = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            rusqlite::params![status.as_str(), error_message, id.0],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, id: JobId, completion: &JobCompletion) -> Result<()> {
        let phase1 = serde_json::to_string(&completion.phase1_results)?;
        let phase2 = serde_json::to_string(&completion.phase2_profile)?;
        let stats = serde_json::to_string(&completion.stats)?;
        let used = serde_json::to_string(&completion.used_photos)?;

        self.conn()?.execute(
            r#"
            UPDATE analysis_jobs
            SET status = ?, error_message = NULL,
                phase1_results = ?, phase2_profile = ?, image_count = ?,
                time_range_start = ?, time_range_end = ?, stats = ?, used_photos = ?,
                updated_at = CURRENT_TIMESTAMP, completed_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            rusqlite::params![
                JobStatus::Completed.as_str(),
                phase1,
                phase2,
                completion.image_count as i64,
                completion.time_range.start,
                completion.time_range.end,
                stats,
                used,
                id.0,
            ],
        )?;
        Ok(())
    }
}
