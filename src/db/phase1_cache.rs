use anyhow::Result;
use rusqlite::OptionalExtension;

use super::Database;
use crate::jobs::JobId;
use crate::pipeline::Phase1Result;

impl Database {
    pub fn cache_phase1_result(&self, job_id: JobId, result: &Phase1Result) -> Result<()> {
        let json = serde_json::to_string(result)?;
        self.conn()?.execute(
            r#"
            INSERT INTO phase1_cache (job_id, batch_id, result) VALUES (?, ?, ?)
            ON CONFLICT(job_id, batch_id) DO UPDATE SET result = excluded.result,
                created_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![job_id.0, result.batch_id, json],
        )?;
        Ok(())
    }

    pub fn cached_phase1_result(&self, job_id: JobId, batch_id: &str) -> Result<Option<Phase1Result>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT result FROM phase1_cache WHERE job_id = ? AND batch_id = ?",
                rusqlite::params![job_id.0, batch_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(result) => Ok(Some(result)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, batch_id, error = %e, "discarding unreadable phase1 cache entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_db;
    use crate::jobs::TimeRange;
    use crate::llm::TokenUsage;
    use crate::pipeline::Phase1Result;

    fn result(batch_id: &str, text: &str) -> Phase1Result {
        Phase1Result {
            batch_id: batch_id.to_string(),
            raw_output: text.to_string(),
            summary: text.to_string(),
            image_count: 3,
            time_range: TimeRange {
                start: "2024-01-01T00:00:00".to_string(),
                end: "2024-01-31T00:00:00".to_string(),
            },
            usage: TokenUsage {
                total: 10,
                prompt: 7,
                completion: 3,
            },
            processed_at: "2024-02-01T00:00:00".to_string(),
            failed: false,
        }
    }

    #[test]
    fn test_cache_is_scoped_to_job() {
        let db = test_db();
        let job = db.create_job("alice", "default").unwrap();
        let other = db.create_job("bob", "default").unwrap();

        db.cache_phase1_result(job, &result("2024-01", "beach")).unwrap();

        let hit = db.cached_phase1_result(job, "2024-01").unwrap().unwrap();
        assert_eq!(hit.raw_output, "beach");
        assert!(db.cached_phase1_result(other, "2024-01").unwrap().is_none());
        assert!(db.cached_phase1_result(job, "2024-02").unwrap().is_none());
    }

    #[test]
    fn test_cache_overwrites() {
        let db = test_db();
        let job = db.create_job("alice", "default").unwrap();
        db.cache_phase1_result(job, &result("2024-01", "first")).unwrap();
        db.cache_phase1_result(job, &result("2024-01", "second")).unwrap();

        let hit = db.cached_phase1_result(job, "2024-01").unwrap().unwrap();
        assert_eq!(hit.raw_output, "second");
    }
}
