use anyhow::Result;

use super::Database;
use crate::pipeline::{PromptKind, PromptSet};

impl Database {
    pub fn upsert_prompt(&self, prompt_set_id: &str, kind: PromptKind, content: &str) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO prompt_templates (prompt_set_id, kind, content) VALUES (?, ?, ?)
            ON CONFLICT(prompt_set_id, kind) DO UPDATE SET content = excluded.content,
                updated_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![prompt_set_id, kind.as_str(), content],
        )?;
        Ok(())
    }

    /// Stored templates for the set, with built-in defaults for any missing kind.
    pub fn load_prompt_set(&self, prompt_set_id: &str) -> Result<PromptSet> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT kind, content FROM prompt_templates WHERE prompt_set_id = ?")?;
        let rows = stmt
            .query_map([prompt_set_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| r.ok());

        let mut set = PromptSet::default();
        for (kind, content) in rows {
            match PromptKind::parse(&kind) {
                Some(kind) => set.set(kind, content),
                None => tracing::warn!(prompt_set_id, kind = %kind, "ignoring unknown prompt kind"),
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_db;
    use crate::pipeline::{PromptKind, PromptSet};

    #[test]
    fn test_missing_kinds_fall_back_to_defaults() {
        let db = test_db();
        db.upsert_prompt("travel", PromptKind::Phase1, "Describe the trip.").unwrap();

        let set = db.load_prompt_set("travel").unwrap();
        let defaults = PromptSet::default();
        assert_eq!(set.get(PromptKind::Phase1), "Describe the trip.");
        assert_eq!(set.get(PromptKind::Phase2), defaults.get(PromptKind::Phase2));

        let untouched = db.load_prompt_set("unknown").unwrap();
        assert_eq!(untouched, defaults);
    }

    #[test]
    fn test_upsert_replaces() {
        let db = test_db();
        db.upsert_prompt("default", PromptKind::Phase2, "v1").unwrap();
        db.upsert_prompt("default", PromptKind::Phase2, "v2").unwrap();
        assert_eq!(db.load_prompt_set("default").unwrap().get(PromptKind::Phase2), "v2");
    }
}
