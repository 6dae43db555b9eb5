use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use serde_json::Value;

use super::Database;

impl Database {
    pub fn save_protagonist_features(&self, user_id: &str, features: &Value) -> Result<()> {
        let json = serde_json::to_string(features)?;
        self.conn()?.execute(
            r#"
            INSERT INTO user_profiles (user_id, protagonist_features) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET protagonist_features = excluded.protagonist_features,
                updated_at = CURRENT_TIMESTAMP
            "#,
            rusqlite::params![user_id, json],
        )?;
        Ok(())
    }

    pub fn get_protagonist_features(&self, user_id: &str) -> Result<Option<Value>> {
        let json: Option<Option<String>> = self
            .conn()?
            .query_row(
                "SELECT protagonist_features FROM user_profiles WHERE user_id = ?",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;

        match json.flatten() {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("decoding protagonist features")?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_db;
    use serde_json::json;

    #[test]
    fn test_protagonist_features_round_trip() {
        let db = test_db();
        assert!(db.get_protagonist_features("alice").unwrap().is_none());

        db.save_protagonist_features("alice", &json!({"gender": "female"})).unwrap();
        db.save_protagonist_features("alice", &json!({"gender": "female", "age_group": "30s"}))
            .unwrap();

        let features = db.get_protagonist_features("alice").unwrap().unwrap();
        assert_eq!(features["age_group"], "30s");
    }
}
