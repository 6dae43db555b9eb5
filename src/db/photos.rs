use anyhow::Result;
use chrono::NaiveDateTime;
use rusqlite::OptionalExtension;

use super::Database;
use crate::features::{bytes_to_vector, vector_to_bytes, FeatureSet};
use crate::scanner::CompressionInfo;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A photo in the content-addressed store. Original bytes stay in the
/// database and are not loaded here.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPhoto {
    pub id: i64,
    pub content_hash: String,
    pub owner_id: String,
    pub filename: String,
    pub captured_at: Option<NaiveDateTime>,
    pub features: FeatureSet,
    pub compression: CompressionInfo,
    pub compressed_data: Option<Vec<u8>>,
    pub original_size: u64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewStoredPhoto {
    pub content_hash: String,
    pub owner_id: String,
    pub filename: String,
    pub captured_at: Option<NaiveDateTime>,
    pub features: FeatureSet,
    pub compression: CompressionInfo,
    pub compressed_data: Option<Vec<u8>>,
    pub image_data: Vec<u8>,
}

fn photo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPhoto> {
    let captured_at: Option<String> = row.get(4)?;
    let visual: Option<Vec<u8>> = row.get(5)?;
    let semantic: Option<Vec<u8>> = row.get(6)?;
    let compression: Option<String> = row.get(10)?;
    let original_size: i64 = row.get(12)?;

    Ok(StoredPhoto {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        owner_id: row.get(2)?,
        filename: row.get(3)?,
        captured_at: captured_at
            .and_then(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).ok()),
        features: FeatureSet {
            visual_vector: visual.map(|b| bytes_to_vector(&b)).unwrap_or_default(),
            semantic_vector: semantic.map(|b| bytes_to_vector(&b)).unwrap_or_default(),
            aesthetic_score: row.get::<_, f64>(7)? as f32,
            information_score: row.get::<_, f64>(8)? as f32,
            error: row.get(9)?,
        },
        compression: compression
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default(),
        compressed_data: row.get(11)?,
        original_size: original_size.max(0) as u64,
        created_at: row.get(13)?,
    })
}

impl Database {
    pub fn get_stored_photo(&self, content_hash: &str) -> Result<Option<StoredPhoto>> {
        let photo = self
            .conn()?
            .query_row(
                r#"
                SELECT id, content_hash, owner_id, filename, captured_at,
                       visual_vector, semantic_vector, aesthetic_score, information_score, feature_error,
                       compression, compressed_data, original_size, created_at
                FROM stored_photos
                WHERE content_hash = ?
                "#,
                [content_hash],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    /// Insert unless the hash is already stored; either way return the stored row.
    pub fn insert_stored_photo(&self, photo: &NewStoredPhoto) -> Result<StoredPhoto> {
        let compression = serde_json::to_string(&photo.compression)?;
        let visual = (!photo.features.visual_vector.is_empty())
            .then(|| vector_to_bytes(&photo.features.visual_vector));
        let semantic = (!photo.features.semantic_vector.is_empty())
            .then(|| vector_to_bytes(&photo.features.semantic_vector));

        self.conn()?.execute(
            r#"
            INSERT INTO stored_photos (
                content_hash, owner_id, filename, captured_at,
                visual_vector, semantic_vector, aesthetic_score, information_score, feature_error,
                compression, compressed_data, original_size, image_data
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
            rusqlite::params![
                photo.content_hash,
                photo.owner_id,
                photo.filename,
                photo.captured_at.map(|t| t.format(DATETIME_FORMAT).to_string()),
                visual,
                semantic,
                photo.features.aesthetic_score as f64,
                photo.features.information_score as f64,
                photo.features.error,
                compression,
                photo.compressed_data,
                photo.image_data.len() as i64,
                photo.image_data,
            ],
        )?;

        self.get_stored_photo(&photo.content_hash)?
            .ok_or_else(|| anyhow::anyhow!("stored photo {} vanished after insert", photo.content_hash))
    }

    pub fn count_stored_photos(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM stored_photos", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
