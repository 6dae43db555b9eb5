use chrono::{Datelike, NaiveDateTime};
use std::collections::BTreeMap;

use super::candidate::FilteredPhoto;

#[derive(Debug, Clone)]
pub struct Batch {
    /// `YYYY-MM`, or `YYYY-MM_Www` when the month was split by ISO week.
    pub batch_id: String,
    /// Sorted by capture time.
    pub photos: Vec<FilteredPhoto>,
    pub time_range: (NaiveDateTime, NaiveDateTime),
    pub image_count: usize,
}

impl Batch {
    fn new(batch_id: String, mut photos: Vec<FilteredPhoto>) -> Option<Self> {
        photos.sort_by_key(|p| p.captured_at());
        let start = photos.first()?.captured_at();
        let end = photos.last()?.captured_at();
        Some(Self {
            batch_id,
            image_count: photos.len(),
            time_range: (start, end),
            photos,
        })
    }
}

/// Groups photos into chronologically ordered batches by capture month.
pub struct TimeBatcher {
    max_batch_size: usize,
}

impl TimeBatcher {
    /// Months with more than `max_batch_size` photos are split by ISO week.
    /// Zero disables splitting.
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }

    pub fn group(&self, photos: Vec<FilteredPhoto>) -> Vec<Batch> {
        let mut months: BTreeMap<String, Vec<FilteredPhoto>> = BTreeMap::new();
        for photo in photos {
            let key = photo.captured_at().format("%Y-%m").to_string();
            months.entry(key).or_default().push(photo);
        }

        let mut batches = Vec::new();
        for (month, photos) in months {
            if self.max_batch_size > 0 && photos.len() > self.max_batch_size {
                let mut weeks: BTreeMap<u32, Vec<FilteredPhoto>> = BTreeMap::new();
                for photo in photos {
                    let week = photo.captured_at().iso_week().week();
                    weeks.entry(week).or_default().push(photo);
                }
                tracing::debug!(month = %month, weeks = weeks.len(), "splitting oversized month");
                batches.extend(weeks.into_iter().filter_map(|(week, photos)| {
                    Batch::new(format!("{}_W{:02}", month, week), photos)
                }));
            } else {
                batches.extend(Batch::new(month, photos));
            }
        }

        batches.sort_by(|a, b| {
            a.time_range
                .0
                .cmp(&b.time_range.0)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        batches
    }
}
