use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use super::candidate::{
    Excluded, Exclusion, FeatureSource, FetchedPhoto, FilterReport, FilteredPhoto, PhotoCandidate,
};
use crate::config::FilterConfig;
use crate::features::cosine_similarity;

/// Ordered exclusion stages followed by near-duplicate reduction.
pub struct FilterPipeline {
    config: FilterConfig,
}

struct Cluster {
    representative: Vec<f32>,
    members: Vec<usize>,
}

impl FilterPipeline {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Never fails. A panicking fetch loses only that asset's bytes; if any
    /// other stage panics the whole input comes back as survivors, still
    /// fetched, so the run analyses everything instead of aborting.
    pub fn filter(
        &self,
        candidates: Vec<PhotoCandidate>,
        source: &mut dyn FeatureSource,
    ) -> FilterReport {
        let start = Instant::now();
        let input = candidates.clone();

        match catch_unwind(AssertUnwindSafe(|| self.run(candidates, &mut *source))) {
            Ok((survivors, excluded)) => {
                let report = FilterReport {
                    survivors,
                    excluded,
                    elapsed: start.elapsed(),
                };
                tracing::info!(
                    input = input.len(),
                    survivors = report.survivors.len(),
                    videos = report.excluded_count(Exclusion::Video),
                    screenshots = report.excluded_count(Exclusion::Screenshot),
                    downloads = report.excluded_count(Exclusion::Download),
                    incompatible = report.excluded_count(Exclusion::IncompatibleFormat),
                    duplicates = report.excluded_count(Exclusion::Duplicate),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "filtering complete"
                );
                report
            }
            Err(_) => {
                tracing::error!(
                    input = input.len(),
                    "filter pipeline failed, keeping every candidate"
                );
                let survivors = input
                    .into_iter()
                    .map(|candidate| {
                        let fetched = fetch_guarded(source, &candidate);
                        FilteredPhoto { candidate, fetched }
                    })
                    .collect();
                FilterReport {
                    survivors,
                    excluded: Vec::new(),
                    elapsed: start.elapsed(),
                }
            }
        }
    }

    fn run(
        &self,
        candidates: Vec<PhotoCandidate>,
        source: &mut dyn FeatureSource,
    ) -> (Vec<FilteredPhoto>, Vec<Excluded>) {
        let mut excluded = Vec::new();
        let mut remaining = candidates;

        let stages: [(Exclusion, fn(&Self, &PhotoCandidate) -> bool); 4] = [
            (Exclusion::Video, Self::is_video),
            (Exclusion::Screenshot, Self::is_screenshot),
            (Exclusion::Download, Self::is_download),
            (Exclusion::IncompatibleFormat, Self::is_incompatible),
        ];

        for (reason, matches) in stages {
            let (dropped, kept): (Vec<_>, Vec<_>) =
                remaining.into_iter().partition(|c| matches(self, c));
            excluded.extend(dropped.into_iter().map(|candidate| Excluded { candidate, reason }));
            remaining = kept;
        }

        let fetched: Vec<FilteredPhoto> = remaining
            .into_iter()
            .map(|candidate| {
                let fetched = fetch_guarded(source, &candidate);
                FilteredPhoto { candidate, fetched }
            })
            .collect();

        let (survivors, duplicates) = self.deduplicate(fetched);
        excluded.extend(duplicates.into_iter().map(|photo| Excluded {
            candidate: photo.candidate,
            reason: Exclusion::Duplicate,
        }));

        (survivors, excluded)
    }

    fn is_video(&self, candidate: &PhotoCandidate) -> bool {
        let ext = candidate.extension();
        self.config.video_extensions.iter().any(|v| v.eq_ignore_ascii_case(&ext))
    }

    fn is_screenshot(&self, candidate: &PhotoCandidate) -> bool {
        matches_heuristic(
            candidate,
            &self.config.screenshot_keywords,
            &self.config.screenshot_directories,
        )
    }

    fn is_download(&self, candidate: &PhotoCandidate) -> bool {
        matches_heuristic(
            candidate,
            &self.config.download_keywords,
            &self.config.download_directories,
        )
    }

    fn is_incompatible(&self, candidate: &PhotoCandidate) -> bool {
        let ext = candidate.extension();
        !self
            .config
            .compatible_extensions
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&ext))
    }

    /// Greedy single-pass clustering on visual vectors; the best composite
    /// score in each cluster survives, ties going to the earliest member.
    fn deduplicate(&self, photos: Vec<FilteredPhoto>) -> (Vec<FilteredPhoto>, Vec<FilteredPhoto>) {
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut singletons: Vec<usize> = Vec::new();

        for (idx, photo) in photos.iter().enumerate() {
            let visual = match photo.features() {
                Some(f) if f.has_visual() => &f.visual_vector,
                _ => {
                    singletons.push(idx);
                    continue;
                }
            };

            let home = clusters.iter_mut().find(|c| {
                cosine_similarity(visual, &c.representative) > self.config.similarity_threshold
            });
            match home {
                Some(cluster) => cluster.members.push(idx),
                None => clusters.push(Cluster {
                    representative: visual.clone(),
                    members: vec![idx],
                }),
            }
        }

        let mut keep = vec![false; photos.len()];
        for idx in singletons {
            keep[idx] = true;
        }
        for cluster in &clusters {
            let mut best = cluster.members[0];
            let mut best_score = self.score(&photos[best]);
            for &idx in &cluster.members[1..] {
                let score = self.score(&photos[idx]);
                if score > best_score {
                    best = idx;
                    best_score = score;
                }
            }
            keep[best] = true;

            if cluster.members.len() > 1 {
                tracing::debug!(
                    kept = photos[best].candidate.filename(),
                    size = cluster.members.len(),
                    "collapsed near-duplicate cluster"
                );
            }
        }

        let mut survivors = Vec::new();
        let mut duplicates = Vec::new();
        for (photo, keep) in photos.into_iter().zip(keep) {
            if keep {
                survivors.push(photo);
            } else {
                duplicates.push(photo);
            }
        }
        (survivors, duplicates)
    }

    fn score(&self, photo: &FilteredPhoto) -> f32 {
        photo
            .features()
            .map(|f| f.composite_score(self.config.aesthetic_weight, self.config.information_weight))
            .unwrap_or(0.0)
    }
}

/// A panic inside the source counts as a failed fetch for that asset only.
fn fetch_guarded(source: &mut dyn FeatureSource, candidate: &PhotoCandidate) -> Option<FetchedPhoto> {
    match catch_unwind(AssertUnwindSafe(|| source.fetch(candidate))) {
        Ok(fetched) => fetched,
        Err(_) => {
            tracing::error!(filename = candidate.filename(), "fetch panicked, keeping asset without bytes");
            None
        }
    }
}

fn matches_heuristic(candidate: &PhotoCandidate, keywords: &[String], directories: &[String]) -> bool {
    let filename = candidate.filename().to_lowercase();
    let path = candidate
        .asset
        .path
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    let keyword_hit = keywords.iter().any(|k| {
        let k = k.to_lowercase();
        filename.contains(&k) || path.contains(&k)
    });
    if keyword_hit {
        return true;
    }

    let dirs = candidate.directories();
    directories
        .iter()
        .any(|d| dirs.iter().any(|c| c == &d.to_lowercase()))
}
