//! The analysis pipeline: filter, batch, map (Phase 1), reduce (Phase 2).

pub mod batcher;
pub mod candidate;
pub mod content_store;
pub mod filter;
pub mod ingest;
pub mod phase1;
pub mod phase2;
pub mod prompts;

pub use batcher::{Batch, TimeBatcher};
pub use candidate::{
    Excluded, Exclusion, FeatureSource, FetchedPhoto, FilterReport, FilteredPhoto, PhotoCandidate,
};
pub use content_store::ContentStore;
pub use filter::FilterPipeline;
pub use ingest::CloudIngestor;
pub use phase1::{Phase1Mapper, Phase1Result};
pub use phase2::{Phase2Profile, Phase2Reducer};
pub use prompts::{PromptKind, PromptSet, DEFAULT_PROMPT_SET};
