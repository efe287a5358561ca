pub mod cache_entry;
pub mod candidate;
pub mod checkpoint;
pub mod evaluation;
pub mod loaders;
pub mod photo;

pub use cache_entry::{CacheEntry, CacheKey, CacheMetadata};
pub use candidate::CandidateSet;
pub use checkpoint::{BatchCheckpoint, BatchStatus, CheckpointMetadata, CheckpointProgress};
pub use evaluation::{EvaluationResult, GroupResult, ItemTags, ScoredItem};
pub use loaders::load_photo_items;
pub use photo::{ItemPayload, PhotoItem};
