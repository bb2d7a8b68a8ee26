// =============================================================================
// Holdings acquisition: tiered cache + provider table normalization
// =============================================================================

pub mod cache;
pub mod normalizer;

pub use cache::{CacheOutcome, HoldingsCache};
