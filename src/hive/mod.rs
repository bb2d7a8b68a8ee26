// =============================================================================
// Hive integration: remote community database client, contribution queue,
// and the background identity-domain sync
// =============================================================================

pub mod client;
pub mod contributions;
pub mod sync;

pub use client::{AssetEntry, HiveClient};
pub use contributions::{Contribution, ContributionQueue};
