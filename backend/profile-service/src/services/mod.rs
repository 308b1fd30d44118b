pub mod aggregator;
pub mod classifier;
pub mod coordinator;
pub mod shard_router;
pub mod user_locks;
pub mod weight_model;

pub use aggregator::{Aggregate, AggregateError, ProfileAggregator};
pub use classifier::{CategoryAssignment, CategoryClassifier};
pub use coordinator::{
    BuildOutcome, BuildSummary, CoordinatorSettings, IngestionCoordinator, ReplaySummary,
    UpdateOutcome,
};
pub use shard_router::ShardRouter;
pub use user_locks::UserLockRegistry;
