// ============================================
// Background Jobs
// ============================================
//
// - State sweeper: long-running loop in `worker` mode
// - Rebuild: one pass over REBUILD_USER_IDS in `rebuild` mode

pub mod rebuild;
pub mod state_sweeper;

pub use rebuild::{RebuildJob, RebuildStats};
pub use state_sweeper::{StateSweeperJob, SweepStats};
