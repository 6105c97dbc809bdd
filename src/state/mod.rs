pub mod job;
pub mod locks;
pub mod registry;
pub mod stats;

pub use job::ActiveJob;
pub use locks::{KeyState, LockEntry, LockRequest, LockStatus, ReleaseStatus, SharedLockState};
pub use registry::{AgentRecord, AgentSnapshot, EndedJob, JobRegistry};
pub use stats::{Histogram, JobTypeStats, JobTypeStatsSnapshot, Meter};
