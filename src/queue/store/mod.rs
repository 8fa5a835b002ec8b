//! Job persistence.
//!
//! Two backends implement [`JobStore`]: Redis for shared multi-process
//! deployments, and memory for tests and single-process runs.

mod backend;
mod factory;
mod memory;
mod redis_store;

pub use backend::{AddOutcome, JobCounts, JobStore};
pub use factory::create_job_store;
pub use memory::MemoryJobStore;
pub use redis_store::RedisJobStore;
