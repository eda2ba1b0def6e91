//! Multi-threaded command buffer allocation and submission

mod pool_set;
mod slot;

pub use pool_set::{CommandPoolSet, SubmitDependencies, SubmitSummary};
pub use slot::{CommandBufferHandle, RecordState};
