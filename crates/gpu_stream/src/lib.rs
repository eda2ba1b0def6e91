//! # GPU Stream
//!
//! Low-level GPU command recording and resource streaming for a Vulkan renderer.
//!
//! ## Components
//!
//! - **Command pools**: [`CommandPoolSet`] hands out recyclable command buffers to
//!   any worker thread and builds one ordered submission batch per frame
//! - **Growable buffers**: [`GrowableBuffer`] presents a resizable element array
//!   backed by a single device-local buffer, with blocking, recorded and batched
//!   write paths
//! - **Deferred reclamation**: [`DeferredReclaimQueue`] holds superseded buffers
//!   until no frame in flight can reference them
//!
//! ## Frame Loop
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use gpu_stream::prelude::*;
//!
//! fn frame<D: GpuDevice>(
//!     context: &Arc<GpuContext<D>>,
//!     pools: &mut CommandPoolSet<D>,
//!     instances: &mut GrowableBuffer<[f32; 16], D>,
//!     queue: vk::Queue,
//!     fence: vk::Fence,
//! ) -> GpuResult<()> {
//!     let workers = &*pools;
//!     std::thread::scope(|scope| {
//!         for thread_id in 0..workers.thread_count() {
//!             scope.spawn(move || {
//!                 let cmd = workers.get_next_command_buffer(thread_id, true);
//!                 // record work...
//!                 workers.end_command_buffer(thread_id, cmd);
//!             });
//!         }
//!     });
//!
//!     let upload = pools.get_next_command_buffer(0, true);
//!     instances.enqueue_write(&[[0.0; 16]], 0);
//!     instances.flush(upload.raw());
//!     pools.queue_command_buffer(upload);
//!
//!     pools.submit_all(queue, &SubmitDependencies::default(), fence);
//!     context.device().wait_for_fence(fence, context.config().fence_timeout_ns)?;
//!     pools.reset_pools();
//!     context.end_frame();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod buffer;
pub mod commands;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod fatal;
pub mod reclaim;
pub mod telemetry;

pub use buffer::{GrowableBuffer, PendingWrite};
pub use commands::{CommandBufferHandle, CommandPoolSet, RecordState, SubmitDependencies, SubmitSummary};
pub use config::{Config, ConfigError, GrowthPolicy, StreamingConfig};
pub use context::GpuContext;
pub use device::{GpuBuffer, GpuDevice, MemoryLocation, SubmitBatch, VulkanDevice};
pub use error::{GpuError, GpuResult};
pub use reclaim::{DeferredReclaimQueue, ReclaimAction};
pub use telemetry::{MemoryTelemetry, TelemetrySnapshot};

/// Common imports for renderer code
pub mod prelude {
    pub use crate::{
        CommandBufferHandle, CommandPoolSet, Config, GpuContext, GpuDevice, GpuError, GpuResult,
        GrowableBuffer, GrowthPolicy, StreamingConfig, SubmitDependencies,
    };
}
