//! Graphics API boundary
//!
//! Everything the streaming layer needs from the device is expressed by the
//! [`GpuDevice`] trait: command pools and buffers, queue submission, fences,
//! buffer allocation, mapped writes, copies and barriers. [`VulkanDevice`] is
//! the production implementation over `ash`.

mod vulkan;

#[cfg(test)]
pub(crate) mod mock;

pub use vulkan::VulkanDevice;

use ash::vk;
use crate::error::GpuResult;

/// Where a buffer's memory should live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local memory, only reachable through copies
    DeviceLocal,
    /// Host-visible, host-coherent memory used for staging uploads
    HostVisible,
}

/// A native buffer together with the memory bound to it
///
/// Owned by exactly one holder: a [`GrowableBuffer`](crate::GrowableBuffer), a
/// transient staging upload, or the reclaim queue.
#[derive(Debug)]
pub struct GpuBuffer<M> {
    /// Native buffer handle
    pub buffer: vk::Buffer,
    /// Backend-specific memory backing the buffer
    pub memory: M,
    /// Size of the buffer in bytes
    pub size: vk::DeviceSize,
    /// Memory location the buffer was created in
    pub location: MemoryLocation,
}

/// One queue submission: command buffers plus semaphore wiring
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    /// Command buffers in execution order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores waited on before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Pipeline stage for each wait semaphore
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Device primitives used by command pools and growable buffers
///
/// Implementations must be shareable across recording threads. Command pools
/// themselves are not thread-safe; callers guarantee a pool is only touched by
/// one thread at a time.
pub trait GpuDevice: Send + Sync + 'static {
    /// Memory handle bound to each buffer
    type Memory: Send + 'static;

    /// Create a command pool whose buffers can be reset individually or as a pool
    fn create_command_pool(&self, queue_family_index: u32) -> GpuResult<vk::CommandPool>;

    /// Reset a pool, recycling every command buffer allocated from it
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()>;

    /// Destroy a pool and every command buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer>;

    /// Return a command buffer to its pool
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    /// Begin recording
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, one_time_submit: bool) -> GpuResult<()>;

    /// End recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()>;

    /// Submit one batch, optionally signaling `fence`
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()>;

    /// Block until the queue has no pending work
    fn queue_wait_idle(&self, queue: vk::Queue) -> GpuResult<()>;

    /// Block until the whole device is idle
    fn device_wait_idle(&self) -> GpuResult<()>;

    /// Create an unsignaled fence
    fn create_fence(&self) -> GpuResult<vk::Fence>;

    /// Wait for a fence, failing with [`GpuError::Timeout`](crate::GpuError::Timeout) on expiry
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()>;

    /// Reset a fence to unsignaled
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Create a buffer and bind freshly allocated memory to it
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<GpuBuffer<Self::Memory>>;

    /// Destroy a buffer and free its memory immediately
    fn destroy_buffer(&self, buffer: GpuBuffer<Self::Memory>);

    /// Copy bytes into a host-visible buffer through a mapping
    fn write_buffer(&self, buffer: &GpuBuffer<Self::Memory>, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()>;

    /// Record a buffer-to-buffer copy
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// Record a transfer-write to transfer/shader-read barrier on `buffer`
    fn cmd_transfer_barrier(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer);
}
