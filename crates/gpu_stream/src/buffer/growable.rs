//! Resizable element array backed by one device-local buffer
//!
//! A [`GrowableBuffer`] behaves like a `Vec<T>` living on the GPU. Growing it
//! allocates a new native buffer, records a copy of the live range into the
//! caller's command buffer and hands the old buffer to the reclaim queue,
//! because frames still executing on the device may read it.
//!
//! # Write Paths
//!
//! - [`write_blocking`](GrowableBuffer::write_blocking): one-shot submit and
//!   fence wait, for start-up uploads
//! - [`write_via_command_context`](GrowableBuffer::write_via_command_context):
//!   copy recorded into an in-flight command buffer
//! - [`enqueue_write`](GrowableBuffer::enqueue_write) +
//!   [`flush`](GrowableBuffer::flush): writes collected on the CPU and
//!   uploaded with one staging buffer and one multi-region copy
//!
//! # Size Model
//!
//! The buffer is tightly packed and sequential. A write of `n` elements at
//! `offset` leaves the logical size at `offset + n`, truncating anything
//! that was logically past `offset`. Callers that need sparse contents track
//! their own offsets and use [`resize`](GrowableBuffer::resize).

use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::pending::ShadowBatch;
use crate::config::GrowthPolicy;
use crate::context::GpuContext;
use crate::device::{GpuBuffer, GpuDevice, MemoryLocation, SubmitBatch};
use crate::error::{GpuError, GpuResult};
use crate::fatal::OrAbort;
use crate::reclaim::ReclaimAction;

/// Byte placement of a write of `count` elements at element `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteExtent {
    byte_offset: u64,
    byte_len: u64,
    /// First element past the write
    end: u64,
}

impl WriteExtent {
    /// Fails with [`GpuError::OutOfMemory`] when the range is not addressable
    fn new(offset: u64, count: u64, stride: u64) -> GpuResult<Self> {
        let unaddressable = || GpuError::OutOfMemory { requested: u64::MAX };
        let end = offset.checked_add(count).ok_or_else(unaddressable)?;
        let byte_end = end.checked_mul(stride).ok_or_else(unaddressable)?;
        let byte_offset = offset * stride;
        Ok(Self {
            byte_offset,
            byte_len: byte_end - byte_offset,
            end,
        })
    }

    fn region(&self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: 0,
            dst_offset: self.byte_offset,
            size: self.byte_len,
        }
    }
}

/// Logically resizable GPU array of `T`
pub struct GrowableBuffer<T: Pod, D: GpuDevice> {
    context: Arc<GpuContext<D>>,
    /// Always `Some` until `destroy` or drop
    buffer: Option<GpuBuffer<D::Memory>>,
    capacity: u64,
    len: u64,
    usage: vk::BufferUsageFlags,
    shadow: ShadowBatch,
    must_update: bool,
    name: String,
    _marker: PhantomData<T>,
}

impl<T: Pod, D: GpuDevice> GrowableBuffer<T, D> {
    const STRIDE: u64 = mem::size_of::<T>() as u64;

    /// Create an empty buffer backed by a one-element placeholder
    ///
    /// `usage` is extended with transfer source and destination so the buffer
    /// can always be grown.
    pub fn new(context: Arc<GpuContext<D>>, usage: vk::BufferUsageFlags, name: impl Into<String>) -> Self {
        assert!(Self::STRIDE > 0, "zero-sized element types cannot be stored in a GPU buffer");

        let name = name.into();
        let usage = usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let buffer = context.create_buffer(Self::STRIDE, usage, MemoryLocation::DeviceLocal, &name);

        Self {
            context,
            buffer: Some(buffer),
            capacity: 0,
            len: 0,
            usage,
            shadow: ShadowBatch::default(),
            must_update: true,
            name,
            _marker: PhantomData,
        }
    }

    fn native(&self) -> &GpuBuffer<D::Memory> {
        self.buffer.as_ref().expect("growable buffer used after destroy")
    }

    /// Bytes per element
    pub const fn stride() -> u64 {
        Self::STRIDE
    }

    /// Logical size in elements
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the logical size is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated size in elements
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Native buffer handle; changes whenever the buffer grows
    pub fn buffer(&self) -> vk::Buffer {
        self.native().buffer
    }

    /// Usage flags the native buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor covering the whole native buffer
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Whether the native handle changed since [`mark_updated`](Self::mark_updated)
    pub fn must_update(&self) -> bool {
        self.must_update
    }

    /// Acknowledge the current native handle, e.g. after rewriting descriptor sets
    pub fn mark_updated(&mut self) {
        self.must_update = false;
    }

    /// Set the logical size to zero without touching GPU memory
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Writes waiting for [`flush`](Self::flush)
    pub fn pending_write_count(&self) -> usize {
        self.shadow.writes().len()
    }

    /// Ensure room for `n` elements, recording the copy-forward into `cmd`
    ///
    /// No-op when `n` already fits. Growth allocates exactly `n` elements
    /// under the default [`GrowthPolicy::Exact`].
    pub fn reserve(&mut self, cmd: vk::CommandBuffer, n: u64) {
        let policy = self.context.config().reserve_growth;
        self.grow(cmd, n, policy);
    }

    /// Reserve `n` elements and set the logical size to `n`
    ///
    /// Shrinking only changes the logical size.
    pub fn resize(&mut self, cmd: vk::CommandBuffer, n: u64) {
        log::debug!("Resizing {} from {} to {} elements", self.name, self.len, n);
        self.reserve(cmd, n);
        self.len = n;
    }

    fn grow(&mut self, cmd: vk::CommandBuffer, required: u64, policy: GrowthPolicy) {
        if required <= self.capacity {
            return;
        }

        let new_capacity = policy.grow(self.capacity, required);
        let new_size = new_capacity
            .checked_mul(Self::STRIDE)
            .ok_or(GpuError::OutOfMemory { requested: u64::MAX })
            .or_abort("sizing grown buffer");
        let replacement = self.context.create_buffer(
            new_size,
            self.usage,
            MemoryLocation::DeviceLocal,
            &self.name,
        );
        let new_handle = replacement.buffer;

        let Some(old) = self.buffer.replace(replacement) else {
            return;
        };

        let device = self.context.device();
        if self.len > 0 {
            let live = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.len * Self::STRIDE,
            };
            device.cmd_copy_buffer(cmd, old.buffer, new_handle, &[live]);
            device.cmd_transfer_barrier(cmd, new_handle);
        }

        log::debug!(
            "Grew {} from {} to {} elements ({} bytes)",
            self.name,
            self.capacity,
            new_capacity,
            new_size
        );

        self.context.delete_after_frames(ReclaimAction::DeviceBuffer(old));
        self.context.telemetry().record_growth();
        self.capacity = new_capacity;
        self.must_update = true;
    }

    fn grow_for_write(&mut self, cmd: vk::CommandBuffer, required: u64) {
        let policy = self.context.config().flush_growth;
        self.grow(cmd, required, policy);
    }

    /// Truncate-then-extend: the logical size ends right after the written range
    fn apply_write_end(&mut self, end: u64) {
        self.len = end;
    }

    fn create_staging(&self, bytes: &[u8]) -> GpuBuffer<D::Memory> {
        let staging = self.context.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::HostVisible,
            &format!("{} staging", self.name),
        );
        self.context
            .device()
            .write_buffer(&staging, 0, bytes)
            .or_abort("writing staging buffer");
        staging
    }

    fn record_staged_copy(&self, cmd: vk::CommandBuffer, staging: &GpuBuffer<D::Memory>, regions: &[vk::BufferCopy]) {
        let device = self.context.device();
        let dst = self.buffer();
        device.cmd_copy_buffer(cmd, staging.buffer, dst, regions);
        device.cmd_transfer_barrier(cmd, dst);
    }

    /// Upload `data` at element `offset` and wait for the device to finish
    ///
    /// Records into a one-shot command buffer from `command_pool`, which the
    /// caller must not be using from another thread. The wait is bounded by
    /// the configured fence timeout; expiry is fatal.
    pub fn write_blocking(&mut self, data: &[T], offset: u64, queue: vk::Queue, command_pool: vk::CommandPool) {
        if data.is_empty() {
            return;
        }
        let extent = WriteExtent::new(offset, data.len() as u64, Self::STRIDE).or_abort("sizing blocking upload");
        let device = Arc::clone(self.context.device());

        let cmd = device
            .allocate_command_buffer(command_pool)
            .or_abort("allocating upload command buffer");
        device.begin_command_buffer(cmd, true).or_abort("beginning upload command buffer");

        self.grow_for_write(cmd, extent.end);
        let staging = self.create_staging(bytemuck::cast_slice(data));
        self.record_staged_copy(cmd, &staging, &[extent.region()]);

        device.end_command_buffer(cmd).or_abort("ending upload command buffer");

        let fence = device.create_fence().or_abort("creating upload fence");
        let submit = SubmitBatch {
            command_buffers: &[cmd],
            ..SubmitBatch::default()
        };
        device.queue_submit(queue, &submit, fence).or_abort("submitting upload");
        device
            .wait_for_fence(fence, self.context.config().fence_timeout_ns)
            .or_abort("waiting for blocking upload");

        device.destroy_fence(fence);
        device.free_command_buffer(command_pool, cmd);
        self.context.destroy_buffer_now(staging);

        self.apply_write_end(extent.end);
    }

    /// Upload `data` at element `offset` through a copy recorded into `cmd`
    ///
    /// The staging buffer is released by the reclaim queue once the frame
    /// that executes `cmd` has retired.
    pub fn write_via_command_context(&mut self, data: &[T], offset: u64, cmd: vk::CommandBuffer) {
        if data.is_empty() {
            return;
        }
        let extent = WriteExtent::new(offset, data.len() as u64, Self::STRIDE).or_abort("sizing recorded upload");

        self.grow_for_write(cmd, extent.end);
        let staging = self.create_staging(bytemuck::cast_slice(data));
        self.record_staged_copy(cmd, &staging, &[extent.region()]);

        self.context.delete_after_frames(ReclaimAction::StagingBuffer(staging));
        self.apply_write_end(extent.end);
    }

    /// Queue `data` for element `offset`; nothing reaches the GPU until [`flush`](Self::flush)
    ///
    /// A later write to the same elements replaces the earlier one.
    pub fn enqueue_write(&mut self, data: &[T], offset: u64) {
        if data.is_empty() {
            return;
        }
        let extent = WriteExtent::new(offset, data.len() as u64, Self::STRIDE).or_abort("sizing queued write");
        self.shadow.push(bytemuck::cast_slice(data), extent.byte_offset);
    }

    /// Upload every queued write with one staging buffer and one copy
    ///
    /// Grows with the amortizing flush policy when the writes reach past
    /// capacity. Returns whether anything was recorded.
    pub fn flush(&mut self, cmd: vk::CommandBuffer) -> bool {
        if self.shadow.is_empty() {
            return false;
        }

        let required = self.shadow.max_dst_end() / Self::STRIDE;
        self.grow_for_write(cmd, required);

        let staging = self.create_staging(self.shadow.bytes());
        let regions = self.shadow.regions();
        self.record_staged_copy(cmd, &staging, &regions);

        log::trace!(
            "Flushed {} writes ({} bytes) into {}",
            regions.len(),
            self.shadow.total_bytes(),
            self.name
        );

        self.apply_write_end(self.shadow.last_end() / Self::STRIDE);

        self.shadow.clear();
        self.context.delete_after_frames(ReclaimAction::StagingBuffer(staging));
        true
    }

    /// Release the native buffer immediately
    ///
    /// The device must be idle with respect to this buffer.
    pub fn destroy(mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.context.destroy_buffer_now(buffer);
        }
    }
}

impl<T: Pod, D: GpuDevice> Drop for GrowableBuffer<T, D> {
    fn drop(&mut self) {
        if !self.shadow.is_empty() {
            log::warn!(
                "{} dropped with {} unflushed writes",
                self.name,
                self.shadow.writes().len()
            );
        }
        if let Some(buffer) = self.buffer.take() {
            self.context.delete_after_frames(ReclaimAction::DeviceBuffer(buffer));
        }
    }
}
