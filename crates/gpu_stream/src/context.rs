//! Shared owner of the device, reclaim queue and memory counters
//!
//! One `GpuContext` is created at renderer start-up and handed to every
//! [`GrowableBuffer`](crate::GrowableBuffer) as an `Arc`. The reclaim queue
//! sits behind a mutex but is only mutated from the coordinating thread.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::config::{ConfigError, StreamingConfig};
use crate::device::{GpuBuffer, GpuDevice, MemoryLocation};
use crate::error::GpuResult;
use crate::fatal::OrAbort;
use crate::reclaim::{DeferredReclaimQueue, ReclaimAction};
use crate::telemetry::MemoryTelemetry;

/// Device plus the per-renderer streaming state built on it
pub struct GpuContext<D: GpuDevice> {
    device: Arc<D>,
    reclaim: Mutex<DeferredReclaimQueue<D::Memory>>,
    telemetry: MemoryTelemetry,
    config: StreamingConfig,
}

impl<D: GpuDevice> GpuContext<D> {
    /// Create the context, validating `config`
    pub fn new(device: Arc<D>, config: StreamingConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        log::info!(
            "Creating GPU streaming context ({} frames in flight, {} worker threads)",
            config.frames_in_flight,
            config.resolved_worker_threads()
        );

        Ok(Arc::new(Self {
            device,
            reclaim: Mutex::new(DeferredReclaimQueue::new(config.frames_in_flight)),
            telemetry: MemoryTelemetry::new(),
            config,
        }))
    }

    /// Get the device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Get the streaming configuration
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Get the memory counters
    pub fn telemetry(&self) -> &MemoryTelemetry {
        &self.telemetry
    }

    /// Allocate a buffer, aborting if the device is out of memory
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuBuffer<D::Memory> {
        let buffer = self
            .device
            .create_buffer(size, usage, location, name)
            .or_abort("allocating GPU buffer");
        self.telemetry.record_allocation(location, size);
        buffer
    }

    /// Destroy a buffer right away; the device must no longer reference it
    pub fn destroy_buffer_now(&self, buffer: GpuBuffer<D::Memory>) {
        self.telemetry.record_release(buffer.location, buffer.size);
        self.device.destroy_buffer(buffer);
    }

    /// Park a buffer until every frame that might use it has retired
    pub fn delete_after_frames(&self, action: ReclaimAction<D::Memory>) {
        self.reclaim.lock().delete_after_frames(action);
    }

    /// Frame-boundary hook; run alongside the command pool reset
    ///
    /// Returns the number of buffers released.
    pub fn end_frame(&self) -> usize {
        let mut reclaim = self.reclaim.lock();
        let released = reclaim.advance_frame(|action| self.destroy_buffer_now(action.into_buffer()));
        if released > 0 {
            log::debug!(
                "Released {} deferred buffers at epoch {} ({} still pending)",
                released,
                reclaim.epoch(),
                reclaim.pending_count()
            );
        }
        released
    }

    /// Current frame epoch
    pub fn current_epoch(&self) -> u64 {
        self.reclaim.lock().epoch()
    }

    /// Number of buffers waiting in the reclaim queue
    pub fn pending_reclaims(&self) -> usize {
        self.reclaim.lock().pending_count()
    }

    /// Wait for the device to go idle, then release every deferred buffer
    pub fn shutdown(&self) -> GpuResult<usize> {
        self.device.device_wait_idle()?;
        let released = self
            .reclaim
            .lock()
            .drain(|action| self.destroy_buffer_now(action.into_buffer()));
        log::info!("GPU streaming context drained {} deferred buffers", released);
        Ok(released)
    }
}

impl<D: GpuDevice> Drop for GpuContext<D> {
    fn drop(&mut self) {
        if self.reclaim.get_mut().pending_count() == 0 {
            return;
        }
        if let Err(e) = self.device.device_wait_idle() {
            log::error!("Device wait failed while dropping GPU context: {}", e);
        }
        let device = &self.device;
        let telemetry = &self.telemetry;
        self.reclaim.get_mut().drain(|action| {
            let buffer = action.into_buffer();
            telemetry.record_release(buffer.location, buffer.size);
            device.destroy_buffer(buffer);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    fn context(frames_in_flight: u64) -> (Arc<MockDevice>, Arc<GpuContext<MockDevice>>) {
        let device = Arc::new(MockDevice::new());
        let config = StreamingConfig::default()
            .with_frames_in_flight(frames_in_flight)
            .with_worker_threads(2);
        let context = GpuContext::new(device.clone(), config).unwrap();
        (device, context)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let device = Arc::new(MockDevice::new());
        let config = StreamingConfig { fence_timeout_ns: 0, ..StreamingConfig::default() };
        assert!(GpuContext::new(device, config).is_err());
    }

    #[test]
    fn test_end_frame_releases_after_frames_in_flight() {
        let (device, context) = context(2);
        let buffer = context.create_buffer(64, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::DeviceLocal, "old");
        let handle = buffer.buffer;
        context.delete_after_frames(ReclaimAction::DeviceBuffer(buffer));

        assert_eq!(context.end_frame(), 0);
        assert!(device.is_alive(handle));
        assert_eq!(context.end_frame(), 1);
        assert!(!device.is_alive(handle));
        assert_eq!(context.telemetry().snapshot().device_bytes, 0);
        assert_eq!(context.current_epoch(), 2);
    }

    #[test]
    fn test_shutdown_drains_immediately() {
        let (device, context) = context(3);
        let buffer = context.create_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::HostVisible, "staging");
        context.delete_after_frames(ReclaimAction::StagingBuffer(buffer));

        assert_eq!(context.shutdown().unwrap(), 1);
        assert_eq!(context.pending_reclaims(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_drop_releases_pending_buffers() {
        let (device, context) = context(2);
        let buffer = context.create_buffer(16, vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::DeviceLocal, "dropped");
        context.delete_after_frames(ReclaimAction::DeviceBuffer(buffer));
        drop(context);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
