//! Deferred reclamation of superseded GPU resources
//!
//! With several frames in flight a buffer replaced during frame F may still be
//! read by command buffers from frames F-1 .. F-n that the device has not
//! finished. Such buffers are parked here, tagged with the frame epoch at which
//! they were retired, and released only once `frames_in_flight` frame
//! boundaries have passed.

use std::collections::VecDeque;

use crate::device::GpuBuffer;

/// What to release once an entry matures
#[derive(Debug)]
pub enum ReclaimAction<M> {
    /// A device-local buffer replaced by a larger allocation
    DeviceBuffer(GpuBuffer<M>),
    /// A staging buffer whose copy was recorded into an in-flight command buffer
    StagingBuffer(GpuBuffer<M>),
}

impl<M> ReclaimAction<M> {
    /// The buffer this action releases
    pub fn buffer(&self) -> &GpuBuffer<M> {
        match self {
            Self::DeviceBuffer(buffer) | Self::StagingBuffer(buffer) => buffer,
        }
    }

    /// Take the buffer out of the action
    pub fn into_buffer(self) -> GpuBuffer<M> {
        match self {
            Self::DeviceBuffer(buffer) | Self::StagingBuffer(buffer) => buffer,
        }
    }
}

#[derive(Debug)]
struct ReclaimEntry<M> {
    action: ReclaimAction<M>,
    epoch: u64,
}

/// Queue of resources waiting for the device to retire the frames that use them
#[derive(Debug)]
pub struct DeferredReclaimQueue<M> {
    entries: VecDeque<ReclaimEntry<M>>,
    epoch: u64,
    frames_in_flight: u64,
}

impl<M> DeferredReclaimQueue<M> {
    /// Create a queue that holds entries for `frames_in_flight` frame boundaries
    pub fn new(frames_in_flight: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            epoch: 0,
            frames_in_flight: frames_in_flight.max(1),
        }
    }

    /// Park `action` until `frames_in_flight` frames after the current epoch
    pub fn delete_after_frames(&mut self, action: ReclaimAction<M>) {
        self.entries.push_back(ReclaimEntry {
            action,
            epoch: self.epoch,
        });
    }

    /// Frame-boundary hook: advance the epoch and run every matured entry
    ///
    /// Returns the number of entries released.
    pub fn advance_frame(&mut self, mut release: impl FnMut(ReclaimAction<M>)) -> usize {
        self.epoch += 1;

        let mut released = 0;
        // Epochs are pushed in non-decreasing order, so only the front can mature.
        while self
            .entries
            .front()
            .is_some_and(|entry| self.epoch - entry.epoch >= self.frames_in_flight)
        {
            if let Some(entry) = self.entries.pop_front() {
                release(entry.action);
                released += 1;
            }
        }
        released
    }

    /// Release everything immediately
    ///
    /// Only valid after a device-idle wait, at teardown.
    pub fn drain(&mut self, mut release: impl FnMut(ReclaimAction<M>)) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            release(entry.action);
        }
        count
    }

    /// Current frame epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of entries still waiting
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Frames an entry is held for
    pub fn frames_in_flight(&self) -> u64 {
        self.frames_in_flight
    }

    /// Update the holding period, e.g. after swapchain recreation
    pub fn set_frames_in_flight(&mut self, frames_in_flight: u64) {
        self.frames_in_flight = frames_in_flight.max(1);
    }
}
