//! Running GPU memory counters
//!
//! Updated by every buffer allocation and release that goes through a
//! [`GpuContext`](crate::GpuContext). Counters are relaxed atomics; they are
//! for reporting, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::MemoryLocation;

/// Memory usage counters owned by a [`GpuContext`](crate::GpuContext)
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    device_bytes: AtomicU64,
    staging_bytes: AtomicU64,
    peak_device_bytes: AtomicU64,
    allocations: AtomicU64,
    growths: AtomicU64,
}

/// Point-in-time copy of [`MemoryTelemetry`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Live device-local bytes, including buffers awaiting reclamation
    pub device_bytes: u64,
    /// Live staging bytes, including buffers awaiting reclamation
    pub staging_bytes: u64,
    /// Highest value `device_bytes` has reached
    pub peak_device_bytes: u64,
    /// Total buffer allocations
    pub allocations: u64,
    /// Growable-buffer reallocations
    pub growths: u64,
}

impl MemoryTelemetry {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, location: MemoryLocation) -> &AtomicU64 {
        match location {
            MemoryLocation::DeviceLocal => &self.device_bytes,
            MemoryLocation::HostVisible => &self.staging_bytes,
        }
    }

    /// Record a new buffer of `size` bytes
    pub fn record_allocation(&self, location: MemoryLocation, size: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let total = self.counter(location).fetch_add(size, Ordering::Relaxed) + size;
        if location == MemoryLocation::DeviceLocal {
            self.peak_device_bytes.fetch_max(total, Ordering::Relaxed);
        }
    }

    /// Record a destroyed buffer of `size` bytes
    pub fn record_release(&self, location: MemoryLocation, size: u64) {
        let counter = self.counter(location);
        let previous = counter.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(previous >= size, "released more {location:?} memory than was allocated");
    }

    /// Record a growable buffer reallocation
    pub fn record_growth(&self) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            device_bytes: self.device_bytes.load(Ordering::Relaxed),
            staging_bytes: self.staging_bytes.load(Ordering::Relaxed),
            peak_device_bytes: self.peak_device_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
        }
    }
}
