//! Per-thread command pools and frame submission
//!
//! A native command pool must never be used from two threads at once, so every
//! worker thread gets its own pool. Buffers drawn from a pool are recycled by
//! a pool-wide reset once the frame that used them has retired.
//!
//! Per-thread recording is unordered. Passes whose relative order encodes a
//! dependency that semaphores and barriers cannot express are placed on the
//! ordered list, which is always submitted after all per-thread work.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::slot::{CommandBufferHandle, CommandSlot, RecordState, ThreadPool};
use crate::config::StreamingConfig;
use crate::device::{GpuDevice, SubmitBatch};
use crate::error::{GpuError, GpuResult};
use crate::fatal::{programmer_error, OrAbort};

/// Semaphore wiring for a frame submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDependencies<'a> {
    /// Semaphores waited on before the batch executes
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Pipeline stage for each wait semaphore
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled when the batch completes
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// What [`CommandPoolSet::submit_all`] put into the batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    /// Buffers collected from the per-thread pools
    pub per_thread: usize,
    /// Buffers taken from the ordered list
    pub ordered: usize,
}

impl SubmitSummary {
    /// Total command buffers submitted
    pub fn total(&self) -> usize {
        self.per_thread + self.ordered
    }
}

/// Command buffer allocator shared by all recording threads
///
/// Recording calls take `&self` and may run concurrently from different
/// threads, each using its own `thread_id`. Submission, reset and destruction
/// take `&mut self`, so the frame loop must have joined its workers first.
pub struct CommandPoolSet<D: GpuDevice> {
    device: Arc<D>,
    pools: Vec<Mutex<ThreadPool>>,
    ordered: Mutex<Vec<CommandBufferHandle>>,
}

impl<D: GpuDevice> CommandPoolSet<D> {
    /// Create one pool per hardware thread
    pub fn init_pool(device: Arc<D>, queue_family_index: u32) -> GpuResult<Self> {
        Self::with_thread_count(device, queue_family_index, num_cpus::get())
    }

    /// Create one pool per configured worker thread
    pub fn from_config(device: Arc<D>, queue_family_index: u32, config: &StreamingConfig) -> GpuResult<Self> {
        Self::with_thread_count(device, queue_family_index, config.resolved_worker_threads())
    }

    /// Create `thread_count` pools on `queue_family_index`
    pub fn with_thread_count(device: Arc<D>, queue_family_index: u32, thread_count: usize) -> GpuResult<Self> {
        if thread_count == 0 {
            return Err(GpuError::InitializationFailed(
                "command pool set needs at least one thread".to_string(),
            ));
        }

        let mut pools = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            match device.create_command_pool(queue_family_index) {
                Ok(pool) => pools.push(Mutex::new(ThreadPool::new(pool))),
                Err(e) => {
                    for pool in pools {
                        device.destroy_command_pool(pool.into_inner().pool);
                    }
                    return Err(e);
                }
            }
        }

        log::info!(
            "Created {} command pools on queue family {}",
            thread_count,
            queue_family_index
        );

        Ok(Self {
            device,
            pools,
            ordered: Mutex::new(Vec::new()),
        })
    }

    /// Number of per-thread pools
    pub fn thread_count(&self) -> usize {
        self.pools.len()
    }

    /// Out-of-range thread ids panic in every build; there is no pool to fall back to.
    fn thread_pool(&self, thread_id: usize) -> &Mutex<ThreadPool> {
        assert!(
            thread_id < self.pools.len(),
            "thread id {} out of range for {} command pools",
            thread_id,
            self.pools.len()
        );
        &self.pools[thread_id]
    }

    /// Hand out the next command buffer of `thread_id`'s pool
    ///
    /// Allocates a new native buffer when every pre-allocated one is in use
    /// this frame. With `begin`, recording is started and the slot moves to
    /// [`RecordState::Recording`].
    ///
    /// # Panics
    ///
    /// If `thread_id` is not below [`thread_count`](Self::thread_count), in
    /// release builds too.
    pub fn get_next_command_buffer(&self, thread_id: usize, begin: bool) -> CommandBufferHandle {
        let mut pool = self.thread_pool(thread_id).lock();

        if pool.next_free == pool.slots.len() {
            let raw = self
                .device
                .allocate_command_buffer(pool.pool)
                .or_abort("allocating command buffer");
            pool.slots.push(CommandSlot::new(raw, thread_id));
            log::debug!("Thread {} pool grew to {} command buffers", thread_id, pool.slots.len());
        }

        let index = pool.next_free;
        pool.next_free += 1;

        let slot = &mut pool.slots[index];
        if begin {
            self.device
                .begin_command_buffer(slot.raw, true)
                .or_abort("beginning command buffer");
            slot.state = RecordState::Recording;
        }
        CommandBufferHandle::new(slot.raw, thread_id, index)
    }

    /// Start recording on a buffer obtained without `begin`
    pub fn begin_command_buffer(&self, handle: CommandBufferHandle) {
        let mut pool = self.thread_pool(handle.thread()).lock();
        let Some(slot) = pool.slot_mut(handle) else {
            programmer_error("begin of a command buffer this pool set does not own");
            return;
        };
        if slot.state != RecordState::Invalid {
            programmer_error("begin of a command buffer that was already recorded this frame");
            return;
        }
        self.device
            .begin_command_buffer(slot.raw, true)
            .or_abort("beginning command buffer");
        slot.state = RecordState::Recording;
    }

    /// Finish recording a buffer
    pub fn end_command_buffer(&self, thread_id: usize, handle: CommandBufferHandle) {
        if handle.thread() != thread_id {
            programmer_error("command buffer ended with a thread id that does not own it");
            return;
        }

        let mut pool = self.thread_pool(thread_id).lock();
        let Some(slot) = pool.slot_mut(handle) else {
            programmer_error("end of a command buffer this pool set does not own");
            return;
        };
        if slot.state != RecordState::Recording {
            programmer_error("end of a command buffer that is not recording");
            return;
        }

        self.device
            .end_command_buffer(slot.raw)
            .or_abort("ending command buffer");
        slot.state = RecordState::Ended;
    }

    /// End `handle` if still recording and mark it for the ordered list
    fn mark_queued(&self, handle: CommandBufferHandle) -> bool {
        let mut pool = self.thread_pool(handle.thread()).lock();
        let Some(slot) = pool.slot_mut(handle) else {
            programmer_error("queue of a command buffer this pool set does not own");
            return false;
        };
        if slot.queued {
            programmer_error("command buffer queued twice in one frame");
            return false;
        }

        match slot.state {
            RecordState::Recording => {
                self.device
                    .end_command_buffer(slot.raw)
                    .or_abort("ending command buffer");
                slot.state = RecordState::Ended;
            }
            RecordState::Ended => {}
            RecordState::Invalid | RecordState::Submitted => {
                programmer_error("queue of a command buffer that was never recorded or already submitted");
                return false;
            }
        }
        slot.queued = true;
        true
    }

    /// Append a buffer to the ordered list, ending it if still recording
    pub fn queue_command_buffer(&self, handle: CommandBufferHandle) {
        if self.mark_queued(handle) {
            self.ordered.lock().push(handle);
        }
    }

    /// Append several buffers to the ordered list, keeping them contiguous
    pub fn queue_command_buffers(&self, handles: &[CommandBufferHandle]) {
        let accepted: Vec<_> = handles.iter().copied().filter(|h| self.mark_queued(*h)).collect();
        self.ordered.lock().extend(accepted);
    }

    /// Current lifecycle state of `handle`
    pub fn slot_state(&self, handle: CommandBufferHandle) -> Option<RecordState> {
        let mut pool = self.pools.get(handle.thread())?.lock();
        pool.slot_mut(handle).map(|slot| slot.state)
    }

    /// Number of buffers waiting on the ordered list
    pub fn ordered_len(&self) -> usize {
        self.ordered.lock().len()
    }

    /// Submit every finished buffer of the frame in one queue submission
    ///
    /// The batch holds all ended per-thread buffers in thread and slot order,
    /// followed by the ordered list in its own order. Buffers still recording
    /// are ended first.
    pub fn submit_all(&mut self, queue: vk::Queue, dependencies: &SubmitDependencies<'_>, signal_fence: vk::Fence) -> SubmitSummary {
        debug_assert_eq!(
            dependencies.wait_semaphores.len(),
            dependencies.wait_stages.len(),
            "every wait semaphore needs a wait stage"
        );

        let mut batch = Vec::new();
        for pool in &mut self.pools {
            let pool = pool.get_mut();
            let handed_out = pool.next_free;
            for slot in &mut pool.slots[..handed_out] {
                if slot.state == RecordState::Recording {
                    self.device
                        .end_command_buffer(slot.raw)
                        .or_abort("ending command buffer");
                    slot.state = RecordState::Ended;
                }
                if slot.state == RecordState::Ended && !slot.queued {
                    batch.push(slot.raw);
                    slot.state = RecordState::Submitted;
                }
            }
        }
        let per_thread = batch.len();

        let ordered = std::mem::take(self.ordered.get_mut());
        for handle in &ordered {
            match self.pools[handle.thread()].get_mut().slot_mut(*handle) {
                Some(slot) if slot.state == RecordState::Ended => {
                    debug_assert_eq!(slot.thread, handle.thread());
                    batch.push(slot.raw);
                    slot.state = RecordState::Submitted;
                }
                _ => programmer_error("ordered command buffer is no longer submittable"),
            }
        }

        let summary = SubmitSummary {
            per_thread,
            ordered: batch.len() - per_thread,
        };

        let submit = SubmitBatch {
            command_buffers: &batch,
            wait_semaphores: dependencies.wait_semaphores,
            wait_stages: dependencies.wait_stages,
            signal_semaphores: dependencies.signal_semaphores,
        };
        self.device
            .queue_submit(queue, &submit, signal_fence)
            .or_abort("submitting frame command buffers");

        log::trace!(
            "Submitted {} command buffers ({} per-thread, {} ordered)",
            summary.total(),
            summary.per_thread,
            summary.ordered
        );
        summary
    }

    /// Submit a single buffer on its own, outside the frame batch
    pub fn submit_command_buffer(&mut self, queue: vk::Queue, handle: CommandBufferHandle) {
        let Some(pool) = self.pools.get_mut(handle.thread()) else {
            programmer_error("submit of a command buffer this pool set does not own");
            return;
        };
        let Some(slot) = pool.get_mut().slot_mut(handle) else {
            programmer_error("submit of a command buffer this pool set does not own");
            return;
        };

        if slot.state == RecordState::Recording {
            self.device
                .end_command_buffer(slot.raw)
                .or_abort("ending command buffer");
            slot.state = RecordState::Ended;
        }
        if slot.state != RecordState::Ended {
            programmer_error("submit of a command buffer that is not ready");
            return;
        }
        slot.state = RecordState::Submitted;
        if slot.queued {
            self.ordered.get_mut().retain(|queued| *queued != handle);
        }

        let raw = [slot.raw];
        let submit = SubmitBatch {
            command_buffers: &raw,
            ..SubmitBatch::default()
        };
        self.device
            .queue_submit(queue, &submit, vk::Fence::null())
            .or_abort("submitting command buffer");
    }

    /// Submit a single buffer and block until the queue is idle
    pub fn submit_command_buffer_and_wait(&mut self, queue: vk::Queue, handle: CommandBufferHandle) {
        self.submit_command_buffer(queue, handle);
        self.device
            .queue_wait_idle(queue)
            .or_abort("waiting for queue idle");
    }

    /// Recycle every buffer of every pool for the next frame
    ///
    /// The device must have retired all work submitted from these pools.
    pub fn reset_pools(&mut self) {
        for pool in &mut self.pools {
            let pool = pool.get_mut();
            self.device
                .reset_command_pool(pool.pool)
                .or_abort("resetting command pool");
            for slot in &mut pool.slots {
                slot.reset();
            }
            pool.next_free = 0;
        }
        self.ordered.get_mut().clear();
    }

    /// Destroy every native pool; the device must be idle
    pub fn destroy_pools(&mut self) {
        for pool in self.pools.drain(..) {
            self.device.destroy_command_pool(pool.into_inner().pool);
        }
        self.ordered.get_mut().clear();
    }
}

impl<D: GpuDevice> Drop for CommandPoolSet<D> {
    fn drop(&mut self) {
        if self.pools.is_empty() {
            return;
        }
        // Wait for device to be idle to ensure all command buffers are finished
        if let Err(e) = self.device.device_wait_idle() {
            log::error!("Device wait failed while dropping command pools: {}", e);
        }
        self.destroy_pools();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use ash::vk::Handle;
    use std::collections::HashSet;

    fn pool_set(threads: usize) -> (Arc<MockDevice>, CommandPoolSet<MockDevice>) {
        let device = Arc::new(MockDevice::new());
        let pools = CommandPoolSet::with_thread_count(device.clone(), 0, threads).unwrap();
        (device, pools)
    }

    #[test]
    fn test_one_native_pool_per_thread() {
        let (device, pools) = pool_set(4);
        assert_eq!(pools.thread_count(), 4);
        assert_eq!(device.state.lock().pools.len(), 4);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let device = Arc::new(MockDevice::new());
        assert!(CommandPoolSet::with_thread_count(device, 0, 0).is_err());
    }

    #[test]
    fn test_handles_not_reused_before_reset() {
        let (device, mut pools) = pool_set(1);

        let mut seen = HashSet::new();
        for i in 0..8 {
            let handle = pools.get_next_command_buffer(0, i % 2 == 0);
            assert!(seen.insert(handle.raw()), "handle reused within a frame");
            if i % 2 == 0 {
                pools.end_command_buffer(0, handle);
            }
        }
        assert_eq!(device.state.lock().command_buffers_allocated, 8);

        pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        pools.reset_pools();

        // Next frame recycles the same native buffers without allocating
        let recycled = pools.get_next_command_buffer(0, true);
        assert!(seen.contains(&recycled.raw()));
        assert_eq!(device.state.lock().command_buffers_allocated, 8);
    }

    #[test]
    fn test_state_machine() {
        let (_device, mut pools) = pool_set(1);

        let handle = pools.get_next_command_buffer(0, false);
        assert_eq!(pools.slot_state(handle), Some(RecordState::Invalid));
        pools.begin_command_buffer(handle);
        assert_eq!(pools.slot_state(handle), Some(RecordState::Recording));
        pools.end_command_buffer(0, handle);
        assert_eq!(pools.slot_state(handle), Some(RecordState::Ended));
        pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(pools.slot_state(handle), Some(RecordState::Submitted));
        pools.reset_pools();
        assert_eq!(pools.slot_state(handle), Some(RecordState::Invalid));
    }

    #[test]
    #[should_panic(expected = "not recording")]
    fn test_end_twice_is_programmer_error() {
        let (_device, pools) = pool_set(1);
        let handle = pools.get_next_command_buffer(0, true);
        pools.end_command_buffer(0, handle);
        pools.end_command_buffer(0, handle);
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn test_end_from_wrong_thread_is_programmer_error() {
        let (_device, pools) = pool_set(2);
        let handle = pools.get_next_command_buffer(1, true);
        pools.end_command_buffer(0, handle);
    }

    #[test]
    fn test_submit_all_ends_recording_buffers() {
        let (device, mut pools) = pool_set(2);
        let a = pools.get_next_command_buffer(0, true);
        let b = pools.get_next_command_buffer(1, true);
        // Handed out but never begun: not part of the batch
        let idle = pools.get_next_command_buffer(1, false);

        let summary = pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(summary, SubmitSummary { per_thread: 2, ordered: 0 });

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].command_buffers, vec![a.raw(), b.raw()]);
        assert_eq!(pools.slot_state(idle), Some(RecordState::Invalid));
    }

    #[test]
    fn test_ordered_list_goes_last_in_its_own_order() {
        let (device, mut pools) = pool_set(3);

        let late = pools.get_next_command_buffer(2, true);
        let unordered_a = pools.get_next_command_buffer(0, true);
        let early = pools.get_next_command_buffer(0, true);
        let unordered_b = pools.get_next_command_buffer(1, true);
        pools.end_command_buffer(1, unordered_b);

        pools.queue_command_buffer(early);
        pools.queue_command_buffer(late);
        assert_eq!(pools.ordered_len(), 2);
        assert_eq!(pools.slot_state(early), Some(RecordState::Ended));

        let summary = pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(summary, SubmitSummary { per_thread: 2, ordered: 2 });

        let submitted = &device.submissions()[0].command_buffers;
        assert_eq!(submitted, &vec![unordered_a.raw(), unordered_b.raw(), early.raw(), late.raw()]);
        assert_eq!(pools.ordered_len(), 0);
    }

    #[test]
    fn test_queue_command_buffers_keeps_group_contiguous() {
        let (device, mut pools) = pool_set(2);
        let first = pools.get_next_command_buffer(1, true);
        let second = pools.get_next_command_buffer(0, true);
        pools.queue_command_buffers(&[first, second]);

        pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(device.submissions()[0].command_buffers, vec![first.raw(), second.raw()]);
    }

    #[test]
    fn test_submit_passes_semaphores_and_fence() {
        let (device, mut pools) = pool_set(1);
        pools.get_next_command_buffer(0, true);

        let wait = [vk::Semaphore::from_raw(900)];
        let signal = [vk::Semaphore::from_raw(901)];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let fence = device.create_fence().unwrap();
        let dependencies = SubmitDependencies {
            wait_semaphores: &wait,
            wait_stages: &stages,
            signal_semaphores: &signal,
        };
        pools.submit_all(vk::Queue::null(), &dependencies, fence);

        let submission = &device.submissions()[0];
        assert_eq!(submission.wait_semaphores, wait.to_vec());
        assert_eq!(submission.signal_semaphores, signal.to_vec());
        assert_eq!(submission.fence, fence);
        assert!(device.wait_for_fence(fence, 1).is_ok());
    }

    #[test]
    fn test_submit_single_removes_from_ordered_list() {
        let (device, mut pools) = pool_set(1);
        let upload = pools.get_next_command_buffer(0, true);
        pools.queue_command_buffer(upload);
        pools.submit_command_buffer_and_wait(vk::Queue::null(), upload);

        assert_eq!(pools.slot_state(upload), Some(RecordState::Submitted));
        assert_eq!(pools.ordered_len(), 0);

        let summary = pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(summary.total(), 0);
        assert_eq!(device.submissions().len(), 2);
    }

    #[test]
    fn test_parallel_recording_from_worker_threads() {
        let (device, mut pools) = pool_set(4);

        std::thread::scope(|scope| {
            for thread_id in 0..pools.thread_count() {
                let pools = &pools;
                scope.spawn(move || {
                    for _ in 0..5 {
                        let handle = pools.get_next_command_buffer(thread_id, true);
                        assert_eq!(handle.thread(), thread_id);
                        pools.end_command_buffer(thread_id, handle);
                    }
                    let ordered = pools.get_next_command_buffer(thread_id, true);
                    pools.queue_command_buffer(ordered);
                });
            }
        });

        let summary = pools.submit_all(vk::Queue::null(), &SubmitDependencies::default(), vk::Fence::null());
        assert_eq!(summary, SubmitSummary { per_thread: 20, ordered: 4 });

        let submitted = device.submissions()[0].command_buffers.clone();
        let unique: HashSet<_> = submitted.iter().collect();
        assert_eq!(unique.len(), 24);

        pools.reset_pools();
        assert_eq!(device.state.lock().pool_resets, 4);
    }

    #[test]
    fn test_drop_destroys_pools() {
        let (device, pools) = pool_set(3);
        drop(pools);
        let state = device.state.lock();
        assert!(state.pools.is_empty());
        assert_eq!(state.destroyed_pools.len(), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_thread_id_out_of_range_panics() {
        let (_device, pools) = pool_set(2);
        pools.get_next_command_buffer(2, true);
    }

    #[test]
    fn test_init_pool_matches_hardware_concurrency() {
        let device = Arc::new(MockDevice::new());
        let pools = CommandPoolSet::init_pool(device.clone(), 0).unwrap();

        assert_eq!(pools.thread_count(), num_cpus::get());
        assert_eq!(device.state.lock().pools.len(), num_cpus::get());

        let last = pools.thread_count() - 1;
        let handle = pools.get_next_command_buffer(last, true);
        assert_eq!(handle.thread(), last);
    }
}
