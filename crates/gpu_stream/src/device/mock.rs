//! In-memory device used by the unit tests
//!
//! Buffers are byte vectors. Recorded copies run when the device is waited on,
//! in submission order, so destroying a buffer that a submitted copy still
//! references panics exactly where a real device would read freed memory.

use std::collections::{HashMap, VecDeque};

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{GpuBuffer, GpuDevice, MemoryLocation, SubmitBatch};
use crate::error::{GpuError, GpuResult};

#[derive(Debug, Clone)]
pub(crate) enum MockCommand {
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    Barrier {
        buffer: vk::Buffer,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockCmdState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
pub(crate) struct MockCommandBuffer {
    pub pool: vk::CommandPool,
    pub state: MockCmdState,
    pub commands: Vec<MockCommand>,
}

#[derive(Debug)]
pub(crate) struct MockBuffer {
    pub bytes: Vec<u8>,
    pub location: MemoryLocation,
    pub usage: vk::BufferUsageFlags,
    pub name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct MockSubmission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    next_handle: u64,
    pub pools: HashMap<vk::CommandPool, u32>,
    pub pool_resets: usize,
    pub destroyed_pools: Vec<vk::CommandPool>,
    pub command_buffers: HashMap<vk::CommandBuffer, MockCommandBuffer>,
    pub command_buffers_allocated: usize,
    pub freed_command_buffers: Vec<vk::CommandBuffer>,
    pub buffers: HashMap<vk::Buffer, MockBuffer>,
    pub buffers_created: Vec<(vk::Buffer, vk::DeviceSize, MemoryLocation)>,
    pub buffers_destroyed: Vec<vk::Buffer>,
    pub submissions: Vec<MockSubmission>,
    pending: VecDeque<(Vec<MockCommand>, vk::Fence)>,
    pub fences: HashMap<vk::Fence, bool>,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn execute_pending(&mut self) {
        while let Some((commands, fence)) = self.pending.pop_front() {
            for command in commands {
                if let MockCommand::Copy { src, dst, regions } = command {
                    for region in regions {
                        let src_offset = region.src_offset as usize;
                        let dst_offset = region.dst_offset as usize;
                        let size = region.size as usize;
                        let bytes = self
                            .buffers
                            .get(&src)
                            .unwrap_or_else(|| panic!("copy reads destroyed buffer {:?}", src))
                            .bytes[src_offset..src_offset + size]
                            .to_vec();
                        let target = self
                            .buffers
                            .get_mut(&dst)
                            .unwrap_or_else(|| panic!("copy writes destroyed buffer {:?}", dst));
                        target.bytes[dst_offset..dst_offset + size].copy_from_slice(&bytes);
                    }
                }
            }
            if fence != vk::Fence::null() {
                self.fences.insert(fence, true);
            }
        }
    }
}

/// Recording device with simulated buffer memory
#[derive(Debug, Default)]
pub(crate) struct MockDevice {
    pub state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every submitted command, as if the device finished all frames
    pub fn complete_all(&self) {
        self.state.lock().execute_pending();
    }

    pub fn buffer_bytes(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.bytes.clone())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<MockCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|c| c.commands.clone())
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Allocate and begin a standalone command buffer outside any pool set
    pub fn begin_scratch_command_buffer(&self) -> vk::CommandBuffer {
        let pool = self.create_command_pool(0).unwrap();
        let cmd = self.allocate_command_buffer(pool).unwrap();
        self.begin_command_buffer(cmd, true).unwrap();
        cmd
    }

    /// End and submit a scratch command buffer, then run it to completion
    pub fn submit_scratch(&self, cmd: vk::CommandBuffer) {
        self.end_command_buffer(cmd).unwrap();
        let batch = SubmitBatch {
            command_buffers: &[cmd],
            ..SubmitBatch::default()
        };
        self.queue_submit(vk::Queue::null(), &batch, vk::Fence::null()).unwrap();
        self.complete_all();
    }
}

impl GpuDevice for MockDevice {
    type Memory = ();

    fn create_command_pool(&self, queue_family_index: u32) -> GpuResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.next());
        state.pools.insert(pool, queue_family_index);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()> {
        let mut state = self.state.lock();
        assert!(state.pools.contains_key(&pool), "reset of unknown pool");
        state.pool_resets += 1;
        for cmd in state.command_buffers.values_mut().filter(|c| c.pool == pool) {
            cmd.state = MockCmdState::Initial;
            cmd.commands.clear();
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool);
        state.command_buffers.retain(|_, c| c.pool != pool);
        state.destroyed_pools.push(pool);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        assert!(state.pools.contains_key(&pool), "allocation from unknown pool");
        let cmd = vk::CommandBuffer::from_raw(state.next());
        state.command_buffers.insert(
            cmd,
            MockCommandBuffer {
                pool,
                state: MockCmdState::Initial,
                commands: Vec::new(),
            },
        );
        state.command_buffers_allocated += 1;
        Ok(cmd)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        state.command_buffers.remove(&command_buffer);
        state.freed_command_buffers.push(command_buffer);
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, _one_time_submit: bool) -> GpuResult<()> {
        let mut state = self.state.lock();
        let cmd = state.command_buffers.get_mut(&command_buffer).expect("unknown command buffer");
        assert_eq!(cmd.state, MockCmdState::Initial, "begin on a command buffer that was not reset");
        cmd.state = MockCmdState::Recording;
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        let mut state = self.state.lock();
        let cmd = state.command_buffers.get_mut(&command_buffer).expect("unknown command buffer");
        assert_eq!(cmd.state, MockCmdState::Recording, "end on a command buffer that is not recording");
        cmd.state = MockCmdState::Executable;
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()> {
        let mut state = self.state.lock();
        let mut commands = Vec::new();
        for raw in batch.command_buffers {
            let cmd = state.command_buffers.get(raw).expect("submit of unknown command buffer");
            assert_eq!(cmd.state, MockCmdState::Executable, "submit of a command buffer that was not ended");
            commands.extend(cmd.commands.iter().cloned());
        }
        state.pending.push_back((commands, fence));
        state.submissions.push(MockSubmission {
            queue,
            command_buffers: batch.command_buffers.to_vec(),
            wait_semaphores: batch.wait_semaphores.to_vec(),
            signal_semaphores: batch.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> GpuResult<()> {
        self.complete_all();
        Ok(())
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        self.complete_all();
        Ok(())
    }

    fn create_fence(&self) -> GpuResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.next());
        state.fences.insert(fence, false);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        let mut state = self.state.lock();
        state.execute_pending();
        if state.fences.get(&fence).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(GpuError::Timeout { timeout_ns })
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        self.state.lock().fences.insert(fence, false);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<GpuBuffer<Self::Memory>> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.next());
        state.buffers.insert(
            buffer,
            MockBuffer {
                bytes: vec![0; size as usize],
                location,
                usage,
                name: name.to_string(),
            },
        );
        state.buffers_created.push((buffer, size, location));
        Ok(GpuBuffer {
            buffer,
            memory: (),
            size,
            location,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer<Self::Memory>) {
        let mut state = self.state.lock();
        assert!(state.buffers.remove(&buffer.buffer).is_some(), "double destroy of {:?}", buffer.buffer);
        state.buffers_destroyed.push(buffer.buffer);
    }

    fn write_buffer(&self, buffer: &GpuBuffer<Self::Memory>, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        let mut state = self.state.lock();
        let target = state.buffers.get_mut(&buffer.buffer).expect("write to destroyed buffer");
        assert_eq!(target.location, MemoryLocation::HostVisible, "mapped write to device-local buffer");
        let offset = offset as usize;
        target.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        let cmd = state.command_buffers.get_mut(&command_buffer).expect("unknown command buffer");
        assert_eq!(cmd.state, MockCmdState::Recording, "copy recorded outside of recording");
        cmd.commands.push(MockCommand::Copy {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn cmd_transfer_barrier(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        let cmd = state.command_buffers.get_mut(&command_buffer).expect("unknown command buffer");
        assert_eq!(cmd.state, MockCmdState::Recording, "barrier recorded outside of recording");
        cmd.commands.push(MockCommand::Barrier { buffer });
    }
}
