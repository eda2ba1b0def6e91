//! Command buffer slots and their recording lifecycle

use ash::vk;

/// Lifecycle of a pooled command buffer within one frame
///
/// Only moves forward `Invalid → Recording → Ended → Submitted`; a pool-wide
/// reset is the only way back to `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Handed out (or not yet) but not recording
    Invalid,
    /// Between begin and end
    Recording,
    /// Recording finished, waiting for submission
    Ended,
    /// Included in a queue submission
    Submitted,
}

/// Opaque handle to a command buffer owned by a [`CommandPoolSet`](super::CommandPoolSet)
///
/// Carries the owning thread and slot index so lookups never search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    raw: vk::CommandBuffer,
    thread: u32,
    slot: u32,
}

impl CommandBufferHandle {
    pub(crate) fn new(raw: vk::CommandBuffer, thread: usize, slot: usize) -> Self {
        Self {
            raw,
            thread: u32::try_from(thread).unwrap_or(u32::MAX),
            slot: u32::try_from(slot).unwrap_or(u32::MAX),
        }
    }

    /// Native command buffer, for recording commands
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Index of the thread pool the buffer was drawn from
    pub fn thread(&self) -> usize {
        self.thread as usize
    }

    /// Position of the buffer within its thread pool
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

#[derive(Debug)]
pub(crate) struct CommandSlot {
    pub raw: vk::CommandBuffer,
    pub thread: usize,
    pub state: RecordState,
    /// Placed on the ordered list; skipped by the per-thread sweep
    pub queued: bool,
}

impl CommandSlot {
    pub fn new(raw: vk::CommandBuffer, thread: usize) -> Self {
        Self {
            raw,
            thread,
            state: RecordState::Invalid,
            queued: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = RecordState::Invalid;
        self.queued = false;
    }
}

/// Per-thread pool: one native pool and the slots drawn from it
#[derive(Debug)]
pub(crate) struct ThreadPool {
    pub pool: vk::CommandPool,
    pub slots: Vec<CommandSlot>,
    pub next_free: usize,
}

impl ThreadPool {
    pub fn new(pool: vk::CommandPool) -> Self {
        Self {
            pool,
            slots: Vec::new(),
            next_free: 0,
        }
    }

    /// Look up the slot a handle refers to, checking it belongs here
    pub fn slot_mut(&mut self, handle: CommandBufferHandle) -> Option<&mut CommandSlot> {
        self.slots
            .get_mut(handle.slot())
            .filter(|slot| slot.raw == handle.raw())
    }
}
