//! Headless frame loop exercising the streaming layer on a real device
//!
//! Usage: `stream_demo [config.toml|config.ron] [frames]`
//!
//! Every frame the worker threads record fills into their own command
//! buffers while the main thread streams a growing instance array through
//! one batched upload. Frame slots rotate over `frames_in_flight` command
//! pool sets, each guarded by its own fence.

mod headless;

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_stream::prelude::*;
use gpu_stream::{ConfigError, VulkanDevice};
use headless::HeadlessVulkan;
use thiserror::Error;

const DEFAULT_FRAMES: u64 = 240;
const INSTANCES_PER_FRAME: u64 = 48;

#[derive(Error, Debug)]
enum DemoError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid frame count: {0}")]
    FrameCount(String),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InstanceData {
    position: [f32; 4],
    velocity: [f32; 4],
}

impl InstanceData {
    fn at(index: u64, frame: u64) -> Self {
        let phase = (index as f32) * 0.37 + (frame as f32) * 0.016;
        Self {
            position: [phase.cos() * 10.0, phase.sin() * 10.0, 0.0, 1.0],
            velocity: [-phase.sin(), phase.cos(), 0.0, 0.0],
        }
    }
}

/// Command pools and fence for one frame slot
struct FrameSlot {
    pools: CommandPoolSet<VulkanDevice>,
    fence: vk::Fence,
    submitted: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("stream_demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            log::info!("Loading streaming config from {}", path);
            StreamingConfig::load_from_file(&path)?
        }
        None => StreamingConfig::default(),
    };
    let frames = match args.next() {
        Some(count) => count.parse::<u64>().map_err(|_| DemoError::FrameCount(count))?,
        None => DEFAULT_FRAMES,
    };

    let vulkan = HeadlessVulkan::new("stream_demo")?;
    let device = Arc::clone(vulkan.device());
    let queue = vulkan.queue();
    let context = GpuContext::new(Arc::clone(&device), config)?;

    let mut slots = Vec::new();
    for _ in 0..context.config().frames_in_flight {
        slots.push(FrameSlot {
            pools: CommandPoolSet::from_config(Arc::clone(&device), vulkan.queue_family(), context.config())?,
            fence: device.create_fence()?,
            submitted: false,
        });
    }
    let worker_count = slots[0].pools.thread_count();

    // Per-worker counters, uploaded once before the loop
    let upload_pool = device.create_command_pool(vulkan.queue_family())?;
    let mut counters: GrowableBuffer<u32, VulkanDevice> =
        GrowableBuffer::new(Arc::clone(&context), vk::BufferUsageFlags::STORAGE_BUFFER, "worker counters");
    counters.write_blocking(&vec![0; worker_count], 0, queue, upload_pool);

    let mut instances: GrowableBuffer<InstanceData, VulkanDevice> =
        GrowableBuffer::new(Arc::clone(&context), vk::BufferUsageFlags::STORAGE_BUFFER, "instances");

    for frame in 0..frames {
        let slot = &mut slots[(frame % context.config().frames_in_flight) as usize];

        if slot.submitted {
            device.wait_for_fence(slot.fence, context.config().fence_timeout_ns)?;
            device.reset_fence(slot.fence)?;
            slot.pools.reset_pools();
        }
        context.end_frame();

        let counter_buffer = counters.buffer();
        let pools = &slot.pools;
        let raw = device.raw();
        std::thread::scope(|scope| {
            for thread_id in 0..worker_count {
                scope.spawn(move || {
                    let cmd = pools.get_next_command_buffer(thread_id, true);
                    unsafe {
                        raw.cmd_fill_buffer(cmd.raw(), counter_buffer, thread_id as u64 * 4, 4, frame as u32);
                    }
                    pools.end_command_buffer(thread_id, cmd);
                });
            }
        });

        let upload = slot.pools.get_next_command_buffer(0, true);
        let first_new = instances.len();
        let count = first_new + INSTANCES_PER_FRAME;
        let moved: Vec<_> = (0..first_new.min(INSTANCES_PER_FRAME))
            .map(|i| InstanceData::at(i, frame))
            .collect();
        let spawned: Vec<_> = (first_new..count).map(|i| InstanceData::at(i, frame)).collect();
        instances.enqueue_write(&moved, 0);
        instances.enqueue_write(&spawned, first_new);
        instances.flush(upload.raw());
        slot.pools.end_command_buffer(0, upload);
        slot.pools.queue_command_buffer(upload);

        if instances.must_update() {
            log::debug!("Frame {}: instance buffer is now {:?}", frame, instances.buffer());
            instances.mark_updated();
        }

        let summary = slot.pools.submit_all(queue, &SubmitDependencies::default(), slot.fence);
        slot.submitted = true;
        log::trace!("Frame {} submitted {} command buffers", frame, summary.total());
    }

    device.device_wait_idle()?;
    let snapshot = context.telemetry().snapshot();
    log::info!(
        "Streamed {} instances over {} frames: {} growths, {} allocations, peak {} device bytes",
        instances.len(),
        frames,
        snapshot.growths,
        snapshot.allocations,
        snapshot.peak_device_bytes
    );

    drop(instances);
    drop(counters);
    for slot in slots {
        device.destroy_fence(slot.fence);
    }
    device.destroy_command_pool(upload_pool);
    let released = context.shutdown()?;
    log::info!("Released {} deferred buffers at shutdown", released);

    drop(context);
    drop(device);
    Ok(())
}
