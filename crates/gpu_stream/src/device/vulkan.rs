//! `ash` implementation of the device boundary
//!
//! Buffers get a dedicated `vkAllocateMemory` allocation each, with the memory
//! type picked from the physical device's memory properties. Debug names are
//! attached through `VK_EXT_debug_utils` when the extension loader is supplied.

use std::ffi::CString;

use ash::extensions::ext::DebugUtils;
use ash::vk::{self, Handle};
use ash::{Device, Instance};

use super::{GpuBuffer, GpuDevice, MemoryLocation, SubmitBatch};
use crate::error::{GpuError, GpuResult};

/// Logical device wrapper implementing [`GpuDevice`]
pub struct VulkanDevice {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils: Option<DebugUtils>,
}

impl VulkanDevice {
    /// Wrap an existing logical device
    pub fn new(instance: &Instance, physical_device: vk::PhysicalDevice, device: Device) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            device,
            memory_properties,
            debug_utils: None,
        }
    }

    /// Name buffers through `VK_EXT_debug_utils`
    pub fn with_debug_utils(mut self, debug_utils: DebugUtils) -> Self {
        self.debug_utils = Some(debug_utils);
        self
    }

    /// Get the raw `ash` device
    pub fn raw(&self) -> &Device {
        &self.device
    }

    fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> GpuResult<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count)
            .find(|&i| {
                (type_filter & (1 << i)) != 0
                    && props.memory_types[i as usize].property_flags.contains(properties)
            })
            .ok_or(GpuError::NoSuitableMemoryType)
    }

    fn set_buffer_name(&self, buffer: vk::Buffer, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            log::warn!("Buffer name {:?} contains an interior nul, skipping debug name", name);
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(vk::ObjectType::BUFFER)
            .object_handle(buffer.as_raw())
            .object_name(&name);

        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) } {
            log::warn!("Failed to set debug name on buffer: {:?}", e);
        }
    }
}

impl GpuDevice for VulkanDevice {
    type Memory = vk::DeviceMemory;

    fn create_command_pool(&self, queue_family_index: u32) -> GpuResult<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        unsafe { self.device.create_command_pool(&pool_create_info, None) }
            .map_err(|e| GpuError::from_vk(e, 0))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
                .map_err(GpuError::Api)
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe {
            self.device.destroy_command_pool(pool, None);
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| GpuError::from_vk(e, 0))?;

        buffers.first().copied().ok_or_else(|| GpuError::InvalidOperation {
            reason: "driver returned no command buffers".to_string(),
        })
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(pool, &[command_buffer]);
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, one_time_submit: bool) -> GpuResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(GpuError::Api)
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer).map_err(GpuError::Api) }
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .command_buffers(batch.command_buffers)
            .signal_semaphores(batch.signal_semaphores);

        unsafe {
            self.device
                .queue_submit(queue, &[submit_info.build()], fence)
                .map_err(GpuError::Api)
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> GpuResult<()> {
        unsafe { self.device.queue_wait_idle(queue).map_err(GpuError::Api) }
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle().map_err(GpuError::Api) }
    }

    fn create_fence(&self) -> GpuResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo::builder();
        unsafe { self.device.create_fence(&create_info, None).map_err(GpuError::Api) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout { timeout_ns }),
            Err(e) => Err(GpuError::Api(e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]).map_err(GpuError::Api) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<GpuBuffer<Self::Memory>> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| GpuError::from_vk(e, size))?;

        let mem_requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let properties = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };

        let memory = self
            .find_memory_type(mem_requirements.memory_type_bits, properties)
            .and_then(|memory_type_index| {
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(mem_requirements.size)
                    .memory_type_index(memory_type_index);
                unsafe { self.device.allocate_memory(&alloc_info, None) }
                    .map_err(|e| GpuError::from_vk(e, mem_requirements.size))
            });

        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(GpuError::Api(e));
        }

        self.set_buffer_name(buffer, name);

        Ok(GpuBuffer {
            buffer,
            memory,
            size,
            location,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer<Self::Memory>) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    fn write_buffer(&self, buffer: &GpuBuffer<Self::Memory>, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if buffer.location != MemoryLocation::HostVisible {
            return Err(GpuError::InvalidOperation {
                reason: "cannot map a device-local buffer".to_string(),
            });
        }

        let len = data.len() as vk::DeviceSize;
        unsafe {
            let mapped = self
                .device
                .map_memory(buffer.memory, offset, len, vk::MemoryMapFlags::empty())
                .map_err(GpuError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            self.device.unmap_memory(buffer.memory);
        }
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer(command_buffer, src, dst, regions);
        }
    }

    fn cmd_transfer_barrier(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::TRANSFER_READ
                    | vk::AccessFlags::TRANSFER_WRITE
                    | vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier.build()],
                &[],
            );
        }
    }
}
