//! Command buffers and per-slot synchronisation for frames in flight.

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;
use log::*;

/// One command buffer, two semaphores and a fence per frame-in-flight slot, plus the fence last
/// submitted against each swapchain image.
#[derive(Debug, Default)]
pub struct FrameSync {
    pub command_pool: vk::CommandPool,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub image_available_semaphores: Vec<vk::Semaphore>,
    pub render_finished_semaphores: Vec<vk::Semaphore>,
    pub in_flight_fences: Vec<vk::Fence>,
    pub images_in_flight: Vec<vk::Fence>,
}

impl FrameSync {
    pub fn create(
        device: &ash::Device,
        graphics_family: u32,
        frames_in_flight: usize,
        swapchain_images: usize,
    ) -> Result<Self> {
        let mut sync = Self::default();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);
        // SAFETY: the device is live and `pool_info` is fully initialised.
        sync.command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(sync.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        // SAFETY: the pool was just created on this device.
        sync.command_buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..frames_in_flight {
            // SAFETY: the device is live and the infos are fully initialised.
            unsafe {
                sync.image_available_semaphores
                    .push(device.create_semaphore(&semaphore_info, None)?);
                sync.render_finished_semaphores
                    .push(device.create_semaphore(&semaphore_info, None)?);
                sync.in_flight_fences
                    .push(device.create_fence(&fence_info, None)?);
            }
        }
        sync.reset_images_in_flight(swapchain_images);
        debug!("Created sync objects for {frames_in_flight} frames in flight.");
        Ok(sync)
    }

    /// Forget image ownership after the swapchain is rebuilt; the new image count may differ.
    pub fn reset_images_in_flight(&mut self, swapchain_images: usize) {
        self.images_in_flight = vec![vk::Fence::null(); swapchain_images];
    }

    /// Safe on a partially created set. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device) {
        // SAFETY: the device is idle so no semaphore, fence or command buffer is in use.
        unsafe {
            for s in self.image_available_semaphores.drain(..) {
                if !s.is_null() {
                    device.destroy_semaphore(s, None);
                }
            }
            for s in self.render_finished_semaphores.drain(..) {
                if !s.is_null() {
                    device.destroy_semaphore(s, None);
                }
            }
            for f in self.in_flight_fences.drain(..) {
                if !f.is_null() {
                    device.destroy_fence(f, None);
                }
            }
            if !self.command_pool.is_null() {
                device.destroy_command_pool(self.command_pool, None);
                self.command_pool = vk::CommandPool::null();
            }
        }
        self.command_buffers.clear();
        self.images_in_flight.clear();
    }
}
