// SPDX-License-Identifier: CEPL-1.0
//! The set of native Vulkan calls the frame pipeline makes.
//!
//! Everything above this module talks to the GPU through [`DeviceApi`], so the
//! pipeline can run against [`AshDevice`] in production and a recording mock
//! under test. Handles passed in must come from the same implementor.
use ash::khr::swapchain;
use ash::prelude::VkResult;
use ash::vk;

use crate::instance::InstanceContext;
use crate::swapchain::SwapchainSupportInfo;

pub trait DeviceApi {
    fn device_wait_idle(&self) -> VkResult<()>;

    // Surface / swapchain
    fn surface(&self) -> vk::SurfaceKHR;
    fn query_swapchain_support(&self) -> VkResult<SwapchainSupportInfo>;
    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR>;
    fn get_swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR<'_>) -> VkResult<bool>;

    // Images and memory
    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64) -> VkResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // Render targets
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Commands
    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo<'_>) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo<'_>);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);

    // Synchronization
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    // Queues
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
}

/// Production implementation over a live `ash::Device`.
///
/// Owns the logical device and, through [`InstanceContext`], the surface and
/// instance it was created from.
pub struct AshDevice {
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    physical: vk::PhysicalDevice,
    // Dropped after the device.
    ctx: InstanceContext,
}

impl AshDevice {
    /// # Safety
    /// `device` must have been created from `physical`, which must belong to
    /// `ctx.instance` and support presenting to `ctx.surface`.
    pub unsafe fn new(ctx: InstanceContext, physical: vk::PhysicalDevice, device: ash::Device) -> Self {
        let swapchain_loader = swapchain::Device::new(&ctx.instance, &device);
        Self {
            device,
            swapchain_loader,
            physical,
            ctx,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
        tracing::debug!("vk: logical device destroyed");
    }
}

impl DeviceApi for AshDevice {
    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn surface(&self) -> vk::SurfaceKHR {
        self.ctx.surface
    }

    fn query_swapchain_support(&self) -> VkResult<SwapchainSupportInfo> {
        unsafe { SwapchainSupportInfo::query(&self.ctx.surface_loader, self.physical, self.ctx.surface) }
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
        unsafe { self.swapchain_loader.create_swapchain(info, None) }
    }

    fn get_swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, fence)
        }
    }

    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR<'_>) -> VkResult<bool> {
        unsafe { self.swapchain_loader.queue_present(queue, info) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        unsafe { self.device.allocate_memory(info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo<'_>) -> VkResult<vk::CommandPool> {
        unsafe { self.device.create_command_pool(info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        unsafe { self.device.allocate_command_buffers(info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        unsafe { self.device.begin_command_buffer(cmd, info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo<'_>) {
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) }
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let ci = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&ci, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags,
            ..Default::default()
        };
        unsafe { self.device.create_fence(&ci, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { self.device.queue_submit(queue, submits, fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }
}
