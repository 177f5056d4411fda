// SPDX-License-Identifier: CEPL-1.0
//! Recording [`DeviceApi`] used by the unit tests.
//!
//! Hands out fake handles, tracks which ones are alive, logs every call by
//! name and plays back scripted results for acquire/present/wait/submit.
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::api::DeviceApi;
use crate::device::{Device, QueueFamilies};
use crate::swapchain::SwapchainSupportInfo;

#[derive(Default)]
struct State {
    next_raw: u64,
    live: BTreeMap<u64, &'static str>,
    calls: Vec<&'static str>,
    waited: Vec<Vec<vk::Fence>>,
    wait_timeouts: Vec<u64>,
    submitted: Vec<vk::Fence>,
    acquired_semaphores: Vec<vk::Semaphore>,
    support: SwapchainSupportInfo,
    image_count: u32,
    next_image: u32,
    acquire: VecDeque<VkResult<(u32, bool)>>,
    present: VecDeque<VkResult<bool>>,
    wait: VecDeque<VkResult<()>>,
    submit: VecDeque<VkResult<()>>,
}

pub struct MockDevice {
    state: RefCell<State>,
}

pub fn default_support() -> SwapchainSupportInfo {
    SwapchainSupportInfo {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

/// A single-family device with one device-local memory type.
pub fn test_device() -> Device {
    let mut memory = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 1,
        ..Default::default()
    };
    memory.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    Device {
        physical: vk::PhysicalDevice::from_raw(0xdead),
        families: QueueFamilies {
            graphics: 0,
            present: 0,
            transfer: 0,
            compute: Some(0),
        },
        graphics_queue: vk::Queue::from_raw(0xa1),
        present_queue: vk::Queue::from_raw(0xa1),
        transfer_queue: vk::Queue::from_raw(0xa1),
        properties: Default::default(),
        features: Default::default(),
        memory,
        depth_format: vk::Format::D32_SFLOAT,
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_raw: 0x1000,
                support: default_support(),
                ..Default::default()
            }),
        }
    }

    fn log(&self, call: &'static str) {
        self.state.borrow_mut().calls.push(call);
    }

    fn make<H: Handle>(&self, kind: &'static str) -> H {
        let mut s = self.state.borrow_mut();
        s.next_raw += 1;
        let raw = s.next_raw;
        s.live.insert(raw, kind);
        H::from_raw(raw)
    }

    fn release<H: Handle>(&self, handle: H) {
        let raw = handle.as_raw();
        if raw == 0 {
            return;
        }
        let removed = self.state.borrow_mut().live.remove(&raw);
        assert!(removed.is_some(), "destroying unknown or already destroyed handle {raw:#x}");
    }

    pub fn live_count(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.borrow().calls.iter().filter(|c| **c == call).count()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn fences_waited(&self) -> Vec<Vec<vk::Fence>> {
        self.state.borrow().waited.clone()
    }

    /// Timeout of each native fence wait, in call order.
    pub fn wait_timeouts(&self) -> Vec<u64> {
        self.state.borrow().wait_timeouts.clone()
    }

    pub fn fences_submitted(&self) -> Vec<vk::Fence> {
        self.state.borrow().submitted.clone()
    }

    pub fn acquire_semaphores(&self) -> Vec<vk::Semaphore> {
        self.state.borrow().acquired_semaphores.clone()
    }

    pub fn set_support(&self, support: SwapchainSupportInfo) {
        self.state.borrow_mut().support = support;
    }

    pub fn script_acquire(&self, r: VkResult<(u32, bool)>) {
        self.state.borrow_mut().acquire.push_back(r);
    }

    pub fn script_present(&self, r: VkResult<bool>) {
        self.state.borrow_mut().present.push_back(r);
    }

    pub fn script_wait(&self, r: VkResult<()>) {
        self.state.borrow_mut().wait.push_back(r);
    }

    pub fn script_submit(&self, r: VkResult<()>) {
        self.state.borrow_mut().submit.push_back(r);
    }
}

impl DeviceApi for MockDevice {
    fn device_wait_idle(&self) -> VkResult<()> {
        self.log("device_wait_idle");
        Ok(())
    }

    fn surface(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(0x5f)
    }

    fn query_swapchain_support(&self) -> VkResult<SwapchainSupportInfo> {
        self.log("query_swapchain_support");
        Ok(self.state.borrow().support.clone())
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
        self.log("create_swapchain");
        {
            let mut s = self.state.borrow_mut();
            s.image_count = info.min_image_count;
            s.next_image = 0;
        }
        Ok(self.make("swapchain"))
    }

    fn get_swapchain_images(&self, _swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.log("get_swapchain_images");
        let mut s = self.state.borrow_mut();
        let mut out = Vec::new();
        for _ in 0..s.image_count {
            // Owned by the swapchain, never destroyed individually.
            s.next_raw += 1;
            out.push(vk::Image::from_raw(s.next_raw));
        }
        Ok(out)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.log("destroy_swapchain");
        self.release(swapchain);
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
        _fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        self.log("acquire_next_image");
        let mut s = self.state.borrow_mut();
        s.acquired_semaphores.push(semaphore);
        if let Some(r) = s.acquire.pop_front() {
            return r;
        }
        let idx = s.next_image;
        s.next_image = (idx + 1) % s.image_count.max(1);
        Ok((idx, false))
    }

    fn queue_present(&self, _queue: vk::Queue, _info: &vk::PresentInfoKHR<'_>) -> VkResult<bool> {
        self.log("queue_present");
        self.state.borrow_mut().present.pop_front().unwrap_or(Ok(false))
    }

    fn create_image(&self, _info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        self.log("create_image");
        Ok(self.make("image"))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.log("destroy_image");
        self.release(image);
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: 0b1,
        }
    }

    fn allocate_memory(&self, _info: &vk::MemoryAllocateInfo<'_>) -> VkResult<vk::DeviceMemory> {
        self.log("allocate_memory");
        Ok(self.make("memory"))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.log("free_memory");
        self.release(memory);
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory, _offset: u64) -> VkResult<()> {
        self.log("bind_image_memory");
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        self.log("create_image_view");
        Ok(self.make("image_view"))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.log("destroy_image_view");
        self.release(view);
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        self.log("create_render_pass");
        Ok(self.make("render_pass"))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.log("destroy_render_pass");
        self.release(render_pass);
    }

    fn create_framebuffer(&self, _info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer> {
        self.log("create_framebuffer");
        Ok(self.make("framebuffer"))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.log("destroy_framebuffer");
        self.release(framebuffer);
    }

    fn create_command_pool(&self, _info: &vk::CommandPoolCreateInfo<'_>) -> VkResult<vk::CommandPool> {
        self.log("create_command_pool");
        Ok(self.make("command_pool"))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.log("destroy_command_pool");
        self.release(pool);
    }

    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.log("allocate_command_buffers");
        Ok((0..info.command_buffer_count)
            .map(|_| self.make("command_buffer"))
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.log("free_command_buffers");
        for &b in buffers {
            self.release(b);
        }
    }

    fn begin_command_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        self.log("begin_command_buffer");
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.log("end_command_buffer");
        Ok(())
    }

    fn reset_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        self.log("reset_command_buffer");
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _cmd: vk::CommandBuffer, _info: &vk::RenderPassBeginInfo<'_>) {
        self.log("cmd_begin_render_pass");
    }

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.log("cmd_end_render_pass");
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, _viewport: vk::Viewport) {
        self.log("cmd_set_viewport");
    }

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, _scissor: vk::Rect2D) {
        self.log("cmd_set_scissor");
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.log("create_semaphore");
        Ok(self.make("semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.log("destroy_semaphore");
        self.release(semaphore);
    }

    fn create_fence(&self, _signaled: bool) -> VkResult<vk::Fence> {
        self.log("create_fence");
        Ok(self.make("fence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.log("destroy_fence");
        self.release(fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> VkResult<()> {
        self.log("wait_for_fences");
        let mut s = self.state.borrow_mut();
        s.waited.push(fences.to_vec());
        s.wait_timeouts.push(timeout);
        s.wait.pop_front().unwrap_or(Ok(()))
    }

    fn reset_fences(&self, _fences: &[vk::Fence]) -> VkResult<()> {
        self.log("reset_fences");
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        _submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.log("queue_submit");
        let mut s = self.state.borrow_mut();
        let r = s.submit.pop_front().unwrap_or(Ok(()));
        if r.is_ok() {
            s.submitted.push(fence);
        }
        r
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.log("queue_wait_idle");
        Ok(())
    }
}
