// SPDX-License-Identifier: CEPL-1.0
//! Per-surface frame pipeline: swapchain, render targets, command buffers and
//! frame synchronization behind `begin_frame` / `end_frame`.
use ash::vk;
use glam::Vec4;
use stratus_render::{FrameStatus, PresentModePreference, RenderSize, RendererConfig};
use tracing::{debug, error, info, trace, warn};

use crate::api::DeviceApi;
use crate::command_buffer::{self, CommandBuffer, CommandBufferUsage};
use crate::device::Device;
use crate::error::{CallContext, VkResultOf};
use crate::framebuffer::{create_framebuffers, destroy_framebuffers, Framebuffer};
use crate::renderpass::Renderpass;
use crate::swapchain::{is_zero_extent, AcquireOutcome, PresentOutcome, Swapchain};
use crate::sync::FrameSync;

pub struct Surface<D: DeviceApi> {
    api: D,
    device: Device,
    swapchain: Option<Swapchain>,
    renderpass: Option<Renderpass>,
    framebuffers: Vec<Framebuffer>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<CommandBuffer>,
    sync: FrameSync,

    image_index: u32,
    size: RenderSize,
    size_generation: u64,
    last_generation: u64,
    recreating: bool,

    present_mode: PresentModePreference,
    clear_color: Vec4,
    fence_timeout_ns: u64,
    shut_down: bool,
}

impl<D: DeviceApi> Surface<D> {
    /// Builds every per-surface resource on top of an already created device.
    /// On failure whatever was created is released again.
    pub fn initialize(api: D, device: Device, size: RenderSize, cfg: &RendererConfig) -> VkResultOf<Self> {
        let mut surface = Surface {
            api,
            device,
            swapchain: None,
            renderpass: None,
            framebuffers: Vec::new(),
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            sync: FrameSync::default(),
            image_index: 0,
            size,
            size_generation: 0,
            last_generation: 0,
            recreating: false,
            present_mode: cfg.present_mode,
            clear_color: cfg.clear_color(),
            fence_timeout_ns: cfg.fence_timeout_ns(),
            shut_down: false,
        };
        // Drop runs shutdown on the error path.
        surface.create_resources()?;
        info!("vk: surface initialized ({}x{})", size.width, size.height);
        Ok(surface)
    }

    fn create_resources(&mut self) -> VkResultOf<()> {
        let api = &self.api;
        let swapchain = Swapchain::create(
            api,
            &self.device,
            self.size.width,
            self.size.height,
            self.present_mode,
        )?;
        let extent = swapchain.extent;
        let color_format = swapchain.surface_format.format;
        let frames = swapchain.max_frames_in_flight;
        self.swapchain = Some(swapchain);

        let renderpass = Renderpass::create(
            api,
            color_format,
            self.device.depth_format,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            self.clear_color,
            1.0,
            0,
        )?;
        self.renderpass = Some(renderpass);

        self.command_pool = command_buffer::create_pool(api, self.device.families.graphics)?;
        self.sync = FrameSync::create(api, frames, 0)?;
        self.create_targets()
    }

    /// Framebuffers, per-image command buffers and the images-in-flight table
    /// all follow the swapchain's image list.
    fn rebuild_targets(&mut self) -> VkResultOf<()> {
        self.destroy_targets();
        self.create_targets()
    }

    fn destroy_targets(&mut self) {
        for cmd in &mut self.command_buffers {
            cmd.free(&self.api, self.command_pool);
        }
        self.command_buffers.clear();
        destroy_framebuffers(&self.api, &mut self.framebuffers);
    }

    fn create_targets(&mut self) -> VkResultOf<()> {
        let (Some(swapchain), Some(renderpass)) = (&self.swapchain, &mut self.renderpass) else {
            return Ok(());
        };
        renderpass.set_extent(swapchain.extent);

        self.framebuffers = create_framebuffers(&self.api, swapchain, renderpass)?;
        self.command_buffers =
            command_buffer::allocate_per_image(&self.api, self.command_pool, swapchain.image_count())?;
        self.sync.reset_images(swapchain.image_count());

        assert_eq!(self.framebuffers.len(), swapchain.image_count());
        assert_eq!(swapchain.views.len(), swapchain.image_count());
        debug!("vk: rebuilt {} framebuffers", self.framebuffers.len());
        Ok(())
    }

    /// Records the new size. The swapchain is rebuilt by the next
    /// `begin_frame`.
    pub fn on_resized(&mut self, size: RenderSize) {
        self.size = size;
        self.size_generation += 1;
        debug!(
            "vk: resize to {}x{} (generation {})",
            size.width, size.height, self.size_generation
        );
    }

    /// Returns `false` without destroying anything when the surface has no
    /// area or a recreation is already running.
    fn recreate_swapchain(&mut self) -> VkResultOf<bool> {
        if self.recreating {
            debug!("vk: recreate requested while already recreating");
            return Ok(false);
        }
        if self.size.is_empty() {
            debug!("vk: recreate skipped, surface is {}x{}", self.size.width, self.size.height);
            return Ok(false);
        }
        // The window may already be minimized before its resize event lands.
        let extent = Swapchain::surface_extent(&self.api, self.size.width, self.size.height)?;
        if is_zero_extent(extent) {
            debug!("vk: recreate deferred, surface reports no area");
            return Ok(false);
        }

        self.recreating = true;
        let result = self.rebuild_swapchain();
        self.recreating = false;
        if !result? {
            return Ok(false);
        }

        self.last_generation = self.size_generation;
        Ok(true)
    }

    fn rebuild_swapchain(&mut self) -> VkResultOf<bool> {
        self.api.device_wait_idle().call("device_wait_idle")?;
        self.destroy_targets();
        self.sync.reset_images(0);
        let rebuilt = match &mut self.swapchain {
            Some(swapchain) => {
                swapchain.recreate(&self.api, &self.device, self.size.width, self.size.height)?
            }
            None => false,
        };
        self.create_targets()?;
        Ok(rebuilt)
    }

    fn swapchain_needs_rebuild(&self) -> bool {
        self.swapchain.as_ref().is_some_and(|s| s.needs_rebuild())
    }

    pub fn begin_frame(&mut self, _delta: f32) -> VkResultOf<FrameStatus> {
        if self.shut_down || self.size.is_empty() {
            return Ok(FrameStatus::Skipped);
        }

        if self.recreating {
            self.api.device_wait_idle().call("device_wait_idle")?;
            debug!("vk: recreation in progress, skipping frame");
            return Ok(FrameStatus::Skipped);
        }

        if self.size_generation != self.last_generation || self.swapchain_needs_rebuild() {
            self.api.device_wait_idle().call("device_wait_idle")?;
            if self.recreate_swapchain()? {
                info!("vk: swapchain resized, skipping frame");
            }
            return Ok(FrameStatus::Skipped);
        }

        let frame = self.sync.current_frame;
        if !self.sync.in_flight[frame].wait(&self.api, self.fence_timeout_ns)? {
            warn!("vk: in-flight fence {frame} not ready, skipping frame");
            return Ok(FrameStatus::Skipped);
        }

        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(FrameStatus::Skipped);
        };
        let acquired = swapchain.acquire_next_image(
            &self.api,
            &self.device,
            u64::MAX,
            self.sync.image_available[frame],
            vk::Fence::null(),
        )?;
        let image = match acquired {
            AcquireOutcome::Image(i) => i,
            AcquireOutcome::Stale => {
                if !swapchain.needs_rebuild() {
                    self.rebuild_targets()?;
                }
                return Ok(FrameStatus::Skipped);
            }
        };
        self.image_index = image;
        let extent = swapchain.extent;

        // The buffer we are about to reset may still belong to a submission
        // guarded by another slot. The image is acquired, so the frame has to
        // go through: no timeout here.
        self.sync.wait_for_image(&self.api, image as usize, u64::MAX)?;

        let api = &self.api;
        let cmd = &mut self.command_buffers[image as usize];
        cmd.reset(api)?;
        cmd.begin(api, CommandBufferUsage::empty())?;

        // Flipped Y so +Y points up in clip space.
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        api.cmd_set_viewport(cmd.handle, viewport);
        api.cmd_set_scissor(cmd.handle, scissor);

        if let Some(renderpass) = &self.renderpass {
            renderpass.begin(api, cmd, self.framebuffers[image as usize].handle);
        }
        trace!("vk: frame {frame} recording image {image}");
        Ok(FrameStatus::Ready)
    }

    pub fn end_frame(&mut self, _delta: f32) -> VkResultOf<()> {
        let frame = self.sync.current_frame;
        let image = self.image_index as usize;

        let api = &self.api;
        let cmd = &mut self.command_buffers[image];
        if let Some(renderpass) = &self.renderpass {
            renderpass.end(api, cmd);
        }
        cmd.end(api)?;

        // An earlier frame may still be using this image.
        self.sync.wait_for_image(api, image, u64::MAX)?;
        self.sync.claim_image(image);
        self.sync.in_flight[frame].reset(api)?;

        let waits = [self.sync.image_available[frame]];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [cmd.handle];
        let signals = [self.sync.queue_complete[frame]];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);
        if let Err(e) = api
            .queue_submit(
                self.device.graphics_queue,
                std::slice::from_ref(&submit),
                self.sync.in_flight[frame].handle,
            )
            .call("queue_submit")
        {
            error!("vk: queue submit failed: {e}");
            return Err(e);
        }
        cmd.mark_submitted();

        let presented = match self.swapchain.as_mut() {
            Some(swapchain) => swapchain.present(
                &self.api,
                &self.device,
                self.device.present_queue,
                self.sync.queue_complete[frame],
                self.image_index,
            )?,
            None => PresentOutcome::Presented,
        };
        if presented == PresentOutcome::Stale && !self.swapchain_needs_rebuild() {
            self.rebuild_targets()?;
        }

        self.sync.advance();
        Ok(())
    }

    /// Command buffer being recorded between `begin_frame` and `end_frame`.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers
            .get(self.image_index as usize)
            .map(|c| c.handle)
            .unwrap_or_default()
    }

    /// Records and runs a one-off command buffer on the graphics queue,
    /// blocking until it completes.
    pub fn immediate_submit(&mut self, record: impl FnOnce(&D, vk::CommandBuffer)) -> VkResultOf<()> {
        let cmd = CommandBuffer::allocate_begin_single_use(&self.api, self.command_pool)?;
        record(&self.api, cmd.handle);
        cmd.end_single_use(&self.api, self.command_pool, self.device.graphics_queue)
    }

    pub fn set_clear_color(&mut self, rgba: Vec4) {
        self.clear_color = rgba;
        if let Some(renderpass) = &mut self.renderpass {
            renderpass.clear_color = rgba;
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn api(&self) -> &D {
        &self.api
    }

    pub fn size_generation(&self) -> u64 {
        self.size_generation
    }

    pub fn last_generation(&self) -> u64 {
        self.last_generation
    }

    pub fn current_frame(&self) -> usize {
        self.sync.current_frame
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |s| s.image_count())
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map(|s| s.extent)
            .unwrap_or_default()
    }

    // STRICT TEARDOWN ORDER:
    // - device idle
    // - sync objects, then command buffers
    // - framebuffers BEFORE renderpass and swapchain views
    // - swapchain (views, depth, chain), then the pool
    // The device, surface and instance go with `D`.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let api = &self.api;

        if let Err(e) = api.device_wait_idle() {
            error!("vk: device_wait_idle at shutdown: {e}");
        }

        self.sync.destroy(api);

        for cmd in &mut self.command_buffers {
            cmd.free(api, self.command_pool);
        }
        self.command_buffers.clear();

        destroy_framebuffers(api, &mut self.framebuffers);

        if let Some(mut renderpass) = self.renderpass.take() {
            renderpass.destroy(api);
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(api);
        }

        if self.command_pool != vk::CommandPool::null() {
            api.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
        }
        info!("vk: surface shut down");
    }
}

impl<D: DeviceApi> Drop for Surface<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
