// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the Stratus renderer.
//!
//! [`VulkanBackend`] owns one window surface and drives the frame pipeline in
//! [`surface::Surface`]. All native calls go through [`api::DeviceApi`].
use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use stratus_render::{BackendApi, FrameStatus, RenderSize, RendererBackend, RendererConfig};
use tracing::info;

pub mod api;
pub mod command_buffer;
pub mod device;
pub mod error;
pub mod fence;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod renderpass;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{AshDevice, DeviceApi};
pub use error::VkError;

use device::DeviceRequirements;
use instance::InstanceContext;
use surface::Surface;

pub struct VulkanBackend {
    surface: Surface<AshDevice>,
}

impl VulkanBackend {
    // STRICT ORDER:
    // 1) Instance, then the surface FROM THIS INSTANCE
    // 2) Physical device queried against this surface (present support)
    // 3) Logical device, then per-surface resources
    pub fn initialize(
        app_name: &str,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RendererConfig,
    ) -> Result<Self> {
        let reqs = DeviceRequirements {
            discrete_gpu: cfg.require_discrete_gpu,
            ..Default::default()
        };

        unsafe {
            let ctx = InstanceContext::new(app_name, window, display, cfg.validation_enabled())
                .context("vulkan instance")?;
            let selected =
                device::select_physical_device(&ctx, &reqs).context("physical device selection")?;
            let (raw, device) = device::create_logical_device(&ctx, &selected, &reqs)
                .context("logical device")?;
            let api = AshDevice::new(ctx, selected.physical, raw);

            let surface = Surface::initialize(api, device, size, cfg).context("swapchain setup")?;
            let extent = surface.extent();
            info!(
                "Vulkan backend ready ({}x{}, {} images)",
                extent.width,
                extent.height,
                surface.image_count()
            );
            Ok(Self { surface })
        }
    }

    /// Runs `record` on a one-shot command buffer on the graphics queue and
    /// waits for it to finish.
    pub fn immediate_submit(&mut self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        self.surface
            .immediate_submit(|api, cmd| record(api.raw(), cmd))
            .context("immediate_submit")
    }

    /// Valid between a `Ready` `begin_frame` and the matching `end_frame`.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.surface.current_command_buffer()
    }

    pub fn device(&self) -> &device::Device {
        self.surface.device()
    }
}

impl RendererBackend for VulkanBackend {
    fn api(&self) -> BackendApi {
        BackendApi::Vulkan
    }

    fn resized(&mut self, size: RenderSize) {
        self.surface.on_resized(size);
    }

    fn begin_frame(&mut self, delta: f32) -> Result<FrameStatus> {
        Ok(self.surface.begin_frame(delta)?)
    }

    fn end_frame(&mut self, delta: f32) -> Result<()> {
        Ok(self.surface.end_frame(delta)?)
    }

    fn set_clear_color(&mut self, rgba: Vec4) {
        self.surface.set_clear_color(rgba);
    }

    fn shutdown(&mut self) {
        self.surface.shutdown();
    }
}
