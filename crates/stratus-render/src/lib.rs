// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic renderer frontend.
//!
//! The application owns a [`Renderer`], which drives one boxed
//! [`RendererBackend`] per frame. Backends report frames they could not draw
//! (stale surface, minimized window) as [`FrameStatus::Skipped`]; only
//! unrecoverable failures come back as errors.
use anyhow::Result;
use glam::Vec4;
use serde::Deserialize;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero-area surface cannot back a swapchain.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Per-frame input handed from the application loop to the renderer.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenderPacket {
    pub delta: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendApi {
    #[default]
    Vulkan,
}

impl std::str::FromStr for BackendApi {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vk" | "vulkan" => Ok(BackendApi::Vulkan),
            other => Err(anyhow::anyhow!("unknown renderer backend '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// The backend began a frame; `end_frame` must follow.
    Ready,
    /// Nothing was recorded this tick. Not an error.
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    Fifo,    // Always vsync
    #[default]
    Mailbox, // Low latency when available, FIFO otherwise
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub clear_color: [f32; 4],
    pub present_mode: PresentModePreference,
    pub require_discrete_gpu: bool,
    /// `None` enables validation in debug builds only.
    pub validation: Option<bool>,
    /// `None` waits on frame fences without a bound.
    pub fence_timeout_ms: Option<u64>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.2, 1.0],
            present_mode: PresentModePreference::Mailbox,
            require_discrete_gpu: true,
            validation: None,
            fence_timeout_ms: None,
        }
    }
}

impl RendererConfig {
    pub fn validation_enabled(&self) -> bool {
        self.validation.unwrap_or(cfg!(debug_assertions))
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        match self.fence_timeout_ms {
            Some(ms) => ms.saturating_mul(1_000_000),
            None => u64::MAX,
        }
    }

    pub fn clear_color(&self) -> Vec4 {
        Vec4::from_array(self.clear_color)
    }
}

/// One graphics API implementation of the frame loop.
pub trait RendererBackend {
    fn api(&self) -> BackendApi;

    /// Records the new surface size. Recreation is deferred to the next
    /// `begin_frame`.
    fn resized(&mut self, size: RenderSize);

    fn begin_frame(&mut self, delta: f32) -> Result<FrameStatus>;
    fn end_frame(&mut self, delta: f32) -> Result<()>;

    fn set_clear_color(&mut self, rgba: Vec4);

    /// Releases every GPU resource. Calling it twice is a no-op.
    fn shutdown(&mut self);
}

pub struct Renderer {
    backend: Box<dyn RendererBackend>,
    frame_number: u64,
    shut_down: bool,
}

impl Renderer {
    pub fn new(backend: Box<dyn RendererBackend>) -> Self {
        info!("renderer frontend up ({:?})", backend.api());
        Self {
            backend,
            frame_number: 0,
            shut_down: false,
        }
    }

    pub fn api(&self) -> BackendApi {
        self.backend.api()
    }

    /// Number of frames that went through `end_frame` successfully.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn on_resized(&mut self, size: RenderSize) {
        debug!("renderer resized to {}x{}", size.width, size.height);
        self.backend.resized(size);
    }

    pub fn set_clear_color(&mut self, rgba: Vec4) {
        self.backend.set_clear_color(rgba);
    }

    /// Runs one frame. `Ok` covers both drawn and skipped frames; an `Err`
    /// means the backend is unusable and the application should exit.
    pub fn draw_frame(&mut self, packet: &RenderPacket) -> Result<()> {
        match self.backend.begin_frame(packet.delta)? {
            FrameStatus::Skipped => Ok(()),
            FrameStatus::Ready => {
                if let Err(e) = self.backend.end_frame(packet.delta) {
                    error!("end_frame failed, shutting down: {e:#}");
                    return Err(e);
                }
                self.frame_number += 1;
                Ok(())
            }
        }
    }

    pub fn shutdown(&mut self) {
        if !self.shut_down {
            self.backend.shutdown();
            self.shut_down = true;
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
