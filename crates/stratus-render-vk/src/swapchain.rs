// SPDX-License-Identifier: CEPL-1.0
use ash::khr::surface;
use ash::prelude::VkResult;
use ash::vk;
use stratus_render::PresentModePreference;
use tracing::{debug, error, info};

use crate::api::DeviceApi;
use crate::device::Device;
use crate::error::{CallContext, VkError, VkResultOf};
use crate::image::{create_view, Image, ImageSpec};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// What the surface supports. Re-queried on every (re)creation.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupportInfo {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportInfo {
    /// # Safety
    /// `phys` and `surface` must belong to the instance behind `loader`.
    pub unsafe fn query(
        loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Self> {
        Ok(Self {
            capabilities: loader.get_physical_device_surface_capabilities(phys, surface)?,
            formats: loader.get_physical_device_surface_formats(phys, surface)?,
            present_modes: loader.get_physical_device_surface_present_modes(phys, surface)?,
        })
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is always available, so it backs every other choice.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means "no max").
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

/// True when a swapchain of this extent cannot be created.
pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// After `Stale` the chain has either been rebuilt or, when the surface has
/// no area, left as is with [`Swapchain::needs_rebuild`] set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    /// The chain was out of date; nothing was acquired.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented (or dropped) and the chain went out of date.
    Stale,
}

#[derive(Debug)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub depth: Image,
    pub max_frames_in_flight: usize,
    preference: PresentModePreference,
    // Last size asked for, reused for self-triggered recreation.
    requested: vk::Extent2D,
    stale: bool,
}

impl Swapchain {
    pub fn create<D: DeviceApi>(
        api: &D,
        device: &Device,
        width: u32,
        height: u32,
        preference: PresentModePreference,
    ) -> VkResultOf<Self> {
        let mut sc = Swapchain {
            handle: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            depth: Image::default(),
            max_frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            preference,
            requested: vk::Extent2D { width, height },
            stale: false,
        };
        let built = api
            .query_swapchain_support()
            .call("query_swapchain_support")
            .and_then(|support| sc.build(api, device, &support));
        if let Err(e) = built {
            sc.release(api);
            return Err(e);
        }
        Ok(sc)
    }

    /// Extent a rebuild at `width`x`height` would get right now. Zero area
    /// while the window is minimized.
    pub fn surface_extent<D: DeviceApi>(api: &D, width: u32, height: u32) -> VkResultOf<vk::Extent2D> {
        let support = api
            .query_swapchain_support()
            .call("query_swapchain_support")?;
        Ok(choose_extent(&support.capabilities, width, height))
    }

    fn build<D: DeviceApi>(
        &mut self,
        api: &D,
        device: &Device,
        support: &SwapchainSupportInfo,
    ) -> VkResultOf<()> {
        let caps = support.capabilities;

        self.surface_format =
            choose_surface_format(&support.formats).ok_or(VkError::NoSurfaceFormat)?;
        self.present_mode = choose_present_mode(&support.present_modes, self.preference);
        self.extent = choose_extent(&caps, self.requested.width, self.requested.height);
        let image_count = choose_image_count(&caps);

        let shared = device.sharing_families();
        let mut info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: api.surface(),
            min_image_count: image_count,
            image_format: self.surface_format.format,
            image_color_space: self.surface_format.color_space,
            image_extent: self.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: self.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        if let Some(families) = &shared {
            info = info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families);
        }

        self.handle = api.create_swapchain(&info).call("create_swapchain")?;
        self.images = api
            .get_swapchain_images(self.handle)
            .call("get_swapchain_images")?;

        for &img in &self.images {
            let view = create_view(
                api,
                img,
                self.surface_format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            self.views.push(view);
        }

        self.depth = Image::create(
            api,
            device,
            ImageSpec::depth_attachment(self.extent.width, self.extent.height, device.depth_format),
        )?;

        info!(
            "vk: swapchain {}x{} images={} format={:?} present={:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.surface_format.format,
            self.present_mode
        );
        Ok(())
    }

    /// Destroy-all then rebuild-all at the new size. When the surface has no
    /// area nothing is touched, `needs_rebuild` is set and `Ok(false)` comes
    /// back.
    pub fn recreate<D: DeviceApi>(
        &mut self,
        api: &D,
        device: &Device,
        width: u32,
        height: u32,
    ) -> VkResultOf<bool> {
        self.requested = vk::Extent2D { width, height };
        let support = api
            .query_swapchain_support()
            .call("query_swapchain_support")?;
        if is_zero_extent(choose_extent(&support.capabilities, width, height)) {
            debug!("vk: surface has no area, swapchain rebuild deferred");
            self.stale = true;
            return Ok(false);
        }

        self.destroy(api);
        if let Err(e) = self.build(api, device, &support) {
            self.release(api);
            return Err(e);
        }
        self.stale = false;
        Ok(true)
    }

    /// The chain is out of date but could not be rebuilt yet.
    pub fn needs_rebuild(&self) -> bool {
        self.stale
    }

    /// Waits for the device, then releases every handle. Idempotent.
    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        if self.handle == vk::SwapchainKHR::null() && self.views.is_empty() {
            return;
        }
        if let Err(e) = api.device_wait_idle() {
            error!("vk: device_wait_idle before swapchain destroy: {e}");
        }
        self.release(api);
    }

    fn release<D: DeviceApi>(&mut self, api: &D) {
        self.depth.destroy(api);
        for view in self.views.drain(..) {
            api.destroy_image_view(view);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            api.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn acquire_next_image<D: DeviceApi>(
        &mut self,
        api: &D,
        device: &Device,
        timeout: u64,
        image_available: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResultOf<AcquireOutcome> {
        match api.acquire_next_image(self.handle, timeout, image_available, fence) {
            // Suboptimal still hands back a usable image.
            Ok((index, _suboptimal)) => Ok(AcquireOutcome::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("vk: acquire reported out of date");
                let size = self.requested;
                self.recreate(api, device, size.width, size.height)?;
                Ok(AcquireOutcome::Stale)
            }
            Err(result) => {
                error!("vk: failed to acquire swapchain image: {result}");
                Err(VkError::Vulkan {
                    call: "acquire_next_image",
                    result,
                })
            }
        }
    }

    pub fn present<D: DeviceApi>(
        &mut self,
        api: &D,
        device: &Device,
        present_queue: vk::Queue,
        render_complete: vk::Semaphore,
        image_index: u32,
    ) -> VkResultOf<PresentOutcome> {
        let waits = [render_complete];
        let swapchains = [self.handle];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match api.queue_present(present_queue, &info) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("vk: present reported stale swapchain");
                let size = self.requested;
                self.recreate(api, device, size.width, size.height)?;
                Ok(PresentOutcome::Stale)
            }
            Err(result) => {
                error!("vk: failed to present swapchain image: {result}");
                Err(VkError::Vulkan {
                    call: "queue_present",
                    result,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{default_support, test_device, MockDevice};

    fn minimized_surface() -> SwapchainSupportInfo {
        let mut support = default_support();
        support.capabilities.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        support
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn format_prefers_bgra_srgb_else_first() {
        let rgba = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let bgra = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[rgba, bgra]), Some(bgra));
        assert_eq!(choose_surface_format(&[rgba]), Some(rgba));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        use vk::PresentModeKHR as P;
        let pref = PresentModePreference::Mailbox;
        assert_eq!(choose_present_mode(&[P::FIFO, P::MAILBOX], pref), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE], pref), P::FIFO);
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::MAILBOX], PresentModePreference::Fifo),
            P::FIFO
        );
    }

    #[test]
    fn extent_clamps_only_for_sentinel() {
        let c = caps(2, 0);
        assert_eq!(
            choose_extent(&c, 4000, 8),
            vk::Extent2D {
                width: 2048,
                height: 16
            }
        );

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..c
        };
        assert_eq!(
            choose_extent(&fixed, 1, 1),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
    }

    #[test]
    fn create_then_destroy_releases_everything() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 1280, 720, PresentModePreference::Mailbox).unwrap();
        assert_eq!(sc.images.len(), 3);
        assert_eq!(sc.views.len(), sc.images.len());
        assert_eq!(sc.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(sc.extent.width, 1280);

        sc.destroy(&api);
        assert_eq!(api.live_count(), 0);
        assert_eq!(sc.handle, vk::SwapchainKHR::null());
        assert!(sc.views.is_empty() && sc.images.is_empty());
        assert_eq!(sc.depth.view, vk::ImageView::null());

        let idles = api.count("device_wait_idle");
        sc.destroy(&api);
        assert_eq!(api.count("device_wait_idle"), idles);
    }

    #[test]
    fn recreate_follows_new_size() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 1280, 720, PresentModePreference::Fifo).unwrap();
        sc.recreate(&api, &device, 640, 480).unwrap();
        assert_eq!(sc.extent, vk::Extent2D { width: 640, height: 480 });
        assert_eq!(sc.views.len(), sc.images.len());
        assert_eq!(api.count("create_swapchain"), 2);
        assert_eq!(api.count("destroy_swapchain"), 1);
    }

    #[test]
    fn out_of_date_acquire_recreates() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 800, 600, PresentModePreference::Mailbox).unwrap();
        api.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let out = sc
            .acquire_next_image(&api, &device, u64::MAX, vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(out, AcquireOutcome::Stale);
        assert_eq!(api.count("create_swapchain"), 2);

        api.script_acquire(Err(vk::Result::ERROR_DEVICE_LOST));
        let err = sc
            .acquire_next_image(&api, &device, u64::MAX, vk::Semaphore::null(), vk::Fence::null())
            .unwrap_err();
        assert_eq!(err.result(), Some(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn suboptimal_present_recreates_but_is_not_an_error() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 800, 600, PresentModePreference::Mailbox).unwrap();
        api.script_present(Ok(true));
        let q = device.present_queue;
        let out = sc.present(&api, &device, q, vk::Semaphore::null(), 0).unwrap();
        assert_eq!(out, PresentOutcome::Stale);
        assert_eq!(api.count("create_swapchain"), 2);

        api.script_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert!(sc.present(&api, &device, q, vk::Semaphore::null(), 0).is_err());
    }

    #[test]
    fn minimized_surface_defers_rebuild() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 800, 600, PresentModePreference::Mailbox).unwrap();
        let handle = sc.handle;

        api.set_support(minimized_surface());
        api.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let q = device.present_queue;
        let out = sc.present(&api, &device, q, vk::Semaphore::null(), 0).unwrap();
        assert_eq!(out, PresentOutcome::Stale);
        assert!(sc.needs_rebuild());
        assert_eq!(sc.handle, handle);
        assert_eq!(sc.extent, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(api.count("create_swapchain"), 1);
        assert_eq!(api.count("destroy_swapchain"), 0);

        api.set_support(default_support());
        assert!(sc.recreate(&api, &device, 800, 600).unwrap());
        assert!(!sc.needs_rebuild());
        assert_eq!(api.count("create_swapchain"), 2);
    }
}
