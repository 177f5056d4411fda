// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::api::DeviceApi;
use crate::error::{CallContext, VkResultOf};
use crate::renderpass::{Renderpass, ATTACHMENT_COUNT};
use crate::swapchain::Swapchain;

#[derive(Debug)]
pub struct Framebuffer {
    pub handle: vk::Framebuffer,
    pub attachments: Vec<vk::ImageView>,
}

impl Framebuffer {
    pub fn create<D: DeviceApi>(
        api: &D,
        renderpass: &Renderpass,
        width: u32,
        height: u32,
        attachments: &[vk::ImageView],
    ) -> VkResultOf<Self> {
        let fb_info = vk::FramebufferCreateInfo::default()
            .render_pass(renderpass.handle)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(1);
        let handle = api.create_framebuffer(&fb_info).call("create_framebuffer")?;
        Ok(Self {
            handle,
            attachments: attachments.to_vec(),
        })
    }

    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        if self.handle != vk::Framebuffer::null() {
            api.destroy_framebuffer(self.handle);
            self.handle = vk::Framebuffer::null();
        }
        self.attachments.clear();
    }
}

/// One framebuffer per swapchain image: `[color view, depth view]`.
pub fn create_framebuffers<D: DeviceApi>(
    api: &D,
    swapchain: &Swapchain,
    renderpass: &Renderpass,
) -> VkResultOf<Vec<Framebuffer>> {
    let mut out = Vec::with_capacity(swapchain.views.len());
    for &view in &swapchain.views {
        let attachments: [vk::ImageView; ATTACHMENT_COUNT] = [view, swapchain.depth.view];
        match Framebuffer::create(
            api,
            renderpass,
            swapchain.extent.width,
            swapchain.extent.height,
            &attachments,
        ) {
            Ok(fb) => out.push(fb),
            Err(e) => {
                destroy_framebuffers(api, &mut out);
                return Err(e);
            }
        }
    }
    Ok(out)
}

pub fn destroy_framebuffers<D: DeviceApi>(api: &D, framebuffers: &mut Vec<Framebuffer>) {
    for mut fb in framebuffers.drain(..) {
        fb.destroy(api);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_device, MockDevice};
    use glam::Vec4;
    use stratus_render::PresentModePreference;

    #[test]
    fn one_framebuffer_per_image_with_shared_depth() {
        let api = MockDevice::new();
        let device = test_device();
        let mut sc =
            Swapchain::create(&api, &device, 800, 600, PresentModePreference::Mailbox).unwrap();
        let mut rp = Renderpass::create(
            &api,
            sc.surface_format.format,
            device.depth_format,
            vk::Rect2D::default(),
            Vec4::ONE,
            1.0,
            0,
        )
        .unwrap();

        let mut fbs = create_framebuffers(&api, &sc, &rp).unwrap();
        assert_eq!(fbs.len(), sc.images.len());
        for (fb, &view) in fbs.iter().zip(&sc.views) {
            assert_eq!(fb.attachments, vec![view, sc.depth.view]);
        }

        destroy_framebuffers(&api, &mut fbs);
        rp.destroy(&api);
        sc.destroy(&api);
        assert_eq!(api.live_count(), 0);
    }
}
