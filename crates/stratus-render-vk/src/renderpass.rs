// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use glam::Vec4;

use crate::api::DeviceApi;
use crate::command_buffer::CommandBuffer;
use crate::error::{CallContext, VkResultOf};

/// Color first, then depth. Framebuffers and clear values follow this order.
pub const ATTACHMENT_COUNT: usize = 2;

pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
) -> [vk::AttachmentDescription; ATTACHMENT_COUNT] {
    let color = vk::AttachmentDescription {
        format: color_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let depth = vk::AttachmentDescription {
        format: depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    };
    [color, depth]
}

#[derive(Debug)]
pub struct Renderpass {
    pub handle: vk::RenderPass,
    pub render_area: vk::Rect2D,
    pub clear_color: Vec4,
    pub depth: f32,
    pub stencil: u32,
}

impl Renderpass {
    pub fn create<D: DeviceApi>(
        api: &D,
        color_format: vk::Format,
        depth_format: vk::Format,
        render_area: vk::Rect2D,
        clear_color: Vec4,
        depth: f32,
        stencil: u32,
    ) -> VkResultOf<Self> {
        let attachments = attachment_descriptions(color_format, depth_format);
        let color_ref = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)
            .depth_stencil_attachment(&depth_ref);

        // Previous frame's color output (and depth clear) must finish first.
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: stages,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        };

        let rp_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));
        let handle = api.create_render_pass(&rp_info).call("create_render_pass")?;

        Ok(Self {
            handle,
            render_area,
            clear_color,
            depth,
            stencil,
        })
    }

    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        if self.handle != vk::RenderPass::null() {
            api.destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
    }

    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
    }

    /// In attachment order.
    pub fn clear_values(&self) -> [vk::ClearValue; ATTACHMENT_COUNT] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color.to_array(),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: self.stencil,
                },
            },
        ]
    }

    pub fn begin<D: DeviceApi>(&self, api: &D, cmd: &mut CommandBuffer, framebuffer: vk::Framebuffer) {
        let clears = self.clear_values();
        assert_eq!(clears.len(), ATTACHMENT_COUNT, "one clear value per attachment");
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(self.render_area)
            .clear_values(&clears);
        api.cmd_begin_render_pass(cmd.handle, &info);
        cmd.mark_in_render_pass();
    }

    pub fn end<D: DeviceApi>(&self, api: &D, cmd: &mut CommandBuffer) {
        api.cmd_end_render_pass(cmd.handle);
        cmd.mark_render_pass_ended();
    }
}
