// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::api::DeviceApi;
use crate::device::Device;
use crate::error::{CallContext, VkError, VkResultOf};

#[derive(Clone, Copy, Debug)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// `Some` creates a view with this aspect.
    pub view_aspect: Option<vk::ImageAspectFlags>,
}

impl ImageSpec {
    pub fn depth_attachment(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            view_aspect: Some(vk::ImageAspectFlags::DEPTH),
        }
    }
}

/// A device image with its own memory and an optional view.
#[derive(Debug, Default)]
pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
}

pub fn create_view<D: DeviceApi>(
    api: &D,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> VkResultOf<vk::ImageView> {
    let sub = vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: sub,
        ..Default::default()
    };
    api.create_image_view(&view_ci).call("create_image_view")
}

impl Image {
    pub fn create<D: DeviceApi>(api: &D, device: &Device, spec: ImageSpec) -> VkResultOf<Self> {
        let mut image = Image {
            width: spec.width,
            height: spec.height,
            ..Default::default()
        };
        if let Err(e) = image.build(api, device, spec) {
            image.destroy(api);
            return Err(e);
        }
        Ok(image)
    }

    fn build<D: DeviceApi>(&mut self, api: &D, device: &Device, spec: ImageSpec) -> VkResultOf<()> {
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: spec.format,
            extent: vk::Extent3D {
                width: spec.width,
                height: spec.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: spec.tiling,
            usage: spec.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        self.handle = api.create_image(&img_ci).call("create_image")?;

        let req = api.image_memory_requirements(self.handle);
        let memory_type_index = device
            .find_memory_index(req.memory_type_bits, spec.memory_flags)
            .ok_or(VkError::NoMemoryType {
                type_filter: req.memory_type_bits,
                flags: spec.memory_flags,
            })?;
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        self.memory = api.allocate_memory(&alloc).call("allocate_memory")?;
        api.bind_image_memory(self.handle, self.memory, 0)
            .call("bind_image_memory")?;

        if let Some(aspect) = spec.view_aspect {
            self.view = create_view(api, self.handle, spec.format, aspect)?;
        }
        Ok(())
    }

    /// Safe to call on a partially built or already destroyed image.
    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        if self.view != vk::ImageView::null() {
            api.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        if self.memory != vk::DeviceMemory::null() {
            api.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
        if self.handle != vk::Image::null() {
            api.destroy_image(self.handle);
            self.handle = vk::Image::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_device, MockDevice};

    #[test]
    fn depth_image_gets_memory_and_view() {
        let api = MockDevice::new();
        let device = test_device();
        let mut img = Image::create(
            &api,
            &device,
            ImageSpec::depth_attachment(640, 480, device.depth_format),
        )
        .unwrap();
        assert_ne!(img.view, vk::ImageView::null());
        assert_eq!(api.live_count(), 3);

        img.destroy(&api);
        img.destroy(&api);
        assert_eq!(api.live_count(), 0);
        assert_eq!(img.handle, vk::Image::null());
    }

    #[test]
    fn missing_memory_type_cleans_up() {
        let api = MockDevice::new();
        let mut device = test_device();
        device.memory.memory_type_count = 0;
        let err = Image::create(&api, &device, ImageSpec::depth_attachment(8, 8, device.depth_format))
            .unwrap_err();
        assert!(matches!(err, VkError::NoMemoryType { .. }));
        assert_eq!(api.live_count(), 0);
    }
}
