// SPDX-License-Identifier: CEPL-1.0
//! Physical device selection and logical device creation.
//!
//! Selection is split in two: [`describe_physical_device`] gathers what the
//! driver reports into a plain [`DeviceCandidate`], and [`select`] scores the
//! candidates without touching Vulkan.
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};

use ash::khr::swapchain;
use ash::vk;
use tracing::{debug, error, info, trace};

use crate::error::{CallContext, VkError, VkResultOf};
use crate::instance::InstanceContext;
use crate::swapchain::SwapchainSupportInfo;

/// Tried in order; the first one usable as an optimal-tiling depth attachment
/// wins.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Clone, Debug)]
pub struct DeviceRequirements {
    pub compute: bool,
    pub sampler_anisotropy: bool,
    pub discrete_gpu: bool,
    pub extensions: Vec<&'static CStr>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            compute: false,
            sampler_anisotropy: true,
            discrete_gpu: true,
            extensions: vec![swapchain::NAME],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyCaps {
    pub flags: vk::QueueFlags,
    pub present: bool,
}

/// Everything selection needs to know about one GPU.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub families: Vec<QueueFamilyCaps>,
    pub extensions: Vec<CString>,
    pub format_count: usize,
    pub present_mode_count: usize,
    pub sampler_anisotropy: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FamilyScan {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
    pub compute: Option<u32>,
}

impl QueueFamilies {
    /// Unique graphics, present and transfer families: at most three queue
    /// create-infos. The compute family is reported but gets no queue.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present, self.transfer]
            .into_iter()
            .collect();
        set.into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotDiscrete,
    MissingQueue(&'static str),
    NoSwapchainSupport,
    MissingExtension(String),
    NoSamplerAnisotropy,
}

/// Picks queue families. Graphics prefers the first capable family, present
/// prefers sharing the graphics family, transfer prefers the family with the
/// fewest graphics/compute capabilities. On equal scores the later family wins.
pub fn scan_queue_families(families: &[QueueFamilyCaps]) -> FamilyScan {
    let mut scan = FamilyScan::default();
    let mut min_transfer_score = u8::MAX;

    for (i, fam) in families.iter().enumerate() {
        let i = i as u32;
        let mut transfer_score = 0u8;

        if fam.flags.contains(vk::QueueFlags::GRAPHICS) {
            scan.graphics.get_or_insert(i);
            transfer_score += 1;
        }
        if fam.flags.contains(vk::QueueFlags::COMPUTE) {
            scan.compute.get_or_insert(i);
            transfer_score += 1;
        }
        if fam.flags.contains(vk::QueueFlags::TRANSFER) && transfer_score <= min_transfer_score {
            min_transfer_score = transfer_score;
            scan.transfer = Some(i);
        }
        if fam.present {
            scan.present.get_or_insert(i);
        }
    }

    if let Some(g) = scan.graphics {
        if families[g as usize].present {
            scan.present = Some(g);
        }
    }
    scan
}

pub fn evaluate(
    candidate: &DeviceCandidate,
    reqs: &DeviceRequirements,
) -> Result<QueueFamilies, Rejection> {
    if reqs.discrete_gpu && candidate.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
        return Err(Rejection::NotDiscrete);
    }

    let scan = scan_queue_families(&candidate.families);
    let graphics = scan.graphics.ok_or(Rejection::MissingQueue("graphics"))?;
    let present = scan.present.ok_or(Rejection::MissingQueue("present"))?;
    let transfer = scan.transfer.ok_or(Rejection::MissingQueue("transfer"))?;
    if reqs.compute && scan.compute.is_none() {
        return Err(Rejection::MissingQueue("compute"));
    }

    if candidate.format_count == 0 || candidate.present_mode_count == 0 {
        return Err(Rejection::NoSwapchainSupport);
    }

    for ext in &reqs.extensions {
        if !candidate.extensions.iter().any(|e| e.as_c_str() == *ext) {
            return Err(Rejection::MissingExtension(ext.to_string_lossy().into_owned()));
        }
    }

    if reqs.sampler_anisotropy && !candidate.sampler_anisotropy {
        return Err(Rejection::NoSamplerAnisotropy);
    }

    Ok(QueueFamilies {
        graphics,
        present,
        transfer,
        compute: scan.compute,
    })
}

/// First candidate that meets `reqs`, with its queue families.
pub fn select(
    candidates: &[DeviceCandidate],
    reqs: &DeviceRequirements,
) -> VkResultOf<(usize, QueueFamilies)> {
    for (i, c) in candidates.iter().enumerate() {
        match evaluate(c, reqs) {
            Ok(families) => {
                info!("vk: device '{}' meets requirements", c.name);
                return Ok((i, families));
            }
            Err(why) => info!("vk: skipping device '{}': {why:?}", c.name),
        }
    }
    error!("vk: no physical device meets the requirements");
    Err(VkError::NoSuitableDevice)
}

/// First format in [`DEPTH_FORMAT_CANDIDATES`] usable as a depth attachment.
pub fn choose_depth_format(
    props: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&fmt| {
        let p = props(fmt);
        // Depth images are always created with optimal tiling.
        p.optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

pub fn find_memory_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory.memory_types[i as usize].property_flags.contains(flags)
    })
}

/// Queues and cached capabilities of the selected GPU.
#[derive(Clone, Debug)]
pub struct Device {
    pub physical: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub depth_format: vk::Format,
}

impl Device {
    pub fn find_memory_index(&self, type_filter: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        find_memory_index(&self.memory, type_filter, flags)
    }

    /// Images are shared between graphics and present when those differ.
    pub fn sharing_families(&self) -> Option<[u32; 2]> {
        (self.families.graphics != self.families.present)
            .then_some([self.families.graphics, self.families.present])
    }
}

/// Result of [`select_physical_device`], before a logical device exists.
pub struct SelectedDevice {
    pub physical: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub depth_format: vk::Format,
}

/// # Safety
/// `phys` must belong to `ctx.instance`.
pub unsafe fn describe_physical_device(
    ctx: &InstanceContext,
    phys: vk::PhysicalDevice,
) -> VkResultOf<DeviceCandidate> {
    let instance = &ctx.instance;
    let props = instance.get_physical_device_properties(phys);
    let features = instance.get_physical_device_features(phys);
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let mut families = Vec::new();
    for (i, q) in instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
    {
        let present = ctx
            .surface_loader
            .get_physical_device_surface_support(phys, i as u32, ctx.surface)
            .call("get_physical_device_surface_support")?;
        families.push(QueueFamilyCaps {
            flags: q.queue_flags,
            present,
        });
    }

    let extensions = instance
        .enumerate_device_extension_properties(phys)
        .call("enumerate_device_extension_properties")?
        .iter()
        .map(|e| CStr::from_ptr(e.extension_name.as_ptr()).to_owned())
        .collect();

    let support = SwapchainSupportInfo::query(&ctx.surface_loader, phys, ctx.surface)
        .call("query_swapchain_support")?;

    Ok(DeviceCandidate {
        name,
        device_type: props.device_type,
        families,
        extensions,
        format_count: support.formats.len(),
        present_mode_count: support.present_modes.len(),
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
    })
}

fn log_queue_table(c: &DeviceCandidate) {
    let scan = scan_queue_families(&c.families);
    info!("Graphics | Present | Compute | Transfer | Name");
    info!(
        "{:>8} | {:>7} | {:>7} | {:>8} | {}",
        scan.graphics.is_some() as u8,
        scan.present.is_some() as u8,
        scan.compute.is_some() as u8,
        scan.transfer.is_some() as u8,
        c.name
    );
    trace!("vk: family scan {scan:?}");
}

fn log_device_report(
    props: &vk::PhysicalDeviceProperties,
    memory: &vk::PhysicalDeviceMemoryProperties,
) {
    let name = props.device_name_as_c_str().map(|s| s.to_string_lossy().into_owned());
    info!("vk: selected device {}", name.unwrap_or_default());
    match props.device_type {
        vk::PhysicalDeviceType::INTEGRATED_GPU => info!("GPU is integrated"),
        vk::PhysicalDeviceType::DISCRETE_GPU => info!("GPU is discrete"),
        vk::PhysicalDeviceType::VIRTUAL_GPU => info!("GPU is virtual"),
        vk::PhysicalDeviceType::CPU => info!("GPU is CPU"),
        _ => info!("GPU type is unknown"),
    }
    info!(
        "GPU driver version {}.{}.{}",
        vk::api_version_major(props.driver_version),
        vk::api_version_minor(props.driver_version),
        vk::api_version_patch(props.driver_version)
    );
    info!(
        "Vulkan API version {}.{}.{}",
        vk::api_version_major(props.api_version),
        vk::api_version_minor(props.api_version),
        vk::api_version_patch(props.api_version)
    );
    for heap in &memory.memory_heaps[..memory.memory_heap_count as usize] {
        let gib = heap.size as f64 / (1024.0 * 1024.0 * 1024.0);
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            info!("Local GPU memory: {gib:.2} GiB");
        } else {
            info!("Shared system memory: {gib:.2} GiB");
        }
    }
}

/// # Safety
/// `ctx` must hold a live instance and surface.
pub unsafe fn select_physical_device(
    ctx: &InstanceContext,
    reqs: &DeviceRequirements,
) -> VkResultOf<SelectedDevice> {
    let physicals = ctx
        .instance
        .enumerate_physical_devices()
        .call("enumerate_physical_devices")?;
    if physicals.is_empty() {
        error!("vk: no devices with Vulkan support");
        return Err(VkError::NoSuitableDevice);
    }

    let mut candidates = Vec::with_capacity(physicals.len());
    for &phys in &physicals {
        let c = describe_physical_device(ctx, phys)?;
        log_queue_table(&c);
        candidates.push(c);
    }

    let (idx, families) = select(&candidates, reqs)?;
    let physical = physicals[idx];
    let properties = ctx.instance.get_physical_device_properties(physical);
    let features = ctx.instance.get_physical_device_features(physical);
    let memory = ctx.instance.get_physical_device_memory_properties(physical);
    log_device_report(&properties, &memory);

    let depth_format = choose_depth_format(|fmt| {
        ctx.instance
            .get_physical_device_format_properties(physical, fmt)
    })
    .ok_or_else(|| {
        error!("vk: failed to find a supported depth format");
        VkError::DepthFormatNotFound
    })?;
    debug!("vk: depth format {depth_format:?}");

    Ok(SelectedDevice {
        physical,
        families,
        properties,
        features,
        memory,
        depth_format,
    })
}

/// # Safety
/// `selected` must come from [`select_physical_device`] on the same `ctx`.
pub unsafe fn create_logical_device(
    ctx: &InstanceContext,
    selected: &SelectedDevice,
    reqs: &DeviceRequirements,
) -> VkResultOf<(ash::Device, Device)> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = selected
        .families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let enabled = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: if reqs.sampler_anisotropy { vk::TRUE } else { vk::FALSE },
        ..Default::default()
    };
    let extensions: Vec<*const std::ffi::c_char> =
        reqs.extensions.iter().map(|e| e.as_ptr()).collect();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_features(&enabled)
        .enabled_extension_names(&extensions);

    let raw = ctx
        .instance
        .create_device(selected.physical, &create_info, None)
        .call("create_device")?;

    let f = selected.families;
    let device = Device {
        physical: selected.physical,
        families: f,
        graphics_queue: raw.get_device_queue(f.graphics, 0),
        present_queue: raw.get_device_queue(f.present, 0),
        transfer_queue: raw.get_device_queue(f.transfer, 0),
        properties: selected.properties,
        features: selected.features,
        memory: selected.memory,
        depth_format: selected.depth_format,
    };
    info!(
        "vk: logical device created (graphics={}, present={}, transfer={})",
        f.graphics, f.present, f.transfer
    );
    Ok((raw, device))
}
