// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Failures of the Vulkan frame pipeline.
///
/// Stale surfaces and fence timeouts are not errors; they surface as skipped
/// frames. Everything here is fatal for the backend.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("no physical device meets the renderer requirements")]
    NoSuitableDevice,

    #[error("none of the candidate depth formats is supported")]
    DepthFormatNotFound,

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("no memory type matches filter {type_filter:#b} with {flags:?}")]
    NoMemoryType {
        type_filter: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

pub type VkResultOf<T> = std::result::Result<T, VkError>;

/// Tags a raw `VkResult` with the name of the call that produced it.
pub(crate) trait CallContext<T> {
    fn call(self, call: &'static str) -> VkResultOf<T>;
}

impl<T> CallContext<T> for ash::prelude::VkResult<T> {
    fn call(self, call: &'static str) -> VkResultOf<T> {
        self.map_err(|result| VkError::Vulkan { call, result })
    }
}

impl VkError {
    pub fn result(&self) -> Option<vk::Result> {
        match self {
            VkError::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}
