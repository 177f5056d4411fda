// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use tracing::{error, warn};

use crate::api::DeviceApi;
use crate::error::{CallContext, VkError, VkResultOf};

/// A native fence plus a CPU-side mirror of its signaled state, so waits on an
/// already signaled fence skip the driver call.
#[derive(Debug)]
pub struct Fence {
    pub handle: vk::Fence,
    is_signaled: bool,
}

impl Fence {
    pub fn create<D: DeviceApi>(api: &D, signaled: bool) -> VkResultOf<Self> {
        let handle = api.create_fence(signaled).call("create_fence")?;
        Ok(Self {
            handle,
            is_signaled: signaled,
        })
    }

    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        if self.handle != vk::Fence::null() {
            api.destroy_fence(self.handle);
            self.handle = vk::Fence::null();
        }
        self.is_signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.is_signaled
    }

    /// `Ok(true)` once signaled, `Ok(false)` on timeout. Any other failure
    /// (device lost, out of memory) is fatal.
    pub fn wait<D: DeviceApi>(&mut self, api: &D, timeout_ns: u64) -> VkResultOf<bool> {
        if self.is_signaled {
            return Ok(true);
        }
        match api.wait_for_fences(&[self.handle], timeout_ns) {
            Ok(()) => {
                self.is_signaled = true;
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => {
                warn!("vk: fence wait timed out after {timeout_ns} ns");
                Ok(false)
            }
            Err(result) => {
                error!("vk: fence wait failed: {result}");
                Err(VkError::Vulkan {
                    call: "wait_for_fences",
                    result,
                })
            }
        }
    }

    /// Unsignals the fence. No-op when it is already unsignaled.
    pub fn reset<D: DeviceApi>(&mut self, api: &D) -> VkResultOf<()> {
        if self.is_signaled {
            api.reset_fences(&[self.handle]).call("reset_fences")?;
            self.is_signaled = false;
        }
        Ok(())
    }
}
