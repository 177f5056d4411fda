// SPDX-License-Identifier: CEPL-1.0
//! Command buffers with an explicit CPU-side state machine.
//!
//! ```text
//! NotAllocated -> Ready -> Recording <-> InRenderPass
//!                   ^         |
//!                   |         v
//!                 (reset) RecordingEnded -> Submitted
//! ```
use ash::vk;
use bitflags::bitflags;

use crate::api::DeviceApi;
use crate::error::{CallContext, VkResultOf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    NotAllocated,
    Ready,
    Recording,
    InRenderPass,
    RecordingEnded,
    Submitted,
}

bitflags! {
    /// Usage hints passed to `begin`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CommandBufferUsage: u32 {
        const SINGLE_USE = 1 << 0;
        const RENDERPASS_CONTINUE = 1 << 1;
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

impl CommandBufferUsage {
    pub fn to_vk(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.contains(Self::SINGLE_USE) {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.contains(Self::RENDERPASS_CONTINUE) {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.contains(Self::SIMULTANEOUS_USE) {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

#[derive(Debug)]
pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self {
            handle: vk::CommandBuffer::null(),
            state: CommandBufferState::NotAllocated,
        }
    }
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn allocate<D: DeviceApi>(api: &D, pool: vk::CommandPool, primary: bool) -> VkResultOf<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: if primary {
                vk::CommandBufferLevel::PRIMARY
            } else {
                vk::CommandBufferLevel::SECONDARY
            },
            command_buffer_count: 1,
            ..Default::default()
        };
        let handle = api
            .allocate_command_buffers(&alloc_info)
            .call("allocate_command_buffers")?
            .first()
            .copied()
            .unwrap_or_default();
        Ok(Self {
            handle,
            state: CommandBufferState::Ready,
        })
    }

    pub fn free<D: DeviceApi>(&mut self, api: &D, pool: vk::CommandPool) {
        if self.handle != vk::CommandBuffer::null() {
            api.free_command_buffers(pool, &[self.handle]);
        }
        self.handle = vk::CommandBuffer::null();
        self.state = CommandBufferState::NotAllocated;
    }

    pub fn begin<D: DeviceApi>(&mut self, api: &D, usage: CommandBufferUsage) -> VkResultOf<()> {
        debug_assert_eq!(self.state, CommandBufferState::Ready, "begin on {:?}", self.state);
        let info = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: usage.to_vk(),
            ..Default::default()
        };
        api.begin_command_buffer(self.handle, &info)
            .call("begin_command_buffer")?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end<D: DeviceApi>(&mut self, api: &D) -> VkResultOf<()> {
        debug_assert_eq!(self.state, CommandBufferState::Recording, "end on {:?}", self.state);
        api.end_command_buffer(self.handle)
            .call("end_command_buffer")?;
        self.state = CommandBufferState::RecordingEnded;
        Ok(())
    }

    /// Returns the buffer to `Ready`. The pool allows per-buffer resets.
    pub fn reset<D: DeviceApi>(&mut self, api: &D) -> VkResultOf<()> {
        debug_assert_ne!(self.state, CommandBufferState::NotAllocated);
        if self.state != CommandBufferState::Ready {
            api.reset_command_buffer(self.handle)
                .call("reset_command_buffer")?;
        }
        self.state = CommandBufferState::Ready;
        Ok(())
    }

    pub fn mark_in_render_pass(&mut self) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        self.state = CommandBufferState::InRenderPass;
    }

    pub fn mark_render_pass_ended(&mut self) {
        debug_assert_eq!(self.state, CommandBufferState::InRenderPass);
        self.state = CommandBufferState::Recording;
    }

    pub fn mark_submitted(&mut self) {
        debug_assert_eq!(self.state, CommandBufferState::RecordingEnded);
        self.state = CommandBufferState::Submitted;
    }

    /// Allocate a primary buffer and begin it for a single submission.
    pub fn allocate_begin_single_use<D: DeviceApi>(api: &D, pool: vk::CommandPool) -> VkResultOf<Self> {
        let mut cmd = Self::allocate(api, pool, true)?;
        if let Err(e) = cmd.begin(api, CommandBufferUsage::SINGLE_USE) {
            cmd.free(api, pool);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End, submit, wait for the queue to drain, then free. Fully synchronous.
    pub fn end_single_use<D: DeviceApi>(
        mut self,
        api: &D,
        pool: vk::CommandPool,
        queue: vk::Queue,
    ) -> VkResultOf<()> {
        let result = self.submit_and_wait(api, queue);
        self.free(api, pool);
        result
    }

    fn submit_and_wait<D: DeviceApi>(&mut self, api: &D, queue: vk::Queue) -> VkResultOf<()> {
        self.end(api)?;
        let cmds = [self.handle];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        api.queue_submit(queue, std::slice::from_ref(&submit), vk::Fence::null())
            .call("queue_submit")?;
        self.mark_submitted();
        api.queue_wait_idle(queue).call("queue_wait_idle")
    }
}

/// One primary buffer per swapchain image.
pub fn allocate_per_image<D: DeviceApi>(
    api: &D,
    pool: vk::CommandPool,
    count: usize,
) -> VkResultOf<Vec<CommandBuffer>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        match CommandBuffer::allocate(api, pool, true) {
            Ok(cmd) => out.push(cmd),
            Err(e) => {
                for cmd in &mut out {
                    cmd.free(api, pool);
                }
                return Err(e);
            }
        }
    }
    Ok(out)
}

pub fn create_pool<D: DeviceApi>(api: &D, queue_family: u32) -> VkResultOf<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        queue_family_index: queue_family,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        ..Default::default()
    };
    api.create_command_pool(&pool_info).call("create_command_pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn pool(api: &MockDevice) -> vk::CommandPool {
        create_pool(api, 0).unwrap()
    }

    #[test]
    fn full_cycle_walks_every_state() {
        let api = MockDevice::new();
        let pool = pool(&api);
        let mut cmd = CommandBuffer::allocate(&api, pool, true).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Ready);

        cmd.begin(&api, CommandBufferUsage::empty()).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        cmd.mark_in_render_pass();
        assert_eq!(cmd.state(), CommandBufferState::InRenderPass);
        cmd.mark_render_pass_ended();
        cmd.end(&api).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::RecordingEnded);
        cmd.mark_submitted();
        assert_eq!(cmd.state(), CommandBufferState::Submitted);

        cmd.reset(&api).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Ready);
        assert_eq!(api.count("reset_command_buffer"), 1);

        cmd.free(&api, pool);
        assert_eq!(cmd.state(), CommandBufferState::NotAllocated);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn render_pass_requires_recording() {
        let api = MockDevice::new();
        let pool = pool(&api);
        let mut cmd = CommandBuffer::allocate(&api, pool, true).unwrap();
        cmd.mark_in_render_pass();
    }

    #[test]
    fn usage_hints_map_to_vulkan_flags() {
        let u = CommandBufferUsage::SINGLE_USE | CommandBufferUsage::SIMULTANEOUS_USE;
        assert_eq!(
            u.to_vk(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        );
        assert!(CommandBufferUsage::empty().to_vk().is_empty());
    }

    #[test]
    fn single_use_submits_waits_and_frees() {
        let api = MockDevice::new();
        let pool = pool(&api);
        let cmd = CommandBuffer::allocate_begin_single_use(&api, pool).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        cmd.end_single_use(&api, pool, vk::Queue::null()).unwrap();

        assert_eq!(api.count("queue_submit"), 1);
        assert_eq!(api.count("queue_wait_idle"), 1);
        assert_eq!(api.count("free_command_buffers"), 1);
        // Only the pool remains.
        assert_eq!(api.live_count(), 1);
    }

    #[test]
    fn single_use_frees_even_when_submit_fails() {
        let api = MockDevice::new();
        let pool = pool(&api);
        api.script_submit(Err(vk::Result::ERROR_DEVICE_LOST));
        let cmd = CommandBuffer::allocate_begin_single_use(&api, pool).unwrap();
        assert!(cmd.end_single_use(&api, pool, vk::Queue::null()).is_err());
        assert_eq!(api.live_count(), 1);
    }
}
