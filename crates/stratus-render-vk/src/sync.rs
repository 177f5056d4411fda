// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use tracing::debug;

use crate::api::DeviceApi;
use crate::error::{CallContext, VkResultOf};
use crate::fence::Fence;

/// Per-frame-in-flight synchronization.
///
/// `images_in_flight[i]` names the slot in `in_flight` whose submission last
/// used swapchain image `i`, if any.
#[derive(Debug, Default)]
pub struct FrameSync {
    pub image_available: Vec<vk::Semaphore>,
    pub queue_complete: Vec<vk::Semaphore>,
    pub in_flight: Vec<Fence>,
    pub images_in_flight: Vec<Option<usize>>,
    pub current_frame: usize,
}

impl FrameSync {
    pub fn create<D: DeviceApi>(api: &D, frames: usize, image_count: usize) -> VkResultOf<Self> {
        let mut sync = FrameSync {
            images_in_flight: vec![None; image_count],
            ..Default::default()
        };
        if let Err(e) = sync.build(api, frames) {
            sync.destroy(api);
            return Err(e);
        }
        debug!("vk: sync objects for {frames} frames, {image_count} images");
        Ok(sync)
    }

    fn build<D: DeviceApi>(&mut self, api: &D, frames: usize) -> VkResultOf<()> {
        for _ in 0..frames {
            self.image_available
                .push(api.create_semaphore().call("create_semaphore")?);
            self.queue_complete
                .push(api.create_semaphore().call("create_semaphore")?);
            // Signaled so the first wait on each slot returns at once.
            self.in_flight.push(Fence::create(api, true)?);
        }
        Ok(())
    }

    pub fn destroy<D: DeviceApi>(&mut self, api: &D) {
        for s in self.image_available.drain(..) {
            api.destroy_semaphore(s);
        }
        for s in self.queue_complete.drain(..) {
            api.destroy_semaphore(s);
        }
        for mut f in self.in_flight.drain(..) {
            f.destroy(api);
        }
        self.images_in_flight.clear();
        self.current_frame = 0;
    }

    pub fn frames(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget every image→fence link, sized for a fresh swapchain.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Waits on the fence that last guarded `image`. `Ok(false)` on timeout.
    pub fn wait_for_image<D: DeviceApi>(&mut self, api: &D, image: usize, timeout_ns: u64) -> VkResultOf<bool> {
        match self.images_in_flight.get(image).copied().flatten() {
            Some(slot) => self.in_flight[slot].wait(api, timeout_ns),
            None => Ok(true),
        }
    }

    /// Records that the current slot now guards `image`.
    pub fn claim_image(&mut self, image: usize) {
        self.images_in_flight[image] = Some(self.current_frame);
    }

    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frames().max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    #[test]
    fn current_frame_cycles_through_slots() {
        let api = MockDevice::new();
        let mut sync = FrameSync::create(&api, 2, 3).unwrap();
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                let f = sync.current_frame;
                sync.advance();
                f
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
        sync.destroy(&api);
        assert_eq!(api.live_count(), 0);
    }

    #[test]
    fn image_wait_targets_the_claiming_slot() {
        let api = MockDevice::new();
        let mut sync = FrameSync::create(&api, 2, 3).unwrap();
        assert!(sync.wait_for_image(&api, 0, u64::MAX).unwrap());
        assert_eq!(api.count("wait_for_fences"), 0);

        sync.claim_image(0);
        sync.in_flight[0].reset(&api).unwrap();
        sync.advance();
        assert!(sync.wait_for_image(&api, 0, u64::MAX).unwrap());
        assert_eq!(api.fences_waited(), vec![vec![sync.in_flight[0].handle]]);

        sync.reset_images(4);
        assert_eq!(sync.images_in_flight, vec![None; 4]);
    }
}
