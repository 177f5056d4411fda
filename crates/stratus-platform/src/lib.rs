// SPDX-License-Identifier: CEPL-1.0
//! Window and event-loop layer. The app only talks to winit through here.
pub use winit;

use winit::dpi::PhysicalSize;

/// True when the surface has no drawable area (minimized window).
pub fn is_zero_sized(size: PhysicalSize<u32>) -> bool {
    size.width == 0 || size.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimized_sizes_are_zero_sized() {
        assert!(is_zero_sized(PhysicalSize::new(0, 720)));
        assert!(is_zero_sized(PhysicalSize::new(1280, 0)));
        assert!(!is_zero_sized(PhysicalSize::new(1, 1)));
    }
}
