//! Buffer usage flags.
//!
//! Bit values follow the Android gralloc usage ABI so that descriptors can be
//! exchanged with allocators and display devices written against it.

use bitflags::bitflags;

bitflags! {
    /// How a buffer is accessed by the CPU and by hardware consumers.
    ///
    /// Several constants are multi-bit masks (`SW_READ_MASK`, `HW_CAMERA_MASK`),
    /// so test them with [`Usage::intersects`] rather than `contains`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        /// Rare software reads.
        const SW_READ_RARELY = 0x0000_0002;
        /// Frequent software reads.
        const SW_READ_OFTEN = 0x0000_0003;
        /// Any software read.
        const SW_READ_MASK = 0x0000_000F;
        /// Rare software writes.
        const SW_WRITE_RARELY = 0x0000_0020;
        /// Frequent software writes.
        const SW_WRITE_OFTEN = 0x0000_0030;
        /// Any software write.
        const SW_WRITE_MASK = 0x0000_00F0;
        /// Sampled as a GPU texture.
        const HW_TEXTURE = 0x0000_0100;
        /// GPU render target.
        const HW_RENDER = 0x0000_0200;
        /// 2D blitter.
        const HW_2D = 0x0000_0400;
        /// Hardware composer overlay.
        const HW_COMPOSER = 0x0000_0800;
        /// Framebuffer memory.
        const HW_FB = 0x0000_1000;
        /// Routed to the external display.
        const EXTERNAL_DISP = 0x0000_2000;
        /// Protected content path.
        const PROTECTED = 0x0000_4000;
        /// Cursor plane.
        const CURSOR = 0x0000_8000;
        /// Video encoder input.
        const HW_VIDEO_ENCODER = 0x0001_0000;
        /// Camera HAL writes.
        const HW_CAMERA_WRITE = 0x0002_0000;
        /// Camera HAL reads.
        const HW_CAMERA_READ = 0x0004_0000;
        /// Camera zero-shutter-lag.
        const HW_CAMERA_ZSL = 0x0006_0000;
        /// Any camera access.
        const HW_CAMERA_MASK = 0x0006_0000;
    }
}

impl Usage {
    /// True when any software-read bit is set.
    #[inline]
    pub fn reads_cpu(self) -> bool {
        self.intersects(Usage::SW_READ_MASK)
    }

    /// True when any software-write bit is set.
    #[inline]
    pub fn writes_cpu(self) -> bool {
        self.intersects(Usage::SW_WRITE_MASK)
    }

    /// True when a lock with this usage should be handed the CPU address.
    ///
    /// Camera and video-encoder consumers read through the CPU mapping too;
    /// everything else is a pure GPU consumer.
    #[inline]
    pub fn wants_cpu_pointer(self) -> bool {
        self.reads_cpu()
            || self.writes_cpu()
            || self.intersects(Usage::HW_CAMERA_MASK)
            || self.contains(Usage::HW_VIDEO_ENCODER)
    }

    /// True when the buffer belongs to the external display output.
    #[inline]
    pub fn targets_external_display(self) -> bool {
        self.contains(Usage::EXTERNAL_DISP)
    }
}
