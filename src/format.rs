//! Pixel formats carried by buffer descriptors.

/// Pixel formats (HAL numbering).
///
/// The discriminants are the values allocators write into the descriptor, so
/// they must not be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum PixelFormat {
    // ========================================================================
    // RGB formats
    // ========================================================================
    /// RGBA 8-bit per channel (32 bits/pixel).
    #[default]
    Rgba8888 = 0x1,
    /// RGBX 8-bit per channel, alpha ignored.
    Rgbx8888 = 0x2,
    /// RGB 8-bit per channel, packed (24 bits/pixel).
    Rgb888 = 0x3,
    /// RGB 5-6-5 (16 bits/pixel).
    Rgb565 = 0x4,
    /// BGRA 8-bit per channel.
    Bgra8888 = 0x5,

    // ========================================================================
    // YUV formats
    // ========================================================================
    /// YUV 4:2:2 semi-planar (NV16).
    YCbCr422Sp = 0x10,
    /// YUV 4:2:0 semi-planar, V before U (NV21). Camera preview default.
    YCrCb420Sp = 0x11,
    /// YUV 4:2:2 interleaved (YUY2).
    YCbCr422I = 0x14,
    /// Flexible YUV 4:2:0, realised here with the NV21 layout.
    YCbCr420_888 = 0x23,
    /// YUV 4:2:0 planar, V plane before U plane.
    Yv12 = 0x3231_5659,

    // ========================================================================
    // Opaque formats
    // ========================================================================
    /// 16-bit raw sensor data.
    Raw16 = 0x20,
    /// Unstructured bytes, width is the byte count.
    Blob = 0x21,
    /// Chosen by the allocator, layout unknown to this module.
    ImplementationDefined = 0x22,
}

impl PixelFormat {
    /// Decode a raw HAL format value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x1 => PixelFormat::Rgba8888,
            0x2 => PixelFormat::Rgbx8888,
            0x3 => PixelFormat::Rgb888,
            0x4 => PixelFormat::Rgb565,
            0x5 => PixelFormat::Bgra8888,
            0x10 => PixelFormat::YCbCr422Sp,
            0x11 => PixelFormat::YCrCb420Sp,
            0x14 => PixelFormat::YCbCr422I,
            0x23 => PixelFormat::YCbCr420_888,
            0x3231_5659 => PixelFormat::Yv12,
            0x20 => PixelFormat::Raw16,
            0x21 => PixelFormat::Blob,
            0x22 => PixelFormat::ImplementationDefined,
            _ => return None,
        })
    }

    /// Raw HAL value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether the planar lock path can describe this format.
    #[inline]
    pub const fn is_semi_planar_420(self) -> bool {
        matches!(self, PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420_888)
    }

    /// Layout known only to the allocator.
    #[inline]
    pub const fn is_opaque(self) -> bool {
        matches!(self, PixelFormat::Blob | PixelFormat::ImplementationDefined)
    }

    /// Minimum bytes one `width` x `height` frame occupies.
    ///
    /// Returns `None` for opaque formats, whose footprint only the allocator
    /// knows, and on arithmetic overflow.
    pub fn frame_bytes(self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let pixels = w.checked_mul(h)?;
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => {
                pixels.checked_mul(4)
            }
            PixelFormat::Rgb888 => pixels.checked_mul(3),
            PixelFormat::Rgb565
            | PixelFormat::YCbCr422Sp
            | PixelFormat::YCbCr422I
            | PixelFormat::Raw16 => pixels.checked_mul(2),
            // Full-width interleaved chroma rows, one per two luma rows
            PixelFormat::YCrCb420Sp | PixelFormat::YCbCr420_888 => {
                pixels.checked_add(w.checked_mul(h.div_ceil(2))?)
            }
            PixelFormat::Yv12 => pixels.checked_add(pixels.div_ceil(2)),
            PixelFormat::Blob | PixelFormat::ImplementationDefined => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values_roundtrip() {
        for format in [
            PixelFormat::Rgba8888,
            PixelFormat::YCrCb420Sp,
            PixelFormat::YCbCr420_888,
            PixelFormat::Yv12,
            PixelFormat::Blob,
        ] {
            assert_eq!(PixelFormat::from_raw(format.as_raw()), Some(format));
        }
        assert_eq!(PixelFormat::from_raw(0xdead), None);
    }

    #[test]
    fn test_frame_bytes() {
        assert_eq!(PixelFormat::Rgba8888.frame_bytes(1920, 1080), Some(8_294_400));
        assert_eq!(PixelFormat::Rgb565.frame_bytes(4, 4), Some(32));
        assert_eq!(PixelFormat::YCrCb420Sp.frame_bytes(640, 480), Some(460_800));
        assert_eq!(PixelFormat::YCrCb420Sp.frame_bytes(4, 3), Some(12 + 8));
        assert_eq!(PixelFormat::Blob.frame_bytes(100, 1), None);
        assert_eq!(PixelFormat::Rgba8888.frame_bytes(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_semi_planar() {
        assert!(PixelFormat::YCrCb420Sp.is_semi_planar_420());
        assert!(PixelFormat::YCbCr420_888.is_semi_planar_420());
        assert!(!PixelFormat::Yv12.is_semi_planar_420());
        assert!(!PixelFormat::Rgba8888.is_semi_planar_420());
        assert!(PixelFormat::Blob.is_opaque());
        assert!(!PixelFormat::Yv12.is_opaque());
    }
}
