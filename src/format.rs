//! DRM fourcc handling and the packed output format policy.
//!
//! Only the 4-channel, 8-bit layouts with an alpha or padding byte are
//! supported. Each one is downloaded into the packed format that keeps the
//! colour bytes in the same order and the pad byte in the same position as
//! the source, so the consumer can address pixels without a swizzle.

use ffmpeg_next::format::Pixel;

use crate::error::{Error, Result};

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const DRM_FORMAT_INVALID: u32 = 0;

/// Modifier reported when the source does not know the buffer layout.
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrmFourcc {
    Xrgb8888,
    Argb8888,
    Xbgr8888,
    Abgr8888,
    Rgbx8888,
    Rgba8888,
    Bgrx8888,
    Bgra8888,
}

impl DrmFourcc {
    pub const ALL: [DrmFourcc; 8] = [
        DrmFourcc::Xrgb8888,
        DrmFourcc::Argb8888,
        DrmFourcc::Xbgr8888,
        DrmFourcc::Abgr8888,
        DrmFourcc::Rgbx8888,
        DrmFourcc::Rgba8888,
        DrmFourcc::Bgrx8888,
        DrmFourcc::Bgra8888,
    ];

    pub const fn code(self) -> u32 {
        match self {
            DrmFourcc::Xrgb8888 => fourcc(b"XR24"),
            DrmFourcc::Argb8888 => fourcc(b"AR24"),
            DrmFourcc::Xbgr8888 => fourcc(b"XB24"),
            DrmFourcc::Abgr8888 => fourcc(b"AB24"),
            DrmFourcc::Rgbx8888 => fourcc(b"RX24"),
            DrmFourcc::Rgba8888 => fourcc(b"RA24"),
            DrmFourcc::Bgrx8888 => fourcc(b"BX24"),
            DrmFourcc::Bgra8888 => fourcc(b"BA24"),
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Output layout the converted frame is downloaded into.
    pub const fn packed_format(self) -> Pixel {
        match self {
            DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 => Pixel::BGRZ,
            DrmFourcc::Xbgr8888 | DrmFourcc::Abgr8888 => Pixel::RGBZ,
            DrmFourcc::Rgbx8888 | DrmFourcc::Rgba8888 => Pixel::ZBGR,
            DrmFourcc::Bgrx8888 | DrmFourcc::Bgra8888 => Pixel::ZRGB,
        }
    }

    /// Maps the software format of a KMS hardware frame pool back to the
    /// fourcc of the scanout buffer it was created from.
    pub fn from_sw_format(format: Pixel) -> Option<Self> {
        Some(match format {
            Pixel::BGRZ => DrmFourcc::Xrgb8888,
            Pixel::BGRA => DrmFourcc::Argb8888,
            Pixel::RGBZ => DrmFourcc::Xbgr8888,
            Pixel::RGBA => DrmFourcc::Abgr8888,
            Pixel::ZBGR => DrmFourcc::Rgbx8888,
            Pixel::ABGR => DrmFourcc::Rgba8888,
            Pixel::ZRGB => DrmFourcc::Bgrx8888,
            Pixel::ARGB => DrmFourcc::Bgra8888,
            _ => return None,
        })
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        4
    }

    pub fn name(self) -> String {
        self.code().to_le_bytes().iter().map(|b| *b as char).collect()
    }
}

/// Resolves a raw fourcc to a supported format, or fails without side
/// effects.
pub fn resolve(code: u32) -> Result<DrmFourcc> {
    DrmFourcc::from_code(code).ok_or(Error::UnsupportedFormat(code))
}
