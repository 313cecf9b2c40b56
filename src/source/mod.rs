use std::fs;
use std::path::{Path, PathBuf};

use ffmpeg_next::frame;

use crate::error::Result;
use crate::hw::HwContext;

pub mod kmsgrab;

pub const DEFAULT_DEVICE_DIR: &str = "/dev/dri";
pub const FALLBACK_DEVICE: &str = "/dev/dri/card0";

/// What a capture source negotiated when it was opened.
#[derive(Debug)]
pub struct SourceInfo {
    pub device_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc of the scanout buffer, [`DRM_FORMAT_INVALID`](crate::format::DRM_FORMAT_INVALID) if unknown.
    pub fourcc: u32,
    pub modifier: u64,
    pub hw_device: HwContext,
    pub hw_frames: HwContext,
}

/// A display capture device yielding one GPU frame per read.
///
/// Closing is dropping.
pub trait FrameSource {
    fn info(&self) -> &SourceInfo;

    fn read_frame(&mut self) -> Result<frame::Video>;
}

/// Finds the lowest numbered DRM primary node (`cardN`) in `dir`.
pub fn discover_primary_node(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let index = entry
                .file_name()
                .to_str()?
                .strip_prefix("card")?
                .parse::<u32>()
                .ok()?;
            Some((index, entry.path()))
        })
        .min_by_key(|(index, _)| *index)
        .map(|(_, path)| path)
}
