use std::path::PathBuf;

use ffmpeg_next::format::Pixel;
use thiserror::Error;

use crate::format::DrmFourcc;

/// Errors raised while capturing and converting frames.
///
/// Everything except [`Error::SourceRead`] is setup-fatal: the failed
/// construction has already released whatever it acquired and the same inputs
/// should not be retried. A read failure is transient and is handled by
/// tearing down the source/pipeline pair and reopening on a later tick.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),

    #[error("filter {0} is not available")]
    MissingFilter(&'static str),

    #[error("failed to build filter graph: {0}")]
    Graph(#[from] ffmpeg_next::Error),

    #[error("failed to open capture device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        source: ffmpeg_next::Error,
    },

    #[error("capture source has no {0} hardware context")]
    MissingHwContext(&'static str),

    #[error("frame {got:?} does not match pipeline {expected:?}")]
    FrameMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("frame format {got:?} does not match pipeline {}", .expected.name())]
    FormatMismatch {
        expected: DrmFourcc,
        got: Pixel,
    },

    #[error("conversion failed: {0}")]
    Convert(ffmpeg_next::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("filter pipeline has been torn down")]
    PipelineGone,

    #[error("frame has already been released")]
    Released,

    #[error("failed to read frame: {0}")]
    SourceRead(ffmpeg_next::Error),
}

impl Error {
    /// Whether the capture loop should rebuild and try again on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SourceRead(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
