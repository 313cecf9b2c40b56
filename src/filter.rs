use std::ffi::{c_int, c_void, CStr};

use ffmpeg_next::{
    ffi::{
        av_buffersrc_add_frame_flags, av_buffersrc_parameters_alloc, av_buffersrc_parameters_set,
        av_free, av_get_padded_bits_per_pixel, av_get_pix_fmt_name, av_pix_fmt_desc_get,
        AVHWFramesContext, AVPixelFormat,
    },
    filter::{self, Graph},
    format::Pixel,
    frame,
};
use ffmpeg_sys_next::{av_image_copy_to_buffer, av_image_get_buffer_size, av_image_get_linesize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::{self, DrmFourcc};
use crate::hw::HwContext;

/// `AV_BUFFERSRC_FLAG_KEEP_REF`, declared in an anonymous enum that the
/// bindings turn into an unnamed Rust enum.
const BUFFERSRC_FLAG_KEEP_REF: c_int = 8;

/// Turns one GPU frame into CPU-addressable pixels.
pub trait Convert {
    fn convert(&mut self, frame: &frame::Video) -> Result<PackedFrame>;
}

/// A single-plane packed image in system memory, rows without padding.
#[derive(Debug)]
pub struct PackedFrame {
    data: Vec<u8>,
    format: Pixel,
    width: u32,
    height: u32,
    stride: u32,
}

impl PackedFrame {
    pub fn new(data: Vec<u8>, format: Pixel, width: u32, height: u32, stride: u32) -> Self {
        Self {
            data,
            format,
            width,
            height,
            stride,
        }
    }

    /// Copies a system-memory frame into a tightly packed buffer.
    ///
    /// The buffer is only returned once the whole image has been copied.
    pub fn copy_from(frame: &frame::Video) -> Result<Self> {
        let format: AVPixelFormat = frame.format().into();
        let width = frame.width() as c_int;
        let height = frame.height() as c_int;

        let size = unsafe { av_image_get_buffer_size(format, width, height, 1) };
        if size < 0 {
            return Err(Error::Convert(size.into()));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size as usize)
            .map_err(|_| Error::OutOfMemory)?;
        data.resize(size as usize, 0);

        let r = unsafe {
            let raw = &*frame.as_ptr();
            av_image_copy_to_buffer(
                data.as_mut_ptr(),
                size,
                raw.data.as_ptr() as *const *const u8,
                raw.linesize.as_ptr(),
                format,
                width,
                height,
                1,
            )
        };
        if r < 0 {
            return Err(Error::Convert(r.into()));
        }

        // single planar format
        let (linesize, bits) = unsafe {
            (
                av_image_get_linesize(format, width, 0),
                av_get_padded_bits_per_pixel(av_pix_fmt_desc_get(format)),
            )
        };
        let bytes_per_pixel = bits / 8;
        if linesize <= 0 || bytes_per_pixel <= 0 {
            return Err(Error::Convert(ffmpeg_next::Error::InvalidData));
        }

        Ok(Self {
            data,
            format: frame.format(),
            width: frame.width(),
            height: frame.height(),
            stride: (linesize / bytes_per_pixel) as u32,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> Pixel {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in pixels.
    pub fn stride(&self) -> u32 {
        self.stride
    }
}

/// VAAPI-backed conversion from DRM-PRIME frames to packed RGB.
///
/// The graph is `buffer -> hwmap -> hwdownload -> format -> buffersink`. It is
/// built for a fixed geometry and source format; a new capture source needs a
/// new pipeline.
pub struct FilterPipeline {
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
    graph: Graph,
    _hw_device: HwContext,
    _hw_frames: HwContext,
}

impl FilterPipeline {
    pub fn new(
        width: u32,
        height: u32,
        fourcc: u32,
        hw_device: &HwContext,
        hw_frames: &HwContext,
    ) -> Result<Self> {
        // Nothing is allocated for a format we cannot convert.
        let fourcc = format::resolve(fourcc)?;
        let output = fourcc.packed_format();

        let hw_device = hw_device.clone();
        let hw_frames = hw_frames.clone();
        let graph = Self::build_graph(width, height, output, &hw_device, &hw_frames)?;

        debug!(
            "created filter pipeline {}x{} {} -> {}",
            width,
            height,
            fourcc.name(),
            pixel_name(output)
        );

        Ok(Self {
            width,
            height,
            fourcc,
            graph,
            _hw_device: hw_device,
            _hw_frames: hw_frames,
        })
    }

    fn build_graph(
        width: u32,
        height: u32,
        output: Pixel,
        hw_device: &HwContext,
        hw_frames: &HwContext,
    ) -> Result<Graph> {
        let mut graph = Graph::new();

        let buffer = filter::find("buffer").ok_or(Error::MissingFilter("buffer"))?;
        let buffer_sink =
            filter::find("buffersink").ok_or(Error::MissingFilter("buffersink"))?;

        // Placeholder geometry satisfies the argument check, the real values
        // go in through the parameters below.
        let mut source = graph.add(
            &buffer,
            "in",
            "width=1:height=1:pix_fmt=drm_prime:time_base=1/1",
        )?;
        unsafe {
            let params = av_buffersrc_parameters_alloc();
            if params.is_null() {
                return Err(Error::OutOfMemory);
            }
            (*params).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
            (*params).width = width as c_int;
            (*params).height = height as c_int;
            // buffersrc takes its own reference.
            (*params).hw_frames_ctx = hw_frames.as_ptr();

            let r = av_buffersrc_parameters_set(source.as_mut_ptr(), params);
            av_free(params as *mut c_void);
            if r < 0 {
                return Err(Error::Graph(r.into()));
            }
        }

        graph.add(&buffer_sink, "out", "")?;

        let spec = format!(
            "hwmap=mode=direct:derive_device=vaapi,hwdownload,format=pix_fmts={}",
            pixel_name(output)
        );
        graph.output("in", 0)?.input("out", 0)?.parse(&spec)?;

        unsafe {
            let raw = &mut *graph.as_mut_ptr();
            for i in 0..raw.nb_filters as usize {
                let ctx = *raw.filters.add(i);
                (*ctx).hw_device_ctx = hw_device.new_ref();
            }
        }

        graph.validate()?;

        Ok(graph)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Convert for FilterPipeline {
    fn convert(&mut self, frame: &frame::Video) -> Result<PackedFrame> {
        check_frame(frame, self.dimensions(), self.fourcc)?;

        let mut source = self.graph.get("in").ok_or(Error::MissingFilter("buffer"))?;
        // KEEP_REF leaves the caller's frame intact.
        let r = unsafe {
            av_buffersrc_add_frame_flags(
                source.as_mut_ptr(),
                frame.as_ptr() as *mut _,
                BUFFERSRC_FLAG_KEEP_REF,
            )
        };
        if r < 0 {
            return Err(Error::Convert(r.into()));
        }

        let mut filtered = frame::Video::empty();
        self.graph
            .get("out")
            .ok_or(Error::MissingFilter("buffersink"))?
            .sink()
            .frame(&mut filtered)
            .map_err(Error::Convert)?;

        PackedFrame::copy_from(&filtered)
    }
}

/// A frame fits a pipeline when it is a DRM-PRIME frame of the configured
/// size from a pool whose software format is the pipeline's source format.
fn check_frame(frame: &frame::Video, dimensions: (u32, u32), fourcc: DrmFourcc) -> Result<()> {
    if frame.format() != Pixel::DRM_PRIME {
        return Err(Error::FormatMismatch {
            expected: fourcc,
            got: frame.format(),
        });
    }

    let got = (frame.width(), frame.height());
    if got != dimensions {
        return Err(Error::FrameMismatch {
            expected: dimensions,
            got,
        });
    }

    let sw_format = unsafe {
        let frames = (*frame.as_ptr()).hw_frames_ctx;
        if frames.is_null() {
            return Err(Error::MissingHwContext("frame pool"));
        }
        Pixel::from((*((*frames).data as *const AVHWFramesContext)).sw_format)
    };
    if DrmFourcc::from_sw_format(sw_format) != Some(fourcc) {
        return Err(Error::FormatMismatch {
            expected: fourcc,
            got: sw_format,
        });
    }
    Ok(())
}

fn pixel_name(format: Pixel) -> String {
    unsafe {
        let name = av_get_pix_fmt_name(format.into());
        if name.is_null() {
            return String::from("none");
        }
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}
