use std::ffi::c_char;
use std::path::Path;
use std::ptr;

use ffmpeg_next::{
    codec,
    decoder,
    ffi::{
        av_find_input_format, avformat_close_input, avformat_find_stream_info,
        avformat_open_input, AVHWFramesContext,
    },
    format::{self, Pixel},
    frame, media, Dictionary, Packet,
};
use tracing::debug;

use super::{FrameSource, SourceInfo};
use crate::error::{Error, Result};
use crate::format::{DrmFourcc, DRM_FORMAT_INVALID, DRM_FORMAT_MOD_INVALID};
use crate::hw::HwContext;

/// Scanout capture through libavdevice's `kmsgrab` input.
///
/// Every packet wraps a DRM-PRIME frame that references the scanout buffer
/// and the device's frame pool. Opening reads one frame to learn the
/// negotiated format and to pick up the hardware contexts; that frame is
/// handed out by the first `read_frame`.
pub struct KmsGrab {
    info: SourceInfo,
    pending: Option<frame::Video>,
    decoder: decoder::Video,
    stream_index: usize,
    input: format::context::Input,
}

impl KmsGrab {
    pub fn open(device: &Path, framerate: u32) -> Result<Self> {
        let open_error = |source| Error::DeviceOpen {
            path: device.to_path_buf(),
            source,
        };

        let mut input = open_input(device, framerate).map_err(open_error)?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| open_error(ffmpeg_next::Error::StreamNotFound))?;
        let stream_index = stream.index();
        let mut decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(open_error)?;

        let probe = decode_next(&mut input, &mut decoder, stream_index).map_err(|e| match e {
            Error::SourceRead(source) => open_error(source),
            e => e,
        })?;

        let (hw_device, hw_frames, sw_format) = unsafe {
            let hw_frames = HwContext::retain((*probe.as_ptr()).hw_frames_ctx)
                .ok_or(Error::MissingHwContext("frame pool"))?;
            let frames_ctx = &*((*hw_frames.as_ptr()).data as *const AVHWFramesContext);
            let hw_device = HwContext::retain(frames_ctx.device_ref)
                .ok_or(Error::MissingHwContext("device"))?;
            (hw_device, hw_frames, Pixel::from(frames_ctx.sw_format))
        };

        let fourcc = DrmFourcc::from_sw_format(sw_format)
            .map(DrmFourcc::code)
            .unwrap_or(DRM_FORMAT_INVALID);

        let info = SourceInfo {
            device_path: device.to_path_buf(),
            width: probe.width(),
            height: probe.height(),
            fourcc,
            modifier: DRM_FORMAT_MOD_INVALID,
            hw_device,
            hw_frames,
        };
        debug!(
            "opened {} {}x{} sw format {:?}",
            device.display(),
            info.width,
            info.height,
            sw_format
        );

        Ok(Self {
            info,
            pending: Some(probe),
            decoder,
            stream_index,
            input,
        })
    }
}

impl FrameSource for KmsGrab {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<frame::Video> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        decode_next(&mut self.input, &mut self.decoder, self.stream_index)
    }
}

impl Drop for KmsGrab {
    fn drop(&mut self) {
        debug!("closing {}", self.info.device_path.display());
    }
}

fn open_input(
    device: &Path,
    framerate: u32,
) -> std::result::Result<format::context::Input, ffmpeg_next::Error> {
    let mut options = Dictionary::new();
    options.set("device", &device.to_string_lossy());
    options.set("framerate", &framerate.to_string());

    unsafe {
        let kmsgrab = av_find_input_format(b"kmsgrab\0".as_ptr() as *const c_char);
        if kmsgrab.is_null() {
            return Err(ffmpeg_next::Error::DemuxerNotFound);
        }

        let mut ctx = ptr::null_mut();
        let mut opts = options.disown();
        let r = avformat_open_input(&mut ctx, b"-\0".as_ptr() as *const c_char, kmsgrab, &mut opts);
        // Whatever the demuxer did not consume is freed here.
        drop(Dictionary::own(opts));
        if r < 0 {
            return Err(r.into());
        }

        let r = avformat_find_stream_info(ctx, ptr::null_mut());
        if r < 0 {
            avformat_close_input(&mut ctx);
            return Err(r.into());
        }

        Ok(format::context::Input::wrap(ctx))
    }
}

fn decode_next(
    input: &mut format::context::Input,
    decoder: &mut decoder::Video,
    stream_index: usize,
) -> Result<frame::Video> {
    loop {
        let mut packet = Packet::empty();
        packet.read(input).map_err(Error::SourceRead)?;
        if packet.stream() != stream_index {
            continue;
        }

        decoder.send_packet(&packet).map_err(Error::SourceRead)?;

        let mut frame = frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => return Ok(frame),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::error::EAGAIN => {
                continue
            }
            Err(e) => return Err(Error::SourceRead(e)),
        }
    }
}
