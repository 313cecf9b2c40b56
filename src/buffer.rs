//! Frame buffers handed to the display sink.
//!
//! A buffer owns the captured frame and knows how to make its pixels CPU
//! addressable. For GPU frames that means running the conversion pipeline,
//! which is only done when the consumer actually asks for the bytes.

use std::cell::{Ref, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use ffmpeg_next::frame;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::filter::{Convert, PackedFrame};
use crate::format::DrmFourcc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// GPU frame converted through a filter pipeline on map.
    Filtered,
    /// Frame already in system memory.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Normal,
}

/// Storage behind a [`FrameBuffer`].
pub trait Backend {
    fn kind(&self) -> BufferKind;

    /// Makes the pixels addressable. Mapping an already mapped backend does
    /// nothing.
    fn map(&mut self) -> Result<()>;

    /// Retires the CPU mapping. Safe to call while unmapped.
    fn unmap(&mut self);

    /// Mapped pixels and their stride in pixels.
    fn pixels(&self) -> Option<(&[u8], u32)>;

    /// Frees the captured frame. Does not unmap.
    fn release(&mut self);
}

pub struct FilteredBackend {
    frame: Option<frame::Video>,
    converter: Weak<RefCell<dyn Convert>>,
    mapped: Option<PackedFrame>,
}

impl FilteredBackend {
    pub fn new(frame: frame::Video, converter: &Rc<RefCell<dyn Convert>>) -> Self {
        Self {
            frame: Some(frame),
            converter: Rc::downgrade(converter),
            mapped: None,
        }
    }
}

impl Backend for FilteredBackend {
    fn kind(&self) -> BufferKind {
        BufferKind::Filtered
    }

    fn map(&mut self) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }

        let frame = self.frame.as_ref().ok_or(Error::Released)?;
        let converter = self.converter.upgrade().ok_or(Error::PipelineGone)?;
        let packed = converter.borrow_mut().convert(frame)?;

        trace!(
            "mapped {}x{} frame, stride {}",
            packed.width(),
            packed.height(),
            packed.stride()
        );
        self.mapped = Some(packed);
        Ok(())
    }

    fn unmap(&mut self) {
        self.mapped = None;
    }

    fn pixels(&self) -> Option<(&[u8], u32)> {
        self.mapped.as_ref().map(|p| (p.data(), p.stride()))
    }

    fn release(&mut self) {
        self.frame = None;
    }
}

pub struct MemoryBackend {
    frame: Option<frame::Video>,
    bytes_per_pixel: u32,
    mapped: bool,
}

impl MemoryBackend {
    pub fn new(frame: frame::Video, fourcc: DrmFourcc) -> Self {
        Self {
            frame: Some(frame),
            bytes_per_pixel: fourcc.bytes_per_pixel(),
            mapped: false,
        }
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BufferKind {
        BufferKind::Memory
    }

    fn map(&mut self) -> Result<()> {
        if self.frame.is_none() {
            return Err(Error::Released);
        }
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }

    fn pixels(&self) -> Option<(&[u8], u32)> {
        match &self.frame {
            Some(frame) if self.mapped => Some((
                frame.data(0),
                frame.stride(0) as u32 / self.bytes_per_pixel,
            )),
            _ => None,
        }
    }

    fn release(&mut self) {
        self.frame = None;
    }
}

/// One frame as seen by the display sink.
///
/// Buffers are shared as `Rc<FrameBuffer>`; the strong count is the
/// reference count and the captured frame is released with the last
/// reference.
pub struct FrameBuffer {
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
    transform: Transform,
    pts: Option<Duration>,
    external: bool,
    backend: RefCell<Box<dyn Backend>>,
}

impl FrameBuffer {
    pub fn new(backend: Box<dyn Backend>, width: u32, height: u32, fourcc: DrmFourcc) -> Self {
        Self {
            width,
            height,
            fourcc,
            transform: Transform::Normal,
            pts: None,
            external: true,
            backend: RefCell::new(backend),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.backend.borrow().kind()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fourcc(&self) -> DrmFourcc {
        self.fourcc
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    /// The pixel memory belongs to the capture side, not the sink.
    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.fourcc.bytes_per_pixel()
    }

    /// Makes the pixels available. Mapping a mapped buffer is a no-op, also
    /// while a `pixels()` guard is held.
    pub fn map(&self) -> Result<()> {
        if self.is_mapped() {
            return Ok(());
        }
        self.backend.borrow_mut().map()
    }

    /// Drops the mapping. Ignored while a `pixels()` guard is alive.
    pub fn unmap(&self) {
        match self.backend.try_borrow_mut() {
            Ok(mut backend) => backend.unmap(),
            Err(_) => warn!("unmap ignored while the pixels are borrowed"),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.backend.borrow().pixels().is_some()
    }

    /// Mapped pixel data, `None` while unmapped.
    pub fn pixels(&self) -> Option<Ref<'_, [u8]>> {
        Ref::filter_map(self.backend.borrow(), |b| b.pixels().map(|(data, _)| data)).ok()
    }

    /// Row stride in pixels, zero while unmapped.
    pub fn stride(&self) -> u32 {
        self.backend.borrow().pixels().map_or(0, |(_, stride)| stride)
    }

    pub fn stride_bytes(&self) -> usize {
        self.stride() as usize * self.bytes_per_pixel() as usize
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let backend = self.backend.get_mut();
        if backend.pixels().is_some() {
            warn!("frame buffer released while still mapped");
        }
        backend.release();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("kind", &self.kind())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fourcc", &self.fourcc)
            .field("transform", &self.transform)
            .field("pts", &self.pts)
            .field("external", &self.external)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use ffmpeg_next::format::Pixel;

    use super::*;
    use crate::hw::{tests::fake_context, HwContext};

    /// A DRM-PRIME frame that holds a reference on `frames`, the way frames
    /// from a hardware pool do.
    pub(crate) fn gpu_frame(width: u32, height: u32, frames: &HwContext) -> frame::Video {
        let mut frame = frame::Video::empty();
        frame.set_format(Pixel::DRM_PRIME);
        frame.set_width(width);
        frame.set_height(height);
        unsafe { (*frame.as_mut_ptr()).hw_frames_ctx = frames.new_ref() };
        frame
    }

    pub(crate) struct CountingConverter {
        pub(crate) calls: Rc<Cell<usize>>,
        pub(crate) fail: bool,
    }

    impl Convert for CountingConverter {
        fn convert(&mut self, frame: &frame::Video) -> Result<PackedFrame> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(Error::Convert(ffmpeg_next::Error::Eof));
            }
            let (w, h) = (frame.width(), frame.height());
            Ok(PackedFrame::new(
                vec![0x5a; (w * h * 4) as usize],
                Pixel::ZRGB,
                w,
                h,
                w,
            ))
        }
    }

    fn converter(fail: bool) -> (Rc<RefCell<dyn Convert>>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let converter: Rc<RefCell<dyn Convert>> = Rc::new(RefCell::new(CountingConverter {
            calls: calls.clone(),
            fail,
        }));
        (converter, calls)
    }

    fn filtered(
        frames: &HwContext,
        converter: &Rc<RefCell<dyn Convert>>,
        width: u32,
        height: u32,
    ) -> FrameBuffer {
        let backend = FilteredBackend::new(gpu_frame(width, height, frames), converter);
        FrameBuffer::new(Box::new(backend), width, height, DrmFourcc::Bgra8888)
    }

    #[test]
    fn map_converts_once() {
        let frames = fake_context();
        let (converter, calls) = converter(false);
        let fb = filtered(&frames, &converter, 64, 32);

        assert!(!fb.is_mapped());
        assert_eq!(fb.stride(), 0);

        fb.map().unwrap();
        let first = fb.pixels().unwrap().as_ptr();
        fb.map().unwrap();
        let second = fb.pixels().unwrap().as_ptr();

        assert_eq!(calls.get(), 1);
        assert_eq!(first, second);
        assert_eq!(fb.stride(), 64);
        assert_eq!(fb.stride_bytes(), 64 * 4);
        assert_eq!(fb.pixels().unwrap().len(), 64 * 32 * 4);
        fb.unmap();
    }

    #[test]
    fn remap_while_reading_pixels() {
        let frames = fake_context();
        let (converter, calls) = converter(false);
        let fb = filtered(&frames, &converter, 16, 4);

        fb.map().unwrap();
        let pixels = fb.pixels().unwrap();
        fb.map().unwrap();
        fb.map().unwrap();
        fb.unmap();
        assert!(fb.is_mapped());
        assert_eq!(pixels.len(), 16 * 4 * 4);
        drop(pixels);

        assert_eq!(calls.get(), 1);
        fb.unmap();
        assert!(!fb.is_mapped());
    }

    #[test]
    fn unmap_is_idempotent() {
        let frames = fake_context();
        let (converter, calls) = converter(false);
        let fb = filtered(&frames, &converter, 8, 8);

        fb.unmap();
        fb.map().unwrap();
        fb.unmap();
        assert!(!fb.is_mapped());
        assert!(fb.pixels().is_none());
        assert_eq!(fb.stride(), 0);
        fb.unmap();

        // Mapping again after an unmap converts again.
        fb.map().unwrap();
        assert_eq!(calls.get(), 2);
        fb.unmap();
    }

    #[test]
    fn failed_map_stays_unmapped() {
        let frames = fake_context();
        let (converter, calls) = converter(true);
        let fb = filtered(&frames, &converter, 8, 8);

        assert!(matches!(fb.map(), Err(Error::Convert(_))));
        assert!(!fb.is_mapped());
        assert!(matches!(fb.map(), Err(Error::Convert(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn map_after_pipeline_teardown_fails() {
        let frames = fake_context();
        let (converter, calls) = converter(false);
        let fb = filtered(&frames, &converter, 8, 8);

        drop(converter);
        assert!(matches!(fb.map(), Err(Error::PipelineGone)));
        assert_eq!(calls.get(), 0);
        assert!(!fb.is_mapped());
    }

    #[test]
    fn last_reference_releases_gpu_frame() {
        let frames = fake_context();
        let (converter, _) = converter(false);
        let fb = Rc::new(filtered(&frames, &converter, 8, 8));
        assert_eq!(frames.ref_count(), 2);

        let sink_ref = fb.clone();
        drop(fb);
        assert_eq!(frames.ref_count(), 2);

        sink_ref.map().unwrap();
        sink_ref.unmap();
        drop(sink_ref);
        assert_eq!(frames.ref_count(), 1);
    }

    #[test]
    fn memory_backend_exposes_frame_rows() {
        let frame = frame::Video::new(Pixel::BGRZ, 33, 4);
        let frame_stride = frame.stride(0);
        let fb = FrameBuffer::new(
            Box::new(MemoryBackend::new(frame, DrmFourcc::Xrgb8888)),
            33,
            4,
            DrmFourcc::Xrgb8888,
        );

        assert_eq!(fb.kind(), BufferKind::Memory);
        assert!(fb.pixels().is_none());

        fb.map().unwrap();
        assert_eq!(fb.stride_bytes(), frame_stride);
        assert!(fb.pixels().unwrap().len() >= 33 * 4 * 4);

        fb.unmap();
        fb.unmap();
        assert!(!fb.is_mapped());
    }

    #[test]
    fn buffer_defaults() {
        let frames = fake_context();
        let (converter, _) = converter(false);
        let fb = filtered(&frames, &converter, 1920, 1080);

        assert_eq!(fb.kind(), BufferKind::Filtered);
        assert_eq!(fb.transform(), Transform::Normal);
        assert_eq!(fb.pts(), None);
        assert!(fb.is_external());
        assert_eq!((fb.width(), fb.height()), (1920, 1080));
        assert_eq!(fb.bytes_per_pixel(), 4);
    }
}
