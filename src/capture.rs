//! Tick-driven capture: open the source lazily, hand one frame per tick to
//! the display, and start over from scratch when the source goes away.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use ffmpeg_next::format::Pixel;
use tracing::{debug, info, warn};

use crate::buffer::{FilteredBackend, FrameBuffer, MemoryBackend};
use crate::damage::Damage;
use crate::error::{Error, Result};
use crate::filter::{Convert, FilterPipeline};
use crate::format::{self, DrmFourcc, DRM_FORMAT_INVALID};
use crate::source::{
    self, kmsgrab::KmsGrab, FrameSource, SourceInfo, DEFAULT_DEVICE_DIR, FALLBACK_DEVICE,
};

/// Consumer of captured frames, e.g. a remote display server.
///
/// The sink keeps the buffer for as long as it needs it and must `unmap`
/// whatever it mapped before dropping its reference.
pub trait DisplaySink {
    fn feed(&mut self, buffer: Rc<FrameBuffer>, damage: &Damage);
}

/// Opens sources and builds matching conversion pipelines.
pub trait Platform {
    type Source: FrameSource;
    type Converter: Convert + 'static;

    fn open_source(&mut self, device: &Path) -> Result<Self::Source>;

    fn build_pipeline(&mut self, info: &SourceInfo) -> Result<Self::Converter>;
}

/// KMS scanout capture converted through VAAPI.
pub struct KmsPlatform {
    framerate: u32,
}

impl KmsPlatform {
    pub fn new(framerate: u32) -> Self {
        Self { framerate }
    }
}

impl Platform for KmsPlatform {
    type Source = KmsGrab;
    type Converter = FilterPipeline;

    fn open_source(&mut self, device: &Path) -> Result<KmsGrab> {
        // kmsgrab sleeps to pace itself; running it faster than the ticker
        // keeps that sleep out of the tick.
        KmsGrab::open(device, self.framerate.saturating_mul(2))
    }

    fn build_pipeline(&mut self, info: &SourceInfo) -> Result<FilterPipeline> {
        FilterPipeline::new(
            info.width,
            info.height,
            info.fourcc,
            &info.hw_device,
            &info.hw_frames,
        )
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture device to use instead of discovering one.
    pub device: Option<PathBuf>,
    pub device_dir: PathBuf,
    /// Used when discovery finds no primary node.
    pub fallback_device: PathBuf,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            fallback_device: PathBuf::from(FALLBACK_DEVICE),
            fps: 60,
        }
    }
}

impl CaptureConfig {
    pub fn device(&self) -> PathBuf {
        if let Some(device) = &self.device {
            return device.clone();
        }
        source::discover_primary_node(&self.device_dir)
            .unwrap_or_else(|| self.fallback_device.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was handed to the sink.
    Delivered,
    /// Opening the source or building the pipeline failed.
    SetupFailed,
    /// The source still reports a configuration that failed setup before.
    Rejected,
    /// Reading failed; everything was torn down for a reopen next tick.
    SourceLost,
    /// A frame was read but could not be wrapped and was discarded.
    Dropped,
}

/// The source configuration a pipeline was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    device: PathBuf,
    fourcc: u32,
    width: u32,
    height: u32,
}

impl Signature {
    fn of(info: &SourceInfo) -> Self {
        Self {
            device: info.device_path.clone(),
            fourcc: info.fourcc,
            width: info.width,
            height: info.height,
        }
    }
}

enum State<S> {
    Uninitialized,
    // The pipeline goes before the source it was built for.
    Active {
        pipeline: Rc<RefCell<dyn Convert>>,
        source: S,
    },
}

pub struct CaptureLoop<P: Platform> {
    platform: P,
    config: CaptureConfig,
    state: State<P::Source>,
    rejected: Option<Signature>,
    last_failure: Option<String>,
    delivered: u64,
}

impl<P: Platform> CaptureLoop<P> {
    pub fn new(platform: P, config: CaptureConfig) -> Self {
        Self {
            platform,
            config,
            state: State::Uninitialized,
            rejected: None,
            last_failure: None,
            delivered: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Runs one capture attempt.
    pub fn tick(&mut self, sink: &mut dyn DisplaySink) -> TickOutcome {
        if let State::Uninitialized = self.state {
            match self.activate() {
                Ok(state) => self.state = state,
                Err(outcome) => return outcome,
            }
        }

        let captured = match &mut self.state {
            State::Active { pipeline, source } => capture(source, pipeline),
            State::Uninitialized => return TickOutcome::SetupFailed,
        };

        match captured {
            Ok((buffer, damage)) => {
                sink.feed(buffer, &damage);
                self.delivered += 1;
                TickOutcome::Delivered
            }
            Err(e) if e.is_transient() => {
                warn!("capture source lost, reopening: {}", e);
                self.shutdown();
                TickOutcome::SourceLost
            }
            Err(e) => {
                warn!("dropping frame: {}", e);
                TickOutcome::Dropped
            }
        }
    }

    /// Destroys the pipeline and closes the source.
    pub fn shutdown(&mut self) {
        self.state = State::Uninitialized;
    }

    fn activate(&mut self) -> Result<State<P::Source>, TickOutcome> {
        let device = self.config.device();
        let source = match self.platform.open_source(&device) {
            Ok(source) => source,
            Err(e) => {
                self.report(&e);
                return Err(TickOutcome::SetupFailed);
            }
        };

        let info = source.info();
        let signature = Signature::of(info);
        if self.rejected.as_ref() == Some(&signature) {
            debug!("{} still reports a rejected configuration", device.display());
            return Err(TickOutcome::Rejected);
        }

        let pipeline = match self.platform.build_pipeline(info) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.report(&e);
                self.rejected = Some(signature);
                return Err(TickOutcome::SetupFailed);
            }
        };

        info!(
            "capturing {} {}x{} format {:#010x} modifier {:#018x}",
            device.display(),
            info.width,
            info.height,
            info.fourcc,
            info.modifier
        );
        self.rejected = None;
        self.last_failure = None;

        Ok(State::Active {
            pipeline: Rc::new(RefCell::new(pipeline)),
            source,
        })
    }

    /// Logs a setup failure once rather than on every tick.
    fn report(&mut self, err: &Error) {
        let message = err.to_string();
        if self.last_failure.as_deref() == Some(message.as_str()) {
            debug!("capture setup failed again: {}", message);
            return;
        }
        warn!("capture setup failed: {}", message);
        self.last_failure = Some(message);
    }
}

fn capture<S: FrameSource>(
    source: &mut S,
    pipeline: &Rc<RefCell<dyn Convert>>,
) -> Result<(Rc<FrameBuffer>, Damage)> {
    let frame = source.read_frame()?;
    let (width, height) = (frame.width(), frame.height());

    let buffer = if frame.format() == Pixel::DRM_PRIME {
        let fourcc = format::resolve(source.info().fourcc)?;
        FrameBuffer::new(
            Box::new(FilteredBackend::new(frame, pipeline)),
            width,
            height,
            fourcc,
        )
    } else {
        let fourcc = DrmFourcc::from_sw_format(frame.format())
            .ok_or(Error::UnsupportedFormat(DRM_FORMAT_INVALID))?;
        FrameBuffer::new(
            Box::new(MemoryBackend::new(frame, fourcc)),
            width,
            height,
            fourcc,
        )
    };

    Ok((Rc::new(buffer), Damage::full(width, height)))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::VecDeque;

    use ffmpeg_next::frame;

    use super::*;
    use crate::buffer::tests::{gpu_frame, CountingConverter};
    use crate::buffer::BufferKind;
    use crate::damage::Rect;
    use crate::format::DRM_FORMAT_MOD_INVALID;
    use crate::hw::{tests::fake_context, HwContext};
    use crate::source::tests::scratch_dir;

    enum Read {
        Gpu,
        Memory(Pixel),
        Fail,
    }

    struct FakeSource {
        info: SourceInfo,
        reads: Rc<RefCell<VecDeque<Read>>>,
    }

    impl FrameSource for FakeSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn read_frame(&mut self) -> Result<frame::Video> {
            let (width, height) = (self.info.width, self.info.height);
            match self.reads.borrow_mut().pop_front().unwrap_or(Read::Gpu) {
                Read::Gpu => Ok(gpu_frame(width, height, &self.info.hw_frames)),
                Read::Memory(format) => Ok(frame::Video::new(format, width, height)),
                Read::Fail => Err(Error::SourceRead(ffmpeg_next::Error::Other {
                    errno: 5, // EIO
                })),
            }
        }
    }

    type Build<C> = fn(&SourceInfo, &Rc<Cell<usize>>) -> Result<C>;

    struct FakePlatform<C> {
        hw_device: HwContext,
        hw_frames: HwContext,
        width: u32,
        height: u32,
        fourcc: Rc<Cell<u32>>,
        failing_opens: usize,
        reads: Rc<RefCell<VecDeque<Read>>>,
        opened: Vec<PathBuf>,
        builds: usize,
        conversions: Rc<Cell<usize>>,
        build: Build<C>,
    }

    impl<C: Convert + 'static> FakePlatform<C> {
        fn new(width: u32, height: u32, fourcc: u32, build: Build<C>) -> Self {
            Self {
                hw_device: fake_context(),
                hw_frames: fake_context(),
                width,
                height,
                fourcc: Rc::new(Cell::new(fourcc)),
                failing_opens: 0,
                reads: Rc::default(),
                opened: Vec::new(),
                builds: 0,
                conversions: Rc::default(),
                build,
            }
        }
    }

    impl<C: Convert + 'static> Platform for FakePlatform<C> {
        type Source = FakeSource;
        type Converter = C;

        fn open_source(&mut self, device: &Path) -> Result<FakeSource> {
            self.opened.push(device.to_path_buf());
            if self.failing_opens > 0 {
                self.failing_opens -= 1;
                return Err(Error::DeviceOpen {
                    path: device.to_path_buf(),
                    source: ffmpeg_next::Error::Other { errno: 13 },
                });
            }
            Ok(FakeSource {
                info: SourceInfo {
                    device_path: device.to_path_buf(),
                    width: self.width,
                    height: self.height,
                    fourcc: self.fourcc.get(),
                    modifier: DRM_FORMAT_MOD_INVALID,
                    hw_device: self.hw_device.clone(),
                    hw_frames: self.hw_frames.clone(),
                },
                reads: self.reads.clone(),
            })
        }

        fn build_pipeline(&mut self, info: &SourceInfo) -> Result<C> {
            self.builds += 1;
            (self.build)(info, &self.conversions)
        }
    }

    /// Resolves the format like the real pipeline and retains both contexts.
    struct FakePipeline {
        inner: CountingConverter,
        _hw_device: HwContext,
        _hw_frames: HwContext,
    }

    impl Convert for FakePipeline {
        fn convert(&mut self, frame: &frame::Video) -> Result<crate::filter::PackedFrame> {
            self.inner.convert(frame)
        }
    }

    fn fake_pipeline(info: &SourceInfo, calls: &Rc<Cell<usize>>) -> Result<FakePipeline> {
        format::resolve(info.fourcc)?;
        Ok(FakePipeline {
            inner: CountingConverter {
                calls: calls.clone(),
                fail: false,
            },
            _hw_device: info.hw_device.clone(),
            _hw_frames: info.hw_frames.clone(),
        })
    }

    fn real_pipeline(info: &SourceInfo, _: &Rc<Cell<usize>>) -> Result<FilterPipeline> {
        FilterPipeline::new(
            info.width,
            info.height,
            info.fourcc,
            &info.hw_device,
            &info.hw_frames,
        )
    }

    #[derive(Default)]
    struct RecordingSink {
        fed: Vec<(Rc<FrameBuffer>, Damage)>,
    }

    impl DisplaySink for RecordingSink {
        fn feed(&mut self, buffer: Rc<FrameBuffer>, damage: &Damage) {
            self.fed.push((buffer, damage.clone()));
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            device: Some(PathBuf::from("/dev/dri/card7")),
            ..Default::default()
        }
    }

    #[test]
    fn first_tick_delivers_full_frame() {
        let platform = FakePlatform::new(1920, 1080, DrmFourcc::Argb8888.code(), fake_pipeline);
        let frames = platform.hw_frames.clone();
        let conversions = platform.conversions.clone();
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        assert!(!capture.is_active());
        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        assert!(capture.is_active());
        assert_eq!(capture.frames_delivered(), 1);

        let (fb, damage) = sink.fed.pop().unwrap();
        assert_eq!(damage.rects(), &[Rect::new(0, 0, 1920, 1080)]);
        assert_eq!(fb.kind(), BufferKind::Filtered);
        assert_eq!(fb.fourcc(), DrmFourcc::Argb8888);
        assert_eq!(Rc::strong_count(&fb), 1);
        assert_eq!(conversions.get(), 0);

        fb.map().unwrap();
        assert_eq!(fb.stride_bytes(), 1920 * 4);
        assert_eq!(conversions.get(), 1);
        fb.unmap();
        assert!(fb.pixels().is_none());

        let with_frame = frames.ref_count();
        drop(fb);
        assert_eq!(frames.ref_count(), with_frame - 1);
    }

    #[test]
    fn one_capture_per_tick() {
        let platform = FakePlatform::new(64, 64, DrmFourcc::Xrgb8888.code(), fake_pipeline);
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        for _ in 0..5 {
            assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        }
        assert_eq!(sink.fed.len(), 5);
        assert_eq!(capture.platform.opened.len(), 1);
        assert_eq!(capture.platform.builds, 1);
    }

    #[test]
    fn read_failure_tears_down_and_reopens() {
        let platform = FakePlatform::new(64, 32, DrmFourcc::Xrgb8888.code(), fake_pipeline);
        let device = platform.hw_device.clone();
        let frames = platform.hw_frames.clone();
        let reads = platform.reads.clone();
        let mut capture = CaptureLoop::new(platform, config());

        // Baseline: the platform's reference plus ours.
        assert_eq!((device.ref_count(), frames.ref_count()), (2, 2));

        let mut sink = RecordingSink::default();
        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        // Source and pipeline each retain both contexts, the frame the pool.
        assert_eq!((device.ref_count(), frames.ref_count()), (4, 5));

        reads.borrow_mut().push_back(Read::Fail);
        assert_eq!(capture.tick(&mut sink), TickOutcome::SourceLost);
        assert!(!capture.is_active());

        // Mapping a buffer whose pipeline is gone fails cleanly.
        let (fb, _) = sink.fed.pop().unwrap();
        assert!(matches!(fb.map(), Err(Error::PipelineGone)));
        drop(fb);
        assert_eq!((device.ref_count(), frames.ref_count()), (2, 2));

        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        assert_eq!(capture.platform.opened.len(), 2);
        assert_eq!(capture.platform.builds, 2);

        sink.fed.clear();
        capture.shutdown();
        assert_eq!((device.ref_count(), frames.ref_count()), (2, 2));
    }

    #[test]
    fn open_failure_retries_every_tick() {
        let mut platform = FakePlatform::new(64, 32, DrmFourcc::Xrgb8888.code(), fake_pipeline);
        platform.failing_opens = 2;
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        assert_eq!(capture.tick(&mut sink), TickOutcome::SetupFailed);
        assert_eq!(capture.tick(&mut sink), TickOutcome::SetupFailed);
        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        assert_eq!(capture.platform.opened.len(), 3);
        assert_eq!(capture.platform.builds, 1);
    }

    #[test]
    fn unsupported_format_never_delivers() {
        let nv12 = u32::from_le_bytes(*b"NV12");
        let platform = FakePlatform::new(1920, 1080, nv12, real_pipeline);
        let device = platform.hw_device.clone();
        let frames = platform.hw_frames.clone();
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        assert_eq!(capture.tick(&mut sink), TickOutcome::SetupFailed);
        for _ in 0..3 {
            assert_eq!(capture.tick(&mut sink), TickOutcome::Rejected);
        }

        assert!(sink.fed.is_empty());
        assert!(!capture.is_active());
        assert_eq!(capture.platform.opened.len(), 4);
        assert_eq!(capture.platform.builds, 1);
        assert_eq!((device.ref_count(), frames.ref_count()), (2, 2));
    }

    #[test]
    fn rejected_configuration_is_retried_once_it_changes() {
        let nv12 = u32::from_le_bytes(*b"NV12");
        let platform = FakePlatform::new(640, 480, nv12, fake_pipeline);
        let fourcc = platform.fourcc.clone();
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        assert_eq!(capture.tick(&mut sink), TickOutcome::SetupFailed);
        assert_eq!(capture.tick(&mut sink), TickOutcome::Rejected);

        fourcc.set(DrmFourcc::Xbgr8888.code());
        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        assert_eq!(capture.platform.builds, 2);
        assert_eq!(sink.fed[0].0.fourcc(), DrmFourcc::Xbgr8888);
    }

    #[test]
    fn system_memory_frames_use_plain_backend() {
        let platform = FakePlatform::new(32, 16, DrmFourcc::Xrgb8888.code(), fake_pipeline);
        platform.reads.borrow_mut().extend([Read::Memory(Pixel::BGRZ), Read::Memory(Pixel::NV12)]);
        let conversions = platform.conversions.clone();
        let mut capture = CaptureLoop::new(platform, config());
        let mut sink = RecordingSink::default();

        assert_eq!(capture.tick(&mut sink), TickOutcome::Delivered);
        let (fb, damage) = &sink.fed[0];
        assert_eq!(fb.kind(), BufferKind::Memory);
        assert_eq!(damage.rects(), &[Rect::new(0, 0, 32, 16)]);
        fb.map().unwrap();
        assert!(fb.stride() >= 32);
        fb.unmap();
        assert_eq!(conversions.get(), 0);

        assert_eq!(capture.tick(&mut sink), TickOutcome::Dropped);
        assert!(capture.is_active());
        assert_eq!(sink.fed.len(), 1);
    }

    #[test]
    fn explicit_device_wins() {
        let config = CaptureConfig {
            device: Some(PathBuf::from("/dev/dri/card3")),
            ..Default::default()
        };
        assert_eq!(config.device(), PathBuf::from("/dev/dri/card3"));
    }

    #[test]
    fn discovered_device_is_used() {
        let dir = scratch_dir("discovered");
        std::fs::write(dir.join("card1"), b"").unwrap();
        let config = CaptureConfig {
            device_dir: dir.clone(),
            ..Default::default()
        };
        assert_eq!(config.device(), dir.join("card1"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fallback_only_without_discovery() {
        let dir = scratch_dir("fallback");
        let config = CaptureConfig {
            device_dir: dir.clone(),
            ..Default::default()
        };
        assert_eq!(config.device(), PathBuf::from(FALLBACK_DEVICE));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tick_interval_follows_fps() {
        assert_eq!(CaptureConfig::default().tick_interval(), Duration::from_micros(16_666));
        let config = CaptureConfig {
            fps: 0,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }
}
