use std::ptr::NonNull;

use ffmpeg_next::ffi::{av_buffer_get_ref_count, av_buffer_ref, av_buffer_unref, AVBufferRef};

/// An owned reference to a hardware device or frame-pool context.
///
/// Every clone is a separate `av_buffer_ref` and every drop the matching
/// `av_buffer_unref`, so handing a context to another component is always an
/// explicit retain.
pub struct HwContext {
    buf: NonNull<AVBufferRef>,
}

impl HwContext {
    /// Takes a new reference on `raw`, leaving the caller's reference alone.
    ///
    /// Returns `None` for a null pointer or if the reference could not be
    /// allocated.
    ///
    /// # Safety
    /// `raw` must be null or point to a live `AVBufferRef`.
    pub unsafe fn retain(raw: *mut AVBufferRef) -> Option<Self> {
        if raw.is_null() {
            return None;
        }
        NonNull::new(av_buffer_ref(raw)).map(|buf| Self { buf })
    }

    /// Adopts an existing reference without taking another one.
    ///
    /// # Safety
    /// `raw` must be null or a reference the caller owns and gives up.
    pub unsafe fn adopt(raw: *mut AVBufferRef) -> Option<Self> {
        NonNull::new(raw).map(|buf| Self { buf })
    }

    pub fn as_ptr(&self) -> *mut AVBufferRef {
        self.buf.as_ptr()
    }

    /// Returns a fresh reference for a C struct field that will unref it.
    pub fn new_ref(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.buf.as_ptr()) }
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { av_buffer_get_ref_count(self.buf.as_ptr()) }
    }
}

impl Clone for HwContext {
    fn clone(&self) -> Self {
        // av_buffer_ref only fails on allocation failure, which is treated
        // like every other OOM in Rust.
        let buf = NonNull::new(self.new_ref()).unwrap_or_else(|| {
            std::alloc::handle_alloc_error(std::alloc::Layout::new::<AVBufferRef>())
        });
        Self { buf }
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        let mut raw = self.buf.as_ptr();
        unsafe { av_buffer_unref(&mut raw) };
    }
}

impl std::fmt::Debug for HwContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwContext")
            .field("buf", &self.buf)
            .field("refs", &self.ref_count())
            .finish()
    }
}
