//! Capture of KMS scanout frames for a remote display.
//!
//! [`capture::CaptureLoop`] opens a [`source::FrameSource`] on the first
//! tick, wraps every captured GPU frame in a [`buffer::FrameBuffer`] and hands
//! it to a [`capture::DisplaySink`] together with its damage. The frame is
//! only converted to CPU-addressable pixels by a [`filter::FilterPipeline`]
//! when the sink maps the buffer.

pub mod buffer;
pub mod capture;
pub mod damage;
pub mod error;
pub mod filter;
pub mod format;
pub mod hw;
pub mod source;

pub use error::{Error, Result};
