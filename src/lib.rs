//! UVC compressed-frame capture for V4L2 cameras.
//!
//! Negotiates a capture format (YUYV, MJPEG, or H.264) with a V4L2 device,
//! runs the memory-mapped streaming I/O loop, and hands each frame to a
//! pluggable sink. On cameras with the UVC H.264 extension unit (the Logitech
//! C920 family) the encoder bitrate can be adjusted best-effort.
//!
//! The driver protocol sits behind the [`DriverPort`] trait, so the engine is
//! fully testable without hardware; production code uses [`V4l2Port`].

pub mod device;
pub mod sink;
pub mod traits;
pub mod v4l2;

#[cfg(test)]
pub mod mock;

pub use device::{CaptureDevice, DEFAULT_BUFFERS, MIN_BUFFERS};
pub use sink::{FrameSink, StreamSink};
pub use traits::{
    CaptureConfig, CaptureError, DeviceCapabilities, DriverPort, Flow, PixelFormat, Result,
};
pub use v4l2::V4l2Port;
