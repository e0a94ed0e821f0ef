//! Core traits and types for the V4L2 capture engine.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Pixel formats the engine can negotiate with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Uncompressed YUV 4:2:2 packed.
    Yuyv,
    /// Motion JPEG.
    Mjpeg,
    /// H.264 elementary stream (UVC 1.1 vendor extension on the C920 family).
    H264,
}

impl PixelFormat {
    /// The V4L2 fourcc code for this format.
    #[must_use]
    pub fn fourcc(self) -> v4l::FourCC {
        match self {
            Self::Yuyv => v4l::FourCC::new(b"YUYV"),
            Self::Mjpeg => v4l::FourCC::new(b"MJPG"),
            Self::H264 => v4l::FourCC::new(b"H264"),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yuyv => write!(f, "YUYV"),
            Self::Mjpeg => write!(f, "MJPEG"),
            Self::H264 => write!(f, "H264"),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "YUYV" => Ok(Self::Yuyv),
            "MJPEG" => Ok(Self::Mjpeg),
            "H264" => Ok(Self::H264),
            other => Err(CaptureError::UnsupportedFormat {
                format: other.to_owned(),
                source: None,
            }),
        }
    }
}

/// Immutable-after-negotiation capture configuration.
///
/// The output destination and frame-count limit are deliberately absent:
/// both belong to the frame sink, which owns its own lifecycle.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Path to the video device node.
    pub device: PathBuf,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Requested frame rate (frames per second).
    pub fps: u32,
    /// Pixel format to negotiate.
    pub format: PixelFormat,
    /// Target encoder bitrate in bits per second, applied best-effort.
    pub bitrate: Option<u32>,
    /// Number of memory-mapped buffers to request from the driver.
    pub buffers: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::H264,
            bitrate: None,
            buffers: crate::device::DEFAULT_BUFFERS,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// Continuation signal for the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep calling `process`.
    Continue,
    /// End the capture session normally.
    Stop,
}

impl Flow {
    /// Whether the loop should keep going.
    #[must_use]
    pub const fn is_continue(self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Outcome of waiting for the device to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A buffer is ready to dequeue.
    Ready,
    /// The wait was interrupted by a signal; retry without touching a buffer.
    Interrupted,
    /// No frame arrived within the timeout.
    TimedOut,
}

/// Outcome of a dequeue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeue {
    /// The driver handed over a filled buffer.
    Frame {
        /// Index of the dequeued buffer within the pool.
        index: u32,
        /// Bytes of frame data the driver placed in it.
        bytes_used: u32,
    },
    /// Spurious wake; no buffer was ready after all.
    NotReady,
}

/// The seam between the capture engine and the driver.
///
/// One implementation talks V4L2 ([`crate::v4l2::V4l2Port`]); tests script a
/// mock. The engine owns the protocol ordering and the pool bookkeeping; a
/// port owns the file descriptor and the raw mappings.
pub trait DriverPort {
    /// Query driver/card identification and capability bits.
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities>;

    /// Best-effort reset of the crop rectangle to the driver default.
    fn reset_crop(&mut self) -> io::Result<()>;

    /// Negotiate the capture format.
    fn set_format(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()>;

    /// Read the current frame interval as `(numerator, denominator)`.
    fn frame_interval(&mut self) -> Result<(u32, u32)>;

    /// Request a frame interval; returns the fraction the driver accepted,
    /// which it may have coerced.
    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<(u32, u32)>;

    /// Ask the driver for `count` memory-mapped buffers; returns how many it
    /// actually allocated.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Query and map buffer `index`; returns the mapping length in bytes.
    fn map_buffer(&mut self, index: u32) -> Result<u32>;

    /// Hand ownership of buffer `index` to the driver.
    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    /// Claim ownership of a filled buffer from the driver.
    fn dequeue_buffer(&mut self) -> Result<Dequeue>;

    /// Enable streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Disable streaming.
    fn stream_off(&mut self) -> Result<()>;

    /// Block until the device is readable, a signal arrives, or `timeout`
    /// elapses.
    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness>;

    /// View the first `len` bytes of a mapped buffer.
    ///
    /// `index` must refer to a buffer previously returned by
    /// [`Self::dequeue_buffer`] and not yet re-queued.
    fn frame(&self, index: u32, len: u32) -> &[u8];

    /// Apply the vendor extension bitrate control. Callers treat failure as
    /// non-fatal; drivers without the extension unit simply error out here.
    fn set_bitrate(&mut self, bitrate: u32) -> io::Result<()>;

    /// Unmap every buffer, collecting failures instead of stopping at the
    /// first one.
    fn unmap_all(&mut self) -> Vec<(u32, io::Error)>;
}

/// Error taxonomy for capture operations.
///
/// Fatal conditions abort the current operation and carry the originating OS
/// error where one exists; the two transient conditions (interrupted wait,
/// dequeue not ready) are ordinary [`Flow::Continue`] results, not errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The configured device path does not exist.
    #[error("unable to identify device {device}")]
    DeviceNotFound {
        /// Device path as configured.
        device: String,
        /// Underlying stat failure.
        #[source]
        source: io::Error,
    },

    /// The path exists but is not a character special device.
    #[error("{device} is not a device")]
    NotACharacterDevice {
        /// Device path as configured.
        device: String,
    },

    /// Opening the device node failed.
    #[error("cannot open device {device}")]
    OpenFailed {
        /// Device path as configured.
        device: String,
        /// Underlying open failure.
        #[source]
        source: io::Error,
    },

    /// The node does not answer the V4L2 capability query.
    #[error("{device} is not a valid V4L2 device")]
    NotAV4l2Device {
        /// Device path as configured.
        device: String,
        /// Present when the query failed for a reason other than EINVAL.
        #[source]
        source: Option<io::Error>,
    },

    /// The device lacks the video-capture capability.
    #[error("{device} is not a capture device")]
    NotACaptureDevice {
        /// Device path as configured.
        device: String,
    },

    /// The device lacks the streaming I/O capability.
    #[error("{device} is not a streaming device")]
    NotAStreamingDevice {
        /// Device path as configured.
        device: String,
    },

    /// The requested pixel format is unknown or rejected by the driver.
    #[error("unsupported pixel format {format}")]
    UnsupportedFormat {
        /// Format name as requested.
        format: String,
        /// Present when the driver rejected the format.
        #[source]
        source: Option<io::Error>,
    },

    /// Reading the streaming parameters failed.
    #[error("unable to get stream parameters")]
    StreamParamGetFailed(#[source] io::Error),

    /// Writing the streaming parameters failed.
    #[error("unable to set stream parameters")]
    StreamParamSetFailed(#[source] io::Error),

    /// The driver does not support memory-mapped streaming I/O.
    #[error("{device} does not support memory mapping")]
    MmapUnsupported {
        /// Device path as configured.
        device: String,
        /// Present when the request failed for a reason other than EINVAL.
        #[source]
        source: Option<io::Error>,
    },

    /// The driver granted fewer buffers than the engine can work with.
    #[error("insufficient buffer memory: {granted} buffers granted, at least {minimum} required")]
    InsufficientBuffers {
        /// Buffers the driver allocated.
        granted: u32,
        /// Engine minimum.
        minimum: u32,
    },

    /// Querying or mapping a driver buffer failed.
    #[error("unable to map buffer {index}")]
    MmapFailed {
        /// Index of the buffer that failed to map.
        index: u32,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// Returning a buffer to the driver failed.
    #[error("unable to queue buffer")]
    QueueFailed(#[source] io::Error),

    /// Claiming a buffer from the driver failed.
    #[error("unable to dequeue buffer")]
    DequeueFailed(#[source] io::Error),

    /// Waiting for device readiness failed for a reason other than a signal.
    #[error("unable to wait on device")]
    WaitFailed(#[source] io::Error),

    /// `STREAMON` failed; the capture session cannot proceed.
    #[error("unable to enable streaming")]
    StreamOnFailed(#[source] io::Error),

    /// `STREAMOFF` failed.
    #[error("unable to disable streaming")]
    StreamOffFailed(#[source] io::Error),

    /// No frame arrived within the readiness timeout.
    #[error("timeout occurred while waiting for device {device}")]
    CaptureTimeout {
        /// Device path as configured.
        device: String,
    },

    /// The frame sink failed to accept or flush frame data.
    #[error("sink write failed")]
    Sink(#[source] io::Error),
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_parses_known_names() {
        assert_eq!("YUYV".parse::<PixelFormat>().ok(), Some(PixelFormat::Yuyv));
        assert_eq!("MJPEG".parse::<PixelFormat>().ok(), Some(PixelFormat::Mjpeg));
        assert_eq!("H264".parse::<PixelFormat>().ok(), Some(PixelFormat::H264));
    }

    #[test]
    fn pixel_format_rejects_unknown_names() {
        let err = "RAW".parse::<PixelFormat>().expect_err("RAW must be rejected");
        assert!(matches!(
            err,
            CaptureError::UnsupportedFormat { ref format, .. } if format == "RAW"
        ));
    }

    #[test]
    fn pixel_format_fourcc_codes() {
        assert_eq!(PixelFormat::Yuyv.fourcc().repr, *b"YUYV");
        assert_eq!(PixelFormat::Mjpeg.fourcc().repr, *b"MJPG");
        assert_eq!(PixelFormat::H264.fourcc().repr, *b"H264");
    }

    #[test]
    fn pixel_format_display_round_trips() {
        for format in [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::H264] {
            let parsed = format
                .to_string()
                .parse::<PixelFormat>()
                .expect("display output must parse back");
            assert_eq!(parsed, format);
        }
    }

    #[test]
    fn flow_continuation() {
        assert!(Flow::Continue.is_continue());
        assert!(!Flow::Stop.is_continue());
    }

    #[test]
    fn default_config_requests_four_buffers() {
        let config = CaptureConfig::default();
        assert_eq!(config.buffers, crate::device::DEFAULT_BUFFERS);
        assert_eq!(config.format, PixelFormat::H264);
    }
}
