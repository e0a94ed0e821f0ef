//! The capture engine: format negotiation, buffer pool lifecycle, and the
//! blocking acquire/dispatch/release loop.
//!
//! [`CaptureDevice`] is generic over [`DriverPort`] so the whole protocol can
//! be exercised against a scripted mock; production code uses the
//! [`V4l2Port`] default.

use std::time::Duration;

use tracing::{debug, warn};

use crate::sink::FrameSink;
use crate::traits::{
    CaptureConfig, CaptureError, Dequeue, DriverPort, Flow, Readiness, Result,
};
use crate::v4l2::V4l2Port;

/// Fewest mmap buffers the engine can run the queue/dequeue cycle with.
pub const MIN_BUFFERS: u32 = 2;

/// Default size of the memory-mapped buffer pool.
pub const DEFAULT_BUFFERS: u32 = 4;

/// How long `process` waits for the device to become readable before the
/// session is considered dead.
const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Bookkeeping record for one buffer in the pool.
#[derive(Debug)]
struct BufferSlot {
    index: u32,
    /// Mapping capacity in bytes; `bytesused` from a dequeue is clamped to it.
    length: u32,
}

/// A fully negotiated capture device.
///
/// Construction performs the entire negotiation protocol and leaves the
/// device buffer-primed in the stopped state. A session is
/// construct → [`start`](Self::start) → repeat [`process`](Self::process)
/// while it returns [`Flow::Continue`] → [`stop`](Self::stop) → drop.
#[derive(Debug)]
pub struct CaptureDevice<P: DriverPort = V4l2Port> {
    port: P,
    config: CaptureConfig,
    pool: Vec<BufferSlot>,
    streaming: bool,
}

impl CaptureDevice<V4l2Port> {
    /// Open the configured device node and run the negotiation protocol.
    ///
    /// Fails fast at the first unrecoverable step. Construction is
    /// all-or-nothing: on error the port is dropped, which unmaps any
    /// partial mappings and closes the descriptor.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let device = config.device.display().to_string();
        debug!(device = %device, "identifying device");
        let metadata =
            std::fs::metadata(&config.device).map_err(|source| CaptureError::DeviceNotFound {
                device: device.clone(),
                source,
            })?;
        if !metadata.file_type().is_char_device() {
            return Err(CaptureError::NotACharacterDevice { device });
        }

        let port = V4l2Port::open(&config.device)?;
        Self::negotiate(port, config)
    }
}

impl<P: DriverPort> CaptureDevice<P> {
    /// Run the negotiation protocol against an already-open port.
    pub(crate) fn negotiate(mut port: P, config: CaptureConfig) -> Result<Self> {
        let device = config.device.display().to_string();

        if config.buffers < MIN_BUFFERS {
            return Err(CaptureError::InsufficientBuffers {
                granted: config.buffers,
                minimum: MIN_BUFFERS,
            });
        }

        debug!(device = %device, "querying V4L2 capabilities");
        let caps = port.query_capabilities()?;
        if !caps.can_capture {
            return Err(CaptureError::NotACaptureDevice { device });
        }
        if !caps.can_stream {
            return Err(CaptureError::NotAStreamingDevice { device });
        }
        debug!(driver = %caps.driver, card = %caps.card, bus = %caps.bus_info, "device identified");

        if let Err(err) = port.reset_crop() {
            warn!(device = %device, error = %err, "unable to set default crop rectangle");
        }

        debug!(
            width = config.width,
            height = config.height,
            format = %config.format,
            "setting capture format"
        );
        port.set_format(config.width, config.height, config.format)?;

        let (num, den) = port.frame_interval()?;
        debug!("time per frame was {num}/{den}");
        let (num, den) = port.set_frame_interval(1, config.fps)?;
        if (num, den) == (1, config.fps) {
            debug!("time per frame set to {num}/{den}");
        } else {
            // Accepted behavior: drivers may coerce the interval. Logged,
            // not verified.
            debug!("driver coerced time per frame to {num}/{den}");
        }

        let granted = port.request_buffers(config.buffers)?;
        debug!(requested = config.buffers, granted, "requested mmap buffer pool");
        if granted < MIN_BUFFERS {
            return Err(CaptureError::InsufficientBuffers {
                granted,
                minimum: MIN_BUFFERS,
            });
        }

        let mut pool = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let length = port.map_buffer(index)?;
            debug!(index, length, "mapped buffer");
            pool.push(BufferSlot { index, length });
        }

        for slot in &pool {
            port.queue_buffer(slot.index)?;
        }
        debug!(device = %device, buffers = pool.len(), "device primed");

        Ok(Self {
            port,
            config,
            pool,
            streaming: false,
        })
    }

    /// The configuration this device was negotiated with.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Whether the device is currently streaming.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Number of buffers in the mapped pool.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Enable streaming. No-op when already streaming.
    ///
    /// Applies the configured bitrate after `STREAMON`, best-effort.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        debug!(device = %self.device_name(), "starting stream");
        self.port.stream_on()?;
        self.streaming = true;
        if let Some(bitrate) = self.config.bitrate {
            self.set_bitrate(bitrate);
        }
        Ok(())
    }

    /// Disable streaming and return every buffer to the driver so a later
    /// [`start`](Self::start) resumes cleanly. No-op when already stopped.
    pub fn stop(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        debug!(device = %self.device_name(), "stopping stream");
        self.port.stream_off()?;
        self.streaming = false;
        for slot in &self.pool {
            self.port.queue_buffer(slot.index)?;
        }
        Ok(())
    }

    /// Apply the vendor extension bitrate control, best-effort.
    ///
    /// Sets both peak and average bitrate to `bitrate`. Hardware support for
    /// the control is optional; failures are logged and swallowed.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        debug!(bitrate, "applying encoder bitrate");
        if let Err(err) = self.port.set_bitrate(bitrate) {
            warn!(device = %self.device_name(), error = %err, "encoder bitrate control not applied");
        }
    }

    /// Capture one frame and dispatch it to `sink`.
    ///
    /// Blocks until a frame is available, a signal interrupts the wait, or
    /// the 2-second readiness timeout elapses. Interrupted waits and
    /// not-ready dequeues are transient: the call returns
    /// [`Flow::Continue`] without invoking the sink. The dequeued buffer is
    /// re-queued before this returns, whatever the sink decides.
    pub fn process<S: FrameSink>(&mut self, sink: &mut S) -> Result<Flow> {
        match self.port.wait_readable(READY_TIMEOUT)? {
            Readiness::Interrupted => return Ok(Flow::Continue),
            Readiness::TimedOut => {
                return Err(CaptureError::CaptureTimeout {
                    device: self.device_name(),
                })
            }
            Readiness::Ready => {}
        }

        let (index, bytes_used) = match self.port.dequeue_buffer()? {
            Dequeue::NotReady => return Ok(Flow::Continue),
            Dequeue::Frame { index, bytes_used } => (index, bytes_used),
        };

        // An index outside the pool means the queue protocol is
        // desynchronized with the driver; nothing sane can continue.
        let slot = self
            .pool
            .get(index as usize)
            .expect("driver returned a buffer index outside the mapped pool");

        let flow = {
            let data = self.port.frame(index, bytes_used.min(slot.length));
            sink.write_frame(data, &self.config)
        };

        // Ownership goes back to the driver regardless of the sink's verdict.
        self.port.queue_buffer(index)?;

        flow
    }

    fn device_name(&self) -> String {
        self.config.device.display().to_string()
    }
}

impl<P: DriverPort> Drop for CaptureDevice<P> {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(err) = self.stop() {
                warn!(device = %self.device_name(), error = %err, "failed to stop stream during teardown");
            }
        }
        // Best-effort: collect unmap failures rather than aborting cleanup.
        for (index, err) in self.port.unmap_all() {
            warn!(index, error = %err, "failed to unmap buffer");
        }
    }
}
