//! Scripted in-memory [`DriverPort`] for exercising the engine without
//! hardware.
//!
//! The mock models the driver side of the buffer protocol: a FIFO of queued
//! buffer indices, at most one claimed (dequeued, not yet re-queued) buffer,
//! and a script of [`Event`]s that injects interrupts, timeouts, and spurious
//! wakes into an otherwise endless stream of frames.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::traits::{
    CaptureError, Dequeue, DeviceCapabilities, DriverPort, PixelFormat, Readiness, Result,
};

/// Mapping length handed out by [`MockPort::map_buffer`].
const BUFFER_LENGTH: u32 = 65_536;

/// Payload size of a scripted default frame.
const FRAME_SIZE: u32 = 4_096;

/// One scripted occurrence in the capture loop.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// Deliver a frame with this many payload bytes.
    Frame(u32),
    /// The readiness wait is interrupted by a signal.
    Interrupted,
    /// The readiness wait times out.
    TimedOut,
    /// The wait reports readable but the dequeue comes back empty.
    NotReady,
}

/// Scripted driver port. Once the script runs out it delivers frames forever.
#[derive(Debug)]
pub struct MockPort {
    capabilities: DeviceCapabilities,
    grant: Option<u32>,
    mmap_unsupported: bool,
    map_failure_at: Option<u32>,
    crop_unsupported: bool,
    bitrate_control: bool,
    events: VecDeque<Event>,

    buffers: Vec<Vec<u8>>,
    queued: VecDeque<u32>,
    claimed: Option<u32>,

    /// Number of `stream_on` calls observed.
    pub stream_on_calls: u32,
    /// Number of `stream_off` calls observed.
    pub stream_off_calls: u32,
    /// Number of `dequeue_buffer` calls observed.
    pub dequeue_calls: u32,
    /// Bitrates the engine successfully applied, in order.
    pub bitrate_requests: Vec<u32>,
}

impl MockPort {
    /// A fully capable device with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            grant: None,
            mmap_unsupported: false,
            map_failure_at: None,
            crop_unsupported: false,
            bitrate_control: true,
            events: VecDeque::new(),
            buffers: Vec::new(),
            queued: VecDeque::new(),
            claimed: None,
            stream_on_calls: 0,
            stream_off_calls: 0,
            dequeue_calls: 0,
            bitrate_requests: Vec::new(),
        }
    }

    /// Report these capabilities from `query_capabilities`.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Grant exactly this many buffers regardless of the requested count.
    #[must_use]
    pub fn with_grant(mut self, count: u32) -> Self {
        self.grant = Some(count);
        self
    }

    /// Reject the buffer request the way a driver without mmap support does.
    #[must_use]
    pub fn with_mmap_unsupported(mut self) -> Self {
        self.mmap_unsupported = true;
        self
    }

    /// Fail mapping the buffer at this index.
    #[must_use]
    pub fn with_map_failure_at(mut self, index: u32) -> Self {
        self.map_failure_at = Some(index);
        self
    }

    /// Make the crop reset fail, as on drivers without cropping.
    #[must_use]
    pub fn with_crop_unsupported(mut self) -> Self {
        self.crop_unsupported = true;
        self
    }

    /// Drop the bitrate extension unit, as on non-UVC hardware.
    #[must_use]
    pub fn without_bitrate_control(mut self) -> Self {
        self.bitrate_control = false;
        self
    }

    /// Script the capture loop. After the script is exhausted, every wait is
    /// ready and every dequeue yields a default-sized frame.
    #[must_use]
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events.into();
        self
    }

    /// Buffers currently owned by the driver side.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// The buffer the engine has dequeued and not yet returned, if any.
    #[must_use]
    pub fn claimed(&self) -> Option<u32> {
        self.claimed
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverPort for MockPort {
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities> {
        Ok(self.capabilities.clone())
    }

    fn reset_crop(&mut self) -> io::Result<()> {
        if self.crop_unsupported {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        } else {
            Ok(())
        }
    }

    fn set_format(&mut self, _width: u32, _height: u32, _format: PixelFormat) -> Result<()> {
        Ok(())
    }

    fn frame_interval(&mut self) -> Result<(u32, u32)> {
        Ok((1, 30))
    }

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<(u32, u32)> {
        Ok((numerator, denominator))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        if self.mmap_unsupported {
            return Err(CaptureError::MmapUnsupported {
                device: "/dev/video0".to_owned(),
                source: None,
            });
        }
        Ok(self.grant.unwrap_or(count))
    }

    fn map_buffer(&mut self, index: u32) -> Result<u32> {
        if self.map_failure_at == Some(index) {
            return Err(CaptureError::MmapFailed {
                index,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        assert_eq!(
            index as usize,
            self.buffers.len(),
            "buffers must be mapped in index order"
        );
        self.buffers.push(vec![0; BUFFER_LENGTH as usize]);
        Ok(BUFFER_LENGTH)
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        assert!(
            (index as usize) < self.buffers.len(),
            "queued an unmapped buffer"
        );
        if self.claimed == Some(index) {
            self.claimed = None;
        }
        // Re-queueing an already-queued buffer is how the engine restores the
        // pool on stop; keep it idempotent.
        if !self.queued.contains(&index) {
            self.queued.push_back(index);
        }
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<Dequeue> {
        self.dequeue_calls += 1;
        let size = match self.events.front() {
            Some(Event::NotReady) => {
                self.events.pop_front();
                return Ok(Dequeue::NotReady);
            }
            Some(Event::Frame(size)) => {
                let size = *size;
                self.events.pop_front();
                size
            }
            _ => FRAME_SIZE,
        };

        assert!(
            self.claimed.is_none(),
            "dequeued a second buffer while one is still claimed"
        );
        let index = self.queued.pop_front().expect("dequeue from an empty queue");
        let bytes_used = size.min(BUFFER_LENGTH);

        // Stamp the payload so tests can tell frames contain real data.
        let buffer = &mut self.buffers[index as usize];
        for (offset, byte) in buffer.iter_mut().take(bytes_used as usize).enumerate() {
            *byte = (offset as u8).wrapping_add(index as u8);
        }

        self.claimed = Some(index);
        Ok(Dequeue::Frame { index, bytes_used })
    }

    fn stream_on(&mut self) -> Result<()> {
        self.stream_on_calls += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.stream_off_calls += 1;
        Ok(())
    }

    fn wait_readable(&mut self, _timeout: Duration) -> Result<Readiness> {
        match self.events.front() {
            Some(Event::Interrupted) => {
                self.events.pop_front();
                Ok(Readiness::Interrupted)
            }
            Some(Event::TimedOut) => {
                self.events.pop_front();
                Ok(Readiness::TimedOut)
            }
            // Frame and NotReady both report readable; dequeue settles which.
            _ => Ok(Readiness::Ready),
        }
    }

    fn frame(&self, index: u32, len: u32) -> &[u8] {
        let buffer = self
            .buffers
            .get(index as usize)
            .expect("frame data requested for an unmapped buffer");
        &buffer[..(len as usize).min(buffer.len())]
    }

    fn set_bitrate(&mut self, bitrate: u32) -> io::Result<()> {
        if !self.bitrate_control {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.bitrate_requests.push(bitrate);
        Ok(())
    }

    fn unmap_all(&mut self) -> Vec<(u32, io::Error)> {
        self.buffers.clear();
        self.queued.clear();
        self.claimed = None;
        Vec::new()
    }
}
