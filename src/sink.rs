//! Frame sinks.
//!
//! The capture engine hands each dequeued frame to a [`FrameSink`] and never
//! learns where the bytes end up. The sink keeps its own tallies and decides
//! when the session is done, so a caller can cap a capture at N frames (or
//! let it run forever) without the engine carrying any of that state.

use std::io::Write;

use tracing::trace;

use crate::traits::{CaptureConfig, CaptureError, Flow, Result};

/// Consumer of captured frames.
pub trait FrameSink {
    /// Accept one frame. Returns whether the capture loop should continue.
    fn write_frame(&mut self, data: &[u8], config: &CaptureConfig) -> Result<Flow>;
}

/// Sink that writes raw frame bytes to any [`Write`] destination, flushing
/// after every frame so a consumer on the other end of a pipe sees complete
/// frames promptly.
pub struct StreamSink<W: Write> {
    writer: W,
    frames_written: u64,
    bytes_written: u64,
    frame_limit: Option<u64>,
}

impl<W: Write> StreamSink<W> {
    /// Create an unbounded sink over `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frames_written: 0,
            bytes_written: 0,
            frame_limit: None,
        }
    }

    /// Stop the capture after `limit` frames have been written.
    #[must_use]
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Frames accepted so far.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Payload bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush().map_err(CaptureError::Sink)?;
        Ok(self.writer)
    }
}

impl<W: Write> FrameSink for StreamSink<W> {
    fn write_frame(&mut self, data: &[u8], _config: &CaptureConfig) -> Result<Flow> {
        self.writer.write_all(data).map_err(CaptureError::Sink)?;
        self.writer.flush().map_err(CaptureError::Sink)?;
        self.frames_written += 1;
        self.bytes_written += data.len() as u64;
        trace!(
            frame = self.frames_written,
            bytes = data.len(),
            "frame written"
        );

        match self.frame_limit {
            Some(limit) if self.frames_written >= limit => Ok(Flow::Stop),
            _ => Ok(Flow::Continue),
        }
    }
}
