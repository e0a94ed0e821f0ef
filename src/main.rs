//! Command-line frame grabber for UVC cameras.
//!
//! Captures compressed (or raw YUYV) frames from a V4L2 device and streams
//! them to a file or stdout. Logging goes to stderr so piping stdout into a
//! player stays clean; set `RUST_LOG` to control verbosity.

use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uvc_capture::{CaptureConfig, CaptureDevice, CaptureError, PixelFormat, StreamSink};

#[derive(Parser, Debug)]
#[command(version, about = "Capture video frames from a UVC camera")]
struct Args {
    /// Video device node.
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Frame width in pixels.
    #[arg(short = 'W', long, default_value_t = 1280)]
    width: u32,

    /// Frame height in pixels.
    #[arg(short = 'H', long, default_value_t = 720)]
    height: u32,

    /// Pixel format: YUYV, MJPEG, or H264.
    #[arg(short, long, default_value = "H264")]
    format: PixelFormat,

    /// Frame rate in frames per second.
    #[arg(short = 'p', long, default_value_t = 30)]
    fps: u32,

    /// Number of frames to capture; 0 captures until interrupted.
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// Output file name, or "stdout" to stream to standard output.
    #[arg(short, long, default_value = "stdout")]
    output: String,

    /// Directory the output file is created in.
    #[arg(short = 'l', long)]
    directory: Option<PathBuf>,

    /// Encoder bitrate in bits per second (H.264 cameras only, best-effort).
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Number of memory-mapped capture buffers to request.
    #[arg(long, default_value_t = uvc_capture::DEFAULT_BUFFERS)]
    buffers: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(Args::parse()) {
        report(&err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Print the error and its cause chain to stderr.
fn report(err: &CaptureError) {
    eprint!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprint!(": {cause}");
        source = cause.source();
    }
    eprintln!();
}

fn run(args: Args) -> uvc_capture::Result<()> {
    let config = CaptureConfig {
        device: args.device,
        width: args.width,
        height: args.height,
        fps: args.fps,
        format: args.format,
        bitrate: args.bitrate,
        buffers: args.buffers,
    };

    let writer: Box<dyn Write> = if args.output == "stdout" {
        Box::new(io::stdout().lock())
    } else {
        let path = match args.directory {
            Some(dir) => dir.join(&args.output),
            None => PathBuf::from(&args.output),
        };
        Box::new(File::create(path).map_err(CaptureError::Sink)?)
    };

    let mut sink = StreamSink::new(writer);
    if args.count > 0 {
        sink = sink.with_frame_limit(args.count);
    }

    let mut device = CaptureDevice::open(config)?;
    device.start()?;
    while device.process(&mut sink)?.is_continue() {}
    device.stop()?;

    info!(
        frames = sink.frames_written(),
        bytes = sink.bytes_written(),
        "capture complete"
    );
    sink.finish()?;
    Ok(())
}
