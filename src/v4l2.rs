//! Production [`DriverPort`] speaking the V4L2 streaming-capture ABI and the
//! UVC H.264 extension unit.
//!
//! The engine drives the buffer protocol itself, so this module uses the
//! `v4l` crate's low-level surface (`v4l::v4l2` syscall wrappers, `vidioc`
//! request codes, `v4l_sys` struct layouts) rather than its high-level
//! streams, plus `libc` for `select(2)` and the mmap flags. The extension
//! unit ABI is declared by hand: no crate ships it, and the layouts must
//! match the wire format bit-for-bit.
//!
//! All `unsafe` in the crate lives here: zero-initialized ioctl argument
//! structs, union field access, the driver-shared mappings, and the raw
//! readiness wait.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::slice;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::capability::Flags;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_capability, v4l2_crop,
    v4l2_cropcap, v4l2_field_V4L2_FIELD_INTERLACED, v4l2_format,
    v4l2_memory_V4L2_MEMORY_MMAP, v4l2_requestbuffers, v4l2_streamparm,
};

use crate::traits::{
    CaptureError, Dequeue, DeviceCapabilities, DriverPort, PixelFormat, Readiness, Result,
};

/// UVC `SET_CUR` request code.
const UVC_SET_CUR: u8 = 0x01;
/// UVC `GET_CUR` request code.
const UVC_GET_CUR: u8 = 0x81;
/// H.264 extension unit id on the C920 camera family.
const UVCX_UNIT_ID: u8 = 12;
/// Bitrate-layers control selector within the extension unit.
const UVCX_BITRATE_LAYERS: u8 = 0x0e;

/// `struct uvc_xu_control_query` from `linux/uvcvideo.h`.
#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    size: u16,
    data: *mut u8,
}

/// `uvcx_bitrate_layers_t`: the 10-byte control block carried by the
/// bitrate-layers selector. Packed on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
struct UvcxBitrateLayers {
    layer_id: u16,
    peak_bitrate: u32,
    average_bitrate: u32,
}

/// `_IOWR(ty, nr, size)` from `asm-generic/ioctl.h`.
const fn iowr(ty: u8, nr: u8, size: usize) -> u64 {
    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    ((IOC_READ | IOC_WRITE) << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64
}

/// `UVCIOC_CTRL_QUERY` = `_IOWR('u', 0x21, struct uvc_xu_control_query)`.
const UVCIOC_CTRL_QUERY: u64 = iowr(b'u', 0x21, mem::size_of::<UvcXuControlQuery>());

/// Issue an ioctl, restarting on `EINTR` the way the V4L2 docs recommend.
macro_rules! ioctl_retry {
    ($fd:expr, $request:expr, $arg:expr) => {{
        loop {
            // Safety: callers pass a pointer to a properly initialized
            // argument struct that outlives the call.
            match unsafe { v4l2::ioctl($fd, $request, $arg) } {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                other => break other,
            }
        }
    }};
}

/// Erase an argument struct's type for the ioctl wrapper.
fn as_arg<T>(value: &mut T) -> *mut c_void {
    (value as *mut T).cast()
}

/// Decode a fixed-size, NUL-padded identification string.
fn fixed_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or(bytes)).into_owned()
}

/// One driver-shared memory mapping.
#[derive(Debug)]
struct Mapping {
    index: u32,
    ptr: *mut c_void,
    length: usize,
}

/// Driver port backed by a real V4L2 character device.
///
/// Owns the file descriptor (opened `O_RDWR | O_NONBLOCK`, closed on drop)
/// and the raw buffer mappings. The handle is never duplicated.
#[derive(Debug)]
pub struct V4l2Port {
    fd: c_int,
    path: PathBuf,
    mappings: Vec<Mapping>,
}

impl V4l2Port {
    /// Open the device node read/write in non-blocking mode.
    pub fn open(path: &Path) -> Result<Self> {
        let fd = v4l2::open(path, libc::O_RDWR | libc::O_NONBLOCK).map_err(|source| {
            CaptureError::OpenFailed {
                device: path.display().to_string(),
                source,
            }
        })?;
        debug!(device = %path.display(), fd, "opened device");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
            mappings: Vec::new(),
        })
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn bitrate_query(&mut self, query: u8, layers: &mut UvcxBitrateLayers) -> io::Result<()> {
        let mut ctrl = UvcXuControlQuery {
            unit: UVCX_UNIT_ID,
            selector: UVCX_BITRATE_LAYERS,
            query,
            size: mem::size_of::<UvcxBitrateLayers>() as u16,
            data: (layers as *mut UvcxBitrateLayers).cast(),
        };
        ioctl_retry!(self.fd, UVCIOC_CTRL_QUERY as _, as_arg(&mut ctrl))
    }
}

impl DriverPort for V4l2Port {
    fn query_capabilities(&mut self) -> Result<DeviceCapabilities> {
        // Safety: v4l2_capability is plain old data, fully written by the
        // driver on success.
        let mut caps: v4l2_capability = unsafe { mem::zeroed() };
        ioctl_retry!(self.fd, vidioc::VIDIOC_QUERYCAP, as_arg(&mut caps)).map_err(|err| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                CaptureError::NotAV4l2Device {
                    device: self.name(),
                    source: None,
                }
            } else {
                CaptureError::NotAV4l2Device {
                    device: self.name(),
                    source: Some(err),
                }
            }
        })?;

        let flags = Flags::from_bits_truncate(caps.capabilities);
        Ok(DeviceCapabilities {
            driver: fixed_cstr(&caps.driver),
            card: fixed_cstr(&caps.card),
            bus_info: fixed_cstr(&caps.bus_info),
            can_capture: flags.contains(Flags::VIDEO_CAPTURE),
            can_stream: flags.contains(Flags::STREAMING),
        })
    }

    fn reset_crop(&mut self) -> io::Result<()> {
        // Safety: zero-initialized POD argument structs.
        let mut cropcap: v4l2_cropcap = unsafe { mem::zeroed() };
        cropcap.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        ioctl_retry!(self.fd, vidioc::VIDIOC_CROPCAP, as_arg(&mut cropcap))?;

        let mut crop: v4l2_crop = unsafe { mem::zeroed() };
        crop.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        crop.c = cropcap.defrect;
        ioctl_retry!(self.fd, vidioc::VIDIOC_S_CROP, as_arg(&mut crop))
    }

    fn set_format(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        // Safety: zero-initialized POD; the pix member is the active union
        // variant for the video-capture buffer type.
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let pix = unsafe { &mut fmt.fmt.pix };
        pix.width = width;
        pix.height = height;
        pix.pixelformat = u32::from_le_bytes(format.fourcc().repr);
        pix.field = v4l2_field_V4L2_FIELD_INTERLACED;

        ioctl_retry!(self.fd, vidioc::VIDIOC_S_FMT, as_arg(&mut fmt)).map_err(|source| {
            CaptureError::UnsupportedFormat {
                format: format.to_string(),
                source: Some(source),
            }
        })
    }

    fn frame_interval(&mut self) -> Result<(u32, u32)> {
        // Safety: zero-initialized POD; capture is the active union variant.
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        ioctl_retry!(self.fd, vidioc::VIDIOC_G_PARM, as_arg(&mut parm))
            .map_err(CaptureError::StreamParamGetFailed)?;
        let tpf = unsafe { parm.parm.capture.timeperframe };
        Ok((tpf.numerator, tpf.denominator))
    }

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<(u32, u32)> {
        // Safety: zero-initialized POD; capture is the active union variant.
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        {
            let capture = unsafe { &mut parm.parm.capture };
            capture.timeperframe.numerator = numerator;
            capture.timeperframe.denominator = denominator;
        }
        ioctl_retry!(self.fd, vidioc::VIDIOC_S_PARM, as_arg(&mut parm))
            .map_err(CaptureError::StreamParamSetFailed)?;
        // The driver writes the interval it actually applied back into parm.
        let tpf = unsafe { parm.parm.capture.timeperframe };
        Ok((tpf.numerator, tpf.denominator))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        // Safety: zero-initialized POD argument struct.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        ioctl_retry!(self.fd, vidioc::VIDIOC_REQBUFS, as_arg(&mut req)).map_err(|err| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                CaptureError::MmapUnsupported {
                    device: self.name(),
                    source: None,
                }
            } else {
                CaptureError::MmapUnsupported {
                    device: self.name(),
                    source: Some(err),
                }
            }
        })?;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> Result<u32> {
        // Safety: zero-initialized POD argument struct.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        buf.index = index;
        ioctl_retry!(self.fd, vidioc::VIDIOC_QUERYBUF, as_arg(&mut buf))
            .map_err(|source| CaptureError::MmapFailed { index, source })?;

        let length = buf.length;
        let offset = unsafe { buf.m.offset };
        // Safety: the driver reported a valid offset/length pair for its own
        // buffer; the mapping is shared with it for the pool's lifetime.
        let ptr = unsafe {
            v4l2::mmap(
                std::ptr::null_mut(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|source| CaptureError::MmapFailed { index, source })?;

        self.mappings.push(Mapping {
            index,
            ptr,
            length: length as usize,
        });
        Ok(length)
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        // Safety: zero-initialized POD argument struct.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        buf.index = index;
        ioctl_retry!(self.fd, vidioc::VIDIOC_QBUF, as_arg(&mut buf))
            .map_err(CaptureError::QueueFailed)
    }

    fn dequeue_buffer(&mut self) -> Result<Dequeue> {
        // Safety: zero-initialized POD argument struct; the driver fills in
        // index and bytesused on success.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        match ioctl_retry!(self.fd, vidioc::VIDIOC_DQBUF, as_arg(&mut buf)) {
            Ok(()) => Ok(Dequeue::Frame {
                index: buf.index,
                bytes_used: buf.bytesused,
            }),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Dequeue::NotReady),
            Err(err) => Err(CaptureError::DequeueFailed(err)),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut kind = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        ioctl_retry!(self.fd, vidioc::VIDIOC_STREAMON, as_arg(&mut kind))
            .map_err(CaptureError::StreamOnFailed)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut kind = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        ioctl_retry!(self.fd, vidioc::VIDIOC_STREAMOFF, as_arg(&mut kind))
            .map_err(CaptureError::StreamOffFailed)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness> {
        // Safety: fd_set is POD; FD_ZERO/FD_SET only touch the set.
        let mut fds = unsafe {
            let mut fds: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut fds);
            libc::FD_SET(self.fd, &mut fds);
            fds
        };
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        };

        // Safety: the descriptor is open and fds/tv outlive the call.
        let ready = unsafe {
            libc::select(
                self.fd + 1,
                &mut fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        match ready {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(Readiness::Interrupted)
                } else {
                    Err(CaptureError::WaitFailed(err))
                }
            }
            0 => Ok(Readiness::TimedOut),
            _ => Ok(Readiness::Ready),
        }
    }

    fn frame(&self, index: u32, len: u32) -> &[u8] {
        let mapping = self
            .mappings
            .iter()
            .find(|mapping| mapping.index == index)
            .expect("frame data requested for an unmapped buffer");
        let len = (len as usize).min(mapping.length);
        // Safety: the mapping is valid for `length` bytes until unmapped,
        // and the driver has released this buffer to us via dequeue.
        unsafe { slice::from_raw_parts(mapping.ptr.cast::<u8>(), len) }
    }

    fn set_bitrate(&mut self, bitrate: u32) -> io::Result<()> {
        let mut layers = UvcxBitrateLayers::default();
        self.bitrate_query(UVC_GET_CUR, &mut layers)?;
        let peak = layers.peak_bitrate;
        let average = layers.average_bitrate;
        debug!(peak, average, "bitrate before");

        layers.peak_bitrate = bitrate;
        layers.average_bitrate = bitrate;
        self.bitrate_query(UVC_SET_CUR, &mut layers)?;

        self.bitrate_query(UVC_GET_CUR, &mut layers)?;
        let peak = layers.peak_bitrate;
        let average = layers.average_bitrate;
        debug!(peak, average, "bitrate after");
        Ok(())
    }

    fn unmap_all(&mut self) -> Vec<(u32, io::Error)> {
        let mut failures = Vec::new();
        for mapping in self.mappings.drain(..) {
            // Safety: each mapping was created by mmap with exactly this
            // address and length, and nothing references it anymore.
            if let Err(err) = unsafe { v4l2::munmap(mapping.ptr, mapping.length) } {
                failures.push((mapping.index, err));
            }
        }
        failures
    }
}

impl Drop for V4l2Port {
    fn drop(&mut self) {
        // Covers failed constructions: whatever is still mapped goes first,
        // then the descriptor.
        for (index, err) in self.unmap_all() {
            warn!(index, error = %err, "failed to unmap buffer");
        }
        if let Err(err) = v4l2::close(self.fd) {
            warn!(device = %self.path.display(), error = %err, "failed to close device");
        }
    }
}
