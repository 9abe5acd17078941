use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use lib::v4l::buffer::Type;
use lib::v4l::device::Handle;
use lib::v4l::io::traits::{CaptureStream, Stream as _};
use lib::v4l::video::capture::Parameters;
use lib::v4l::video::Capture;
use lib::v4l::{prelude::*, Format, FourCC, Fraction};
use tracing::{debug, info, warn};

use crate::error::{KinectDeviceError, KinectDeviceResult};
use crate::frame::{LockedFrame, StreamKind, KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION};
use crate::processing::{grbg_to_bgra, uyvy_to_bgra};
use crate::source::FrameSource;

const MAX_DEVICE: usize = 42;
const KINECT_DRIVER: &str = "kinect";
/// Both nodes stream at 30 fps.
const FRAME_INTERVAL: (u32, u32) = (1, 30);

const FOURCC_UYVY: &[u8; 4] = b"UYVY";
const FOURCC_GRBG: &[u8; 4] = b"GRBG";
const FOURCC_Y16: &[u8; 4] = b"Y16 ";

/// The two video nodes the kernel driver creates for one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinectNodes {
    pub color_path: String,
    pub depth_path: String,
    pub bus_info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Color,
    Depth,
}

fn probe_node(path: &str) -> KinectDeviceResult<(NodeKind, String)> {
    let dev = Device::with_path(path)
        .map_err(|err| KinectDeviceError::DeviceNotFound(Some(err.to_string())))?;
    let caps = dev
        .query_caps()
        .map_err(|err| KinectDeviceError::QueryCapsFailed(path.to_string(), err))?;
    if caps.driver != KINECT_DRIVER {
        return Err(KinectDeviceError::DeviceNotFound(Some(format!(
            "device is a \"{}\" ({})",
            caps.card, caps.driver
        ))));
    }

    let formats = dev
        .enum_formats()
        .map_err(|err| KinectDeviceError::QueryCapsFailed(path.to_string(), err))?;
    let has = |fourcc: &[u8; 4]| formats.iter().any(|f| f.fourcc == FourCC::new(fourcc));
    if has(FOURCC_Y16) {
        Ok((NodeKind::Depth, caps.bus))
    } else if has(FOURCC_UYVY) || has(FOURCC_GRBG) {
        Ok((NodeKind::Color, caps.bus))
    } else {
        Err(KinectDeviceError::DeviceNotFound(Some(
            "no known color or depth format".to_string(),
        )))
    }
}

/// Picks the first bus, in bus order, that has both a color and a depth node.
fn pair_nodes(found: impl IntoIterator<Item = (String, NodeKind, String)>) -> Option<KinectNodes> {
    let mut by_bus: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
    for (path, kind, bus) in found {
        let entry = by_bus.entry(bus).or_default();
        match kind {
            NodeKind::Color => entry.0 = Some(path),
            NodeKind::Depth => entry.1 = Some(path),
        }
    }

    by_bus.into_iter().find_map(|(bus_info, nodes)| match nodes {
        (Some(color_path), Some(depth_path)) => Some(KinectNodes {
            color_path,
            depth_path,
            bus_info,
        }),
        _ => None,
    })
}

/// Scans `/dev/video*` for a color/depth node pair sharing one bus.
pub fn find_kinect_nodes(verbose: bool) -> KinectDeviceResult<KinectNodes> {
    let mut found = Vec::new();

    for path in (0..MAX_DEVICE).map(|i| format!("/dev/video{}", i)) {
        match probe_node(&path) {
            Ok((kind, bus)) => {
                if verbose {
                    info!(%path, ?kind, %bus, "found kinect node");
                }
                found.push((path, kind, bus));
            }
            Err(KinectDeviceError::DeviceNotFound(reason)) => {
                if verbose {
                    debug!(
                        %path,
                        reason = reason.as_deref().unwrap_or("unknown reason"),
                        "skipping device"
                    );
                }
            }
            Err(err) => warn!(%path, %err, "error on device"),
        }
    }

    pair_nodes(found).ok_or(KinectDeviceError::DeviceNotFound(None))
}

/// Copies one dequeued buffer into `staging` and returns its row pitch.
///
/// Depth is staged as delivered, color is converted to B,G,R,A. An empty
/// buffer stages nothing and reports a zero pitch.
fn stage_frame(
    kind: StreamKind,
    format: &Format,
    buf: &[u8],
    staging: &mut Vec<u8>,
) -> Result<usize, String> {
    if buf.is_empty() {
        staging.clear();
        return Ok(0);
    }

    let (img_w, img_h) = (format.width as usize, format.height as usize);
    match kind {
        StreamKind::Depth => {
            staging.clear();
            staging.extend_from_slice(buf);
            Ok(match format.stride as usize {
                0 => img_w * kind.bytes_per_pixel(),
                stride => stride,
            })
        }
        StreamKind::Color => {
            let needed = if format.fourcc == FourCC::new(FOURCC_UYVY) {
                img_w * img_h * 2
            } else if format.fourcc == FourCC::new(FOURCC_GRBG) {
                img_w * img_h
            } else {
                return Err(format!("unsupported format {}", format.fourcc));
            };
            if buf.len() < needed {
                return Err(format!(
                    "{} frame of {} bytes, expected {}",
                    format.fourcc,
                    buf.len(),
                    needed
                ));
            }

            staging.resize(img_w * img_h * kind.bytes_per_pixel(), 0);
            if format.fourcc == FourCC::new(FOURCC_UYVY) {
                uyvy_to_bgra(buf, staging);
            } else {
                grbg_to_bgra(buf, staging, img_w, img_h);
            }
            Ok(img_w * kind.bytes_per_pixel())
        }
    }
}

enum Pending {
    None,
    Frame,
    Failed(String),
}

/// The last dequeued frame, held until it is locked and released.
struct Staging {
    bits: Vec<u8>,
    pitch: usize,
    pending: Pending,
}

impl Staging {
    fn new() -> Self {
        Self {
            bits: Vec::new(),
            pitch: 0,
            pending: Pending::None,
        }
    }

    fn accept(&mut self, kind: StreamKind, format: &Format, buf: &[u8]) {
        self.pending = match stage_frame(kind, format, buf, &mut self.bits) {
            Ok(pitch) => {
                self.pitch = pitch;
                Pending::Frame
            }
            Err(reason) => Pending::Failed(reason),
        };
    }

    fn fail(&mut self, reason: String) {
        self.pending = Pending::Failed(reason);
    }

    fn lock(&mut self, kind: StreamKind, format: &Format) -> KinectDeviceResult<LockedFrame<'_>> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::Frame => Ok(LockedFrame {
                width: format.width,
                height: format.height,
                pitch: self.pitch,
                bits: &self.bits,
            }),
            Pending::Failed(reason) => Err(KinectDeviceError::FrameRetrieval(kind, reason)),
            Pending::None => Err(KinectDeviceError::NoFrameLocked(kind)),
        }
    }

    fn release(&mut self) {
        self.pending = Pending::None;
    }
}

/// Waits until `fd` has a filled buffer or `timeout` passes.
fn poll_readable(fd: libc::c_int, timeout: Duration) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ready < 0 {
        let err = std::io::Error::last_os_error();
        return match err.kind() {
            ErrorKind::Interrupted => Ok(false),
            _ => Err(err),
        };
    }
    Ok(ready > 0)
}

/// A memory-mapped V4L2 capture stream presented as a [`FrameSource`].
///
/// Every buffer is queued up front; a wait polls the node, dequeues one
/// buffer, stages it and hands it straight back to the driver.
pub struct V4lFrameSource {
    kind: StreamKind,
    format: Format,
    stream: MmapStream<'static>,
    handle: Arc<Handle>,
    staging: Staging,
}

impl V4lFrameSource {
    pub fn open(path: &str, kind: StreamKind, buffer_count: u32) -> KinectDeviceResult<Self> {
        let dev = Device::with_path(path)
            .map_err(|err| KinectDeviceError::DeviceNotFound(Some(err.to_string())))?;

        let wanted: &[&[u8; 4]] = match kind {
            StreamKind::Color => &[FOURCC_UYVY, FOURCC_GRBG],
            StreamKind::Depth => &[FOURCC_Y16],
        };
        let mut last_err = None;
        let mut format = None;
        for fourcc in wanted {
            let fourcc = FourCC::new(fourcc);
            match dev.set_format(&Format::new(KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION, fourcc)) {
                Ok(f) if f.fourcc == fourcc => {
                    format = Some(f);
                    break;
                }
                Ok(f) => debug!(%path, fourcc = %f.fourcc, "driver picked another format"),
                Err(err) => last_err = Some(err),
            }
        }
        let format = format.ok_or_else(|| {
            KinectDeviceError::SetFormatFailed(
                path.to_string(),
                last_err.unwrap_or_else(|| std::io::Error::from(ErrorKind::Unsupported)),
            )
        })?;

        let (num, den) = FRAME_INTERVAL;
        dev.set_params(&Parameters::new(Fraction::new(num, den)))
            .map_err(|err| KinectDeviceError::SetParamsFailed(path.to_string(), err))?;

        let mut stream = MmapStream::with_buffers(&dev, Type::VideoCapture, buffer_count)
            .map_err(|err| KinectDeviceError::CreateStreamFailed(path.to_string(), err))?;
        let mut queued = 0;
        for index in 0..buffer_count as usize {
            match stream.queue(index) {
                Ok(()) => queued += 1,
                Err(err) if queued > 0 => {
                    debug!(%path, queued, %err, "driver granted fewer buffers");
                    break;
                }
                Err(err) => {
                    return Err(KinectDeviceError::CreateStreamFailed(path.to_string(), err));
                }
            }
        }
        stream
            .start()
            .map_err(|err| KinectDeviceError::CreateStreamFailed(path.to_string(), err))?;

        info!(
            %path,
            %kind,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            stride = format.stride,
            buffers = queued,
            "stream opened"
        );

        Ok(Self {
            kind,
            format,
            stream,
            handle: dev.handle(),
            staging: Staging::new(),
        })
    }
}

impl FrameSource for V4lFrameSource {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn wait_ready(&mut self, timeout: Duration) -> KinectDeviceResult<bool> {
        match poll_readable(self.handle.fd(), timeout) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                self.staging.fail(err.to_string());
                return Ok(true);
            }
        }

        let index = match self.stream.dequeue() {
            Ok(index) => index,
            Err(err) => {
                self.staging.fail(err.to_string());
                return Ok(true);
            }
        };
        match (self.stream.get(index), self.stream.get_meta(index)) {
            (Some(buf), Some(meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                self.staging.accept(self.kind, &self.format, &buf[..used]);
            }
            _ => self.staging.fail(format!("driver returned unknown buffer {}", index)),
        }
        if let Err(err) = self.stream.queue(index) {
            warn!(kind = %self.kind, %err, "could not requeue buffer");
        }
        Ok(true)
    }

    fn lock_frame(&mut self) -> KinectDeviceResult<LockedFrame<'_>> {
        self.staging.lock(self.kind, &self.format)
    }

    fn release_frame(&mut self) {
        // The mmap buffer was requeued when it was staged.
        self.staging.release();
    }
}

/// Brings up both streams of a Kinect found through the kernel driver.
pub fn open_kinect(
    nodes: Option<KinectNodes>,
    buffer_count: u32,
    verbose: bool,
) -> KinectDeviceResult<(V4lFrameSource, V4lFrameSource)> {
    let nodes = match nodes {
        Some(nodes) => nodes,
        None => find_kinect_nodes(verbose)
            .map_err(|err| KinectDeviceError::initialize("initialize", err.to_string()))?,
    };
    info!(
        color = %nodes.color_path,
        depth = %nodes.depth_path,
        bus = %nodes.bus_info,
        "using kinect"
    );

    let color = V4lFrameSource::open(&nodes.color_path, StreamKind::Color, buffer_count)
        .map_err(|err| KinectDeviceError::initialize("open color stream", err.to_string()))?;
    let depth = V4lFrameSource::open(&nodes.depth_path, StreamKind::Depth, buffer_count)
        .map_err(|err| KinectDeviceError::initialize("open depth stream", err.to_string()))?;
    Ok((color, depth))
}

#[cfg(test)]
fn node(path: &str, kind: NodeKind, bus: &str) -> (String, NodeKind, String) {
    (path.to_string(), kind, bus.to_string())
}

#[test]
fn test_pair_nodes_skips_incomplete_buses() {
    let found = vec![
        node("/dev/video0", NodeKind::Color, "usb-0000:00:14.0-3"),
        node("/dev/video4", NodeKind::Depth, "usb-0000:00:14.0-2"),
        node("/dev/video5", NodeKind::Color, "usb-0000:00:14.0-2"),
        node("/dev/video2", NodeKind::Depth, "usb-0000:00:14.0-4"),
    ];
    let nodes = pair_nodes(found).unwrap();
    assert_eq!(nodes.color_path, "/dev/video5");
    assert_eq!(nodes.depth_path, "/dev/video4");
    assert_eq!(nodes.bus_info, "usb-0000:00:14.0-2");
}

#[test]
fn test_pair_nodes_prefers_lowest_bus() {
    let found = vec![
        node("/dev/video6", NodeKind::Color, "usb-2"),
        node("/dev/video7", NodeKind::Depth, "usb-2"),
        node("/dev/video2", NodeKind::Color, "usb-1"),
        node("/dev/video3", NodeKind::Depth, "usb-1"),
    ];
    assert_eq!(pair_nodes(found).unwrap().bus_info, "usb-1");
    assert_eq!(pair_nodes(vec![node("/dev/video0", NodeKind::Depth, "usb-1")]), None);
}

#[test]
fn test_stage_depth_uses_driver_stride() {
    let mut format = Format::new(4, 2, FourCC::new(FOURCC_Y16));
    format.stride = 12;
    let buf: Vec<u8> = (0..24).collect();
    let mut staging = Vec::new();
    assert_eq!(stage_frame(StreamKind::Depth, &format, &buf, &mut staging), Ok(12));
    assert_eq!(staging, buf);

    format.stride = 0;
    assert_eq!(stage_frame(StreamKind::Depth, &format, &buf[..16], &mut staging), Ok(8));
}

#[test]
fn test_stage_uyvy_converts_to_bgra() {
    let format = Format::new(2, 1, FourCC::new(FOURCC_UYVY));
    let mut staging = Vec::new();
    let pitch = stage_frame(StreamKind::Color, &format, &[128, 100, 128, 200], &mut staging);
    assert_eq!(pitch, Ok(8));
    assert_eq!(staging, [100, 100, 100, 255, 200, 200, 200, 255]);
}

#[test]
fn test_empty_buffer_locks_as_empty_frame() {
    use crate::frame::AcquireOutcome;
    use crate::processing::{copy_frame, raw_depth_pixel};
    use lib::image::{ImageBuffer, Luma};

    let format = Format::new(4, 2, FourCC::new(FOURCC_Y16));
    let mut staging = Staging::new();
    staging.accept(StreamKind::Depth, &format, &[]);
    let frame = staging.lock(StreamKind::Depth, &format).unwrap();
    assert_eq!(frame.pitch, 0);

    let mut dest = ImageBuffer::from_pixel(4, 2, Luma([7u16]));
    let outcome = copy_frame(StreamKind::Depth, &frame, &mut dest, raw_depth_pixel).unwrap();
    assert_eq!(outcome, AcquireOutcome::Empty);
    assert!(dest.pixels().all(|p| p[0] == 7));
}

#[test]
fn test_short_bayer_frame_fails_retrieval() {
    let format = Format::new(4, 2, FourCC::new(FOURCC_GRBG));
    let mut staging = Staging::new();
    staging.accept(StreamKind::Color, &format, &[0u8; 6]);
    assert!(matches!(
        staging.lock(StreamKind::Color, &format),
        Err(KinectDeviceError::FrameRetrieval(StreamKind::Color, _))
    ));

    staging.accept(StreamKind::Color, &format, &[10, 200, 10, 200, 30, 20, 30, 20]);
    let frame = staging.lock(StreamKind::Color, &format).unwrap();
    assert_eq!(frame.pitch, 16);
    assert_eq!(&frame.bits[..4], [30, 15, 200, 255]);
    staging.release();
    assert!(matches!(
        staging.lock(StreamKind::Color, &format),
        Err(KinectDeviceError::NoFrameLocked(StreamKind::Color))
    ));
}
