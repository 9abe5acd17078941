use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

use crate::error::{KinectDeviceError, KinectDeviceResult};
use crate::frame::{
    LockedFrame, StreamKind, DEPTH_NO_DATA, KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION,
};
use crate::processing::DepthEncoding;
use crate::source::FrameSource;

/// Width of the sentinel border in generated depth frames.
const PATTERN_BORDER: u32 = 8;
/// Generated frames go out at roughly 30 fps.
const PATTERN_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone)]
pub enum ScriptedFrame {
    Frame { pitch: usize, bits: Vec<u8> },
    Empty,
    Fail(String),
    Stall,
}

impl ScriptedFrame {
    /// Tightly packed depth frame, rows of 640 raw samples.
    pub fn depth(samples: &[u16]) -> Self {
        ScriptedFrame::Frame {
            pitch: KINECT_X_RESOLUTION as usize * 2,
            bits: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }

    pub fn constant_depth(raw: u16) -> Self {
        Self::depth(&vec![raw; (KINECT_X_RESOLUTION * KINECT_Y_RESOLUTION) as usize])
    }

    pub fn constant_color(bgra: [u8; 4]) -> Self {
        let pixels = (KINECT_X_RESOLUTION * KINECT_Y_RESOLUTION) as usize;
        ScriptedFrame::Frame {
            pitch: KINECT_X_RESOLUTION as usize * 4,
            bits: bgra.iter().copied().cycle().take(pixels * 4).collect(),
        }
    }
}

enum Mode {
    Pattern { tick: u32, encoding: DepthEncoding },
    Scripted(VecDeque<ScriptedFrame>),
}

enum Pending {
    None,
    Frame,
    Failed(String),
}

/// Software stand-in for a device stream.
pub struct SyntheticSource {
    kind: StreamKind,
    mode: Mode,
    pitch: usize,
    staging: Vec<u8>,
    pending: Pending,
    released: usize,
}

impl SyntheticSource {
    /// Endless moving test pattern.
    pub fn pattern(kind: StreamKind, encoding: DepthEncoding) -> Self {
        Self::with_mode(kind, Mode::Pattern { tick: 0, encoding })
    }

    /// Plays back `frames` in order, then stalls forever.
    pub fn scripted(kind: StreamKind, frames: impl IntoIterator<Item = ScriptedFrame>) -> Self {
        Self::with_mode(kind, Mode::Scripted(frames.into_iter().collect()))
    }

    fn with_mode(kind: StreamKind, mode: Mode) -> Self {
        Self {
            kind,
            mode,
            pitch: 0,
            staging: Vec::new(),
            pending: Pending::None,
            released: 0,
        }
    }

    /// Number of frames handed back through `release_frame`.
    pub fn released_frames(&self) -> usize {
        self.released
    }

    fn render_pattern(&mut self, tick: u32, encoding: DepthEncoding) {
        let (img_w, img_h) = (KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION);
        let bpp = self.kind.bytes_per_pixel();
        self.pitch = img_w as usize * bpp;
        self.staging.resize(self.pitch * img_h as usize, 0);

        for (y, line) in self.staging.chunks_exact_mut(self.pitch).enumerate() {
            let y = y as u32;
            for (x, px) in line.chunks_exact_mut(bpp).enumerate() {
                let x = x as u32;
                match self.kind {
                    StreamKind::Color => {
                        let b = ((x + tick) % 256) as u8;
                        let g = ((y + tick / 2) % 256) as u8;
                        let r = ((x + y) / 5 % 256) as u8;
                        px.copy_from_slice(&[b, g, r, 255]);
                    }
                    StreamKind::Depth => {
                        let border = x < PATTERN_BORDER
                            || y < PATTERN_BORDER
                            || x >= img_w - PATTERN_BORDER
                            || y >= img_h - PATTERN_BORDER;
                        let raw = if border {
                            DEPTH_NO_DATA
                        } else {
                            let mm = 400 + ((x * 8 + tick * 16) % 3600) as u16;
                            encoding.encode_mm(mm, (y / 60) as u8)
                        };
                        px.copy_from_slice(&raw.to_le_bytes());
                    }
                }
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn wait_ready(&mut self, timeout: Duration) -> KinectDeviceResult<bool> {
        let next = match &mut self.mode {
            Mode::Pattern { tick, encoding } => {
                std::thread::sleep(PATTERN_INTERVAL.min(timeout));
                let (current, encoding) = (*tick, *encoding);
                *tick = tick.wrapping_add(1);
                self.render_pattern(current, encoding);
                self.pending = Pending::Frame;
                return Ok(true);
            }
            Mode::Scripted(frames) => frames.pop_front(),
        };

        match next {
            Some(ScriptedFrame::Frame { pitch, bits }) => {
                self.pitch = pitch;
                self.staging = bits;
                self.pending = Pending::Frame;
            }
            Some(ScriptedFrame::Empty) => {
                self.pitch = 0;
                self.staging.clear();
                self.pending = Pending::Frame;
            }
            Some(ScriptedFrame::Fail(reason)) => self.pending = Pending::Failed(reason),
            Some(ScriptedFrame::Stall) | None => {
                std::thread::sleep(timeout);
                return Ok(false);
            }
        }
        trace!(kind = %self.kind, "synthetic frame ready");
        Ok(true)
    }

    fn lock_frame(&mut self) -> KinectDeviceResult<LockedFrame<'_>> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::Frame => Ok(LockedFrame {
                width: KINECT_X_RESOLUTION,
                height: KINECT_Y_RESOLUTION,
                pitch: self.pitch,
                bits: &self.staging,
            }),
            Pending::Failed(reason) => Err(KinectDeviceError::FrameRetrieval(self.kind, reason)),
            Pending::None => Err(KinectDeviceError::NoFrameLocked(self.kind)),
        }
    }

    fn release_frame(&mut self) {
        self.released += 1;
    }
}

#[test]
fn test_pattern_depth_has_sentinel_border() {
    let mut source = SyntheticSource::pattern(StreamKind::Depth, DepthEncoding::PlayerIndex);
    assert!(source.wait_ready(Duration::from_millis(1)).unwrap());
    let frame = source.lock_frame().unwrap();
    assert_eq!(frame.pitch, 640 * 2);
    assert_eq!(frame.bits.len(), 640 * 480 * 2);
    assert_eq!(u16::from_le_bytes([frame.bits[0], frame.bits[1]]), DEPTH_NO_DATA);

    let center = (240 * 640 + 320) * 2;
    let raw = u16::from_le_bytes([frame.bits[center], frame.bits[center + 1]]);
    let mm = DepthEncoding::PlayerIndex.decode_mm(raw);
    assert!((400..4000).contains(&mm));

    source.release_frame();
    assert_eq!(source.released_frames(), 1);
}

#[test]
fn test_scripted_stall_times_out() {
    let mut source = SyntheticSource::scripted(StreamKind::Color, [ScriptedFrame::Stall]);
    assert!(!source.wait_ready(Duration::from_millis(1)).unwrap());
    assert!(matches!(
        source.lock_frame(),
        Err(KinectDeviceError::NoFrameLocked(StreamKind::Color))
    ));
}
