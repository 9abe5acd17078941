use std::time::{Duration, Instant};

use lib::image::{ImageBuffer, Pixel};
use tracing::{debug, error, info, warn};

use crate::config::{Backend, KinectConfig};
use crate::device::open_kinect;
use crate::error::{KinectDeviceError, KinectDeviceResult};
use crate::frame::{AcquireOutcome, ColorImage, DepthImage, IntensityImage, StreamKind};
use crate::processing::{
    color_pixel, copy_frame, depth_mm_pixel, intensity_pixel_from_raw, raw_depth_pixel,
    DepthEncoding,
};
use crate::source::{FrameSource, ShutdownSignal};
use crate::synthetic::SyntheticSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Streaming,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct WaitPolicy {
    timeout: Duration,
    poll_interval: Duration,
}

/// An open color + depth pair. Streams close when the session is dropped.
pub struct KinectSession {
    color: Box<dyn FrameSource>,
    depth: Box<dyn FrameSource>,
    encoding: DepthEncoding,
    wait: WaitPolicy,
    shutdown: ShutdownSignal,
    state: SessionState,
}

impl KinectSession {
    /// Opens the device described by `config`. Nothing is retried.
    pub fn open(config: &KinectConfig, shutdown: ShutdownSignal) -> KinectDeviceResult<Self> {
        debug!(state = ?SessionState::Uninitialized, backend = ?config.backend, "opening session");
        let (color, depth): (Box<dyn FrameSource>, Box<dyn FrameSource>) = match &config.backend {
            Backend::V4l { nodes } => {
                let (color, depth) = open_kinect(nodes.clone(), config.buffer_count, config.verbose)
                    .map_err(|err| {
                        error!(%err, "kinect initialization failed");
                        err
                    })?;
                (Box::new(color), Box::new(depth))
            }
            Backend::Synthetic => (
                Box::new(SyntheticSource::pattern(StreamKind::Color, config.depth_encoding)),
                Box::new(SyntheticSource::pattern(StreamKind::Depth, config.depth_encoding)),
            ),
        };
        Ok(Self::from_sources(color, depth, config, shutdown))
    }

    /// Wraps already opened streams.
    pub fn from_sources(
        color: Box<dyn FrameSource>,
        depth: Box<dyn FrameSource>,
        config: &KinectConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        info!(
            encoding = ?config.depth_encoding,
            timeout_ms = config.frame_timeout.as_millis() as u64,
            "kinect session streaming"
        );
        Self {
            color,
            depth,
            encoding: config.depth_encoding,
            wait: WaitPolicy {
                timeout: config.frame_timeout,
                poll_interval: config.poll_interval,
            },
            shutdown,
            state: SessionState::Streaming,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn read_color(&mut self, dest: &mut ColorImage) -> KinectDeviceResult<AcquireOutcome> {
        acquire(
            self.color.as_mut(),
            &self.shutdown,
            self.wait,
            dest,
            color_pixel,
        )
    }

    /// Raw samples, player index bits included.
    pub fn read_depth_raw(&mut self, dest: &mut DepthImage) -> KinectDeviceResult<AcquireOutcome> {
        acquire(
            self.depth.as_mut(),
            &self.shutdown,
            self.wait,
            dest,
            raw_depth_pixel,
        )
    }

    pub fn read_depth_mm(&mut self, dest: &mut DepthImage) -> KinectDeviceResult<AcquireOutcome> {
        let encoding = self.encoding;
        acquire(self.depth.as_mut(), &self.shutdown, self.wait, dest, |s| {
            depth_mm_pixel(s, encoding)
        })
    }

    /// Grayscale straight from the raw stream; no-data pixels come out black.
    pub fn read_depth_intensity(
        &mut self,
        dest: &mut IntensityImage,
    ) -> KinectDeviceResult<AcquireOutcome> {
        let encoding = self.encoding;
        acquire(self.depth.as_mut(), &self.shutdown, self.wait, dest, |s| {
            intensity_pixel_from_raw(s, encoding)
        })
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.state != SessionState::Shutdown {
            self.state = SessionState::Shutdown;
            info!("kinect session shut down");
        }
    }
}

impl Drop for KinectSession {
    fn drop(&mut self) {
        self.finish();
    }
}

fn wait_for_frame(
    source: &mut dyn FrameSource,
    shutdown: &ShutdownSignal,
    wait: WaitPolicy,
) -> KinectDeviceResult<()> {
    let kind = source.kind();
    let deadline = Instant::now() + wait.timeout;
    loop {
        if shutdown.is_triggered() {
            return Err(KinectDeviceError::Cancelled(kind));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(KinectDeviceError::Timeout(kind, wait.timeout));
        }
        if source.wait_ready(wait.poll_interval.min(deadline - now))? {
            return Ok(());
        }
    }
}

/// Wait, lock, copy through `transform`, release.
fn acquire<P, F>(
    source: &mut dyn FrameSource,
    shutdown: &ShutdownSignal,
    wait: WaitPolicy,
    dest: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    transform: F,
) -> KinectDeviceResult<AcquireOutcome>
where
    P: Pixel,
    F: FnMut(&[u8]) -> P,
{
    let kind = source.kind();
    let result = wait_for_frame(source, shutdown, wait).and_then(|()| {
        let outcome = {
            let frame = source.lock_frame()?;
            copy_frame(kind, &frame, dest, transform)
        };
        source.release_frame();
        outcome
    });

    match &result {
        Ok(AcquireOutcome::Empty) => debug!(%kind, "empty frame, keeping previous image"),
        Ok(AcquireOutcome::Copied) => {}
        Err(KinectDeviceError::Cancelled(_)) => debug!(%kind, "frame wait cancelled"),
        Err(err) => warn!(%kind, %err, "frame acquisition failed"),
    }
    result
}

#[cfg(test)]
fn test_config() -> KinectConfig {
    KinectConfig {
        backend: Backend::Synthetic,
        depth_encoding: DepthEncoding::Millimeters,
        frame_timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(5),
        ..KinectConfig::default()
    }
}

#[cfg(test)]
fn scripted_session(
    color: Vec<crate::synthetic::ScriptedFrame>,
    depth: Vec<crate::synthetic::ScriptedFrame>,
) -> KinectSession {
    KinectSession::from_sources(
        Box::new(SyntheticSource::scripted(StreamKind::Color, color)),
        Box::new(SyntheticSource::scripted(StreamKind::Depth, depth)),
        &test_config(),
        ShutdownSignal::new(),
    )
}

#[test]
fn test_end_to_end_raw_2000() {
    use crate::frame::{new_depth_image, new_intensity_image};
    use crate::processing::depth_to_intensity;
    use crate::synthetic::ScriptedFrame;
    use lib::image::Rgb;

    let mut session = scripted_session(
        vec![],
        vec![
            ScriptedFrame::constant_depth(2000),
            ScriptedFrame::constant_depth(2000),
        ],
    );
    let mut depth = new_depth_image();
    assert_eq!(session.read_depth_mm(&mut depth).unwrap(), AcquireOutcome::Copied);
    assert!(depth.pixels().all(|p| p[0] == 2000));

    let mut intensity = new_intensity_image();
    depth_to_intensity(&depth, &mut intensity);
    assert_eq!(*intensity.get_pixel(639, 479), Rgb([130, 130, 130]));

    let mut direct = new_intensity_image();
    assert_eq!(
        session.read_depth_intensity(&mut direct).unwrap(),
        AcquireOutcome::Copied
    );
    assert_eq!(direct, intensity);
}

#[test]
fn test_failure_and_empty_frames_keep_destination() {
    use crate::frame::new_color_image;
    use crate::synthetic::ScriptedFrame;
    use lib::image::Rgba;

    let mut session = scripted_session(
        vec![
            ScriptedFrame::constant_color([10, 20, 30, 255]),
            ScriptedFrame::Fail("device unplugged".to_string()),
            ScriptedFrame::Empty,
        ],
        vec![],
    );
    let mut color = new_color_image();
    assert_eq!(session.read_color(&mut color).unwrap(), AcquireOutcome::Copied);
    assert!(color.pixels().all(|p| *p == Rgba([30, 20, 10, 255])));

    let err = session.read_color(&mut color).unwrap_err();
    assert!(matches!(err, KinectDeviceError::FrameRetrieval(StreamKind::Color, _)));
    assert!(color.pixels().all(|p| *p == Rgba([30, 20, 10, 255])));

    assert_eq!(session.read_color(&mut color).unwrap(), AcquireOutcome::Empty);
    assert!(color.pixels().all(|p| *p == Rgba([30, 20, 10, 255])));
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_raw_variant_keeps_player_index() {
    use crate::frame::new_depth_image;
    use crate::synthetic::ScriptedFrame;

    let raw = DepthEncoding::PlayerIndex.encode_mm(1200, 3);
    let mut session = scripted_session(
        vec![],
        vec![ScriptedFrame::constant_depth(raw), ScriptedFrame::constant_depth(raw)],
    );
    session.encoding = DepthEncoding::PlayerIndex;

    let mut depth = new_depth_image();
    session.read_depth_raw(&mut depth).unwrap();
    assert!(depth.pixels().all(|p| p[0] == raw));
    session.read_depth_mm(&mut depth).unwrap();
    assert!(depth.pixels().all(|p| p[0] == 1200));
}

#[test]
fn test_stalled_stream_times_out() {
    use crate::frame::new_depth_image;

    let mut session = scripted_session(vec![], vec![]);
    let mut depth = new_depth_image();
    let started = Instant::now();
    let err = session.read_depth_mm(&mut depth).unwrap_err();
    assert!(matches!(err, KinectDeviceError::Timeout(StreamKind::Depth, _)));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(session.state(), SessionState::Streaming);
}

#[test]
fn test_shutdown_cancels_wait() {
    use crate::frame::new_color_image;

    let mut session = scripted_session(vec![], vec![]);
    session.shutdown_signal().trigger();
    let err = session.read_color(&mut new_color_image()).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_close_transitions_to_shutdown() {
    let mut session = scripted_session(vec![], vec![]);
    assert_eq!(session.state(), SessionState::Streaming);
    session.finish();
    assert_eq!(session.state(), SessionState::Shutdown);
    session.close();
}

#[test]
fn test_synthetic_backend_opens() {
    use crate::frame::{new_color_image, new_depth_image};

    let mut session = KinectSession::open(&test_config(), ShutdownSignal::new()).unwrap();
    let mut color = new_color_image();
    let mut depth = new_depth_image();
    assert_eq!(session.read_color(&mut color).unwrap(), AcquireOutcome::Copied);
    assert_eq!(session.read_depth_mm(&mut depth).unwrap(), AcquireOutcome::Copied);
    assert_eq!(depth.get_pixel(0, 0)[0], crate::frame::DEPTH_NO_DATA);
}
