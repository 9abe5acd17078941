use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::KinectDeviceResult;
use crate::frame::{LockedFrame, StreamKind};

/// One hardware stream: a ready signal plus lock/release of the next frame.
pub trait FrameSource {
    fn kind(&self) -> StreamKind;

    /// Waits up to `timeout` for the stream to signal a new frame.
    ///
    /// Returns `Ok(false)` when the timeout elapsed without a signal.
    fn wait_ready(&mut self, timeout: Duration) -> KinectDeviceResult<bool>;

    /// Locks the frame announced by the last successful `wait_ready`.
    fn lock_frame(&mut self) -> KinectDeviceResult<LockedFrame<'_>>;

    /// Hands the locked frame back to the stream.
    fn release_frame(&mut self);
}

/// Process wide request to stop waiting on the device.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Triggers the signal on Ctrl+C.
    pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
        let signal = self.clone();
        ctrlc::set_handler(move || signal.trigger())
    }
}

#[test]
fn test_shutdown_signal_is_shared() {
    let signal = ShutdownSignal::new();
    let other = signal.clone();
    assert!(!other.is_triggered());
    signal.trigger();
    assert!(other.is_triggered());
}
