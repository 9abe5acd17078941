pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod logger;
pub mod processing;
pub mod session;
pub mod source;
pub mod synthetic;

pub use config::{DeviceArgs, KinectConfig};
pub use error::{KinectDeviceError, KinectDeviceResult};
pub use session::{KinectSession, SessionState};
pub use source::ShutdownSignal;
