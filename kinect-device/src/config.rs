use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::device::KinectNodes;
use crate::processing::DepthEncoding;

pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Kernel driver nodes, scanned for when no paths are given.
    V4l { nodes: Option<KinectNodes> },
    Synthetic,
}

impl Backend {
    /// The kernel driver's Y16 node carries plain millimeters; generated
    /// frames pack a player index like the sensor's combined stream.
    pub fn default_depth_encoding(&self) -> DepthEncoding {
        match self {
            Backend::V4l { .. } => DepthEncoding::Millimeters,
            Backend::Synthetic => DepthEncoding::PlayerIndex,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KinectConfig {
    pub backend: Backend,
    pub depth_encoding: DepthEncoding,
    /// Longest wait for a single frame.
    pub frame_timeout: Duration,
    /// Granularity at which a wait checks for shutdown.
    pub poll_interval: Duration,
    pub buffer_count: u32,
    pub verbose: bool,
}

impl Default for KinectConfig {
    fn default() -> Self {
        let backend = Backend::V4l { nodes: None };
        Self {
            depth_encoding: backend.default_depth_encoding(),
            backend,
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            buffer_count: DEFAULT_BUFFER_COUNT,
            verbose: false,
        }
    }
}

/// Device options shared by the binaries.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Use a generated test pattern instead of a device
    #[arg(long)]
    pub synthetic: bool,

    /// Color video node, e.g. /dev/video4 (requires --depth-device)
    #[arg(long, requires = "depth_device")]
    pub color_device: Option<PathBuf>,

    /// Depth video node, e.g. /dev/video5 (requires --color-device)
    #[arg(long, requires = "color_device")]
    pub depth_device: Option<PathBuf>,

    /// How raw depth samples encode the distance (default: millimeters on a
    /// device, player-index with --synthetic)
    #[arg(long, value_enum)]
    pub depth_encoding: Option<DepthEncoding>,

    /// Give up on a frame after this many milliseconds
    #[arg(long, default_value_t = DEFAULT_FRAME_TIMEOUT_MS)]
    pub frame_timeout_ms: u64,

    /// Check for shutdown this often while waiting
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Frames buffered by each stream
    #[arg(long, default_value_t = DEFAULT_BUFFER_COUNT)]
    pub buffer_count: u32,

    #[arg(short, long)]
    pub verbose: bool,
}

impl DeviceArgs {
    pub fn to_config(&self) -> KinectConfig {
        let backend = if self.synthetic {
            Backend::Synthetic
        } else {
            let nodes = match (&self.color_device, &self.depth_device) {
                (Some(color), Some(depth)) => Some(KinectNodes {
                    color_path: color.to_string_lossy().into_owned(),
                    depth_path: depth.to_string_lossy().into_owned(),
                    bus_info: String::from("command line"),
                }),
                _ => None,
            };
            Backend::V4l { nodes }
        };

        KinectConfig {
            depth_encoding: self
                .depth_encoding
                .unwrap_or_else(|| backend.default_depth_encoding()),
            backend,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            buffer_count: self.buffer_count.max(1),
            verbose: self.verbose,
        }
    }
}

#[cfg(test)]
#[derive(clap::Parser)]
struct TestCli {
    #[command(flatten)]
    device: DeviceArgs,
}

#[test]
fn test_default_args_match_default_config() {
    use clap::Parser;

    let cli = TestCli::parse_from(["kinect"]);
    let config = cli.device.to_config();
    let default = KinectConfig::default();
    assert_eq!(config.backend, default.backend);
    assert_eq!(config.depth_encoding, default.depth_encoding);
    assert_eq!(config.frame_timeout, default.frame_timeout);
    assert_eq!(config.poll_interval, default.poll_interval);
    assert_eq!(config.buffer_count, 2);
}

#[test]
fn test_depth_encoding_follows_backend() {
    use clap::Parser;

    let device = TestCli::parse_from(["kinect"]).device.to_config();
    assert_eq!(device.depth_encoding, DepthEncoding::Millimeters);

    let synthetic = TestCli::parse_from(["kinect", "--synthetic"]).device.to_config();
    assert_eq!(synthetic.backend, Backend::Synthetic);
    assert_eq!(synthetic.depth_encoding, DepthEncoding::PlayerIndex);

    let packed = TestCli::parse_from(["kinect", "--depth-encoding", "player-index"]);
    assert_eq!(packed.device.to_config().depth_encoding, DepthEncoding::PlayerIndex);
}

#[test]
fn test_explicit_nodes_and_encoding() {
    use clap::Parser;

    let cli = TestCli::parse_from([
        "kinect",
        "--color-device",
        "/dev/video4",
        "--depth-device",
        "/dev/video5",
        "--depth-encoding",
        "player-index",
        "--frame-timeout-ms",
        "250",
    ]);
    let config = cli.device.to_config();
    match config.backend {
        Backend::V4l { nodes: Some(nodes) } => {
            assert_eq!(nodes.color_path, "/dev/video4");
            assert_eq!(nodes.depth_path, "/dev/video5");
        }
        other => panic!("unexpected backend {:?}", other),
    }
    assert_eq!(config.depth_encoding, DepthEncoding::PlayerIndex);
    assert_eq!(config.frame_timeout, Duration::from_millis(250));
}

#[test]
fn test_color_device_alone_is_rejected() {
    use clap::Parser;

    assert!(TestCli::try_parse_from(["kinect", "--color-device", "/dev/video4"]).is_err());
}
