use lib::image::{ImageBuffer, Luma, RgbImage, RgbaImage};

pub const KINECT_X_RESOLUTION: u32 = 640;
pub const KINECT_Y_RESOLUTION: u32 = 480;

pub const COLOR_BYTES_PER_PIXEL: usize = 4;
pub const DEPTH_BYTES_PER_PIXEL: usize = 2;

/// Raw depth value the device reports when a pixel has no reading.
pub const DEPTH_NO_DATA: u16 = 65535;

pub type ColorImage = RgbaImage;
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;
pub type IntensityImage = RgbImage;

pub fn new_color_image() -> ColorImage {
    ColorImage::new(KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION)
}

pub fn new_depth_image() -> DepthImage {
    DepthImage::new(KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION)
}

pub fn new_intensity_image() -> IntensityImage {
    IntensityImage::new(KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            StreamKind::Color => COLOR_BYTES_PER_PIXEL,
            StreamKind::Depth => DEPTH_BYTES_PER_PIXEL,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Color => f.write_str("color"),
            StreamKind::Depth => f.write_str("depth"),
        }
    }
}

/// Frame data as exposed by a source between lock and release.
///
/// Color frames carry B,G,R,A bytes, depth frames little-endian `u16`
/// samples. `pitch` is the number of bytes per row and is zero when the
/// device had nothing to deliver this cycle.
#[derive(Debug, Clone, Copy)]
pub struct LockedFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
    pub bits: &'a [u8],
}

impl<'a> LockedFrame<'a> {
    pub fn is_empty(&self) -> bool {
        self.pitch == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every pixel of the destination was overwritten.
    Copied,
    /// Zero pitch: the destination keeps its previous contents.
    Empty,
}
