use lib::image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};

use crate::error::{KinectDeviceError, KinectDeviceResult};
use crate::frame::{
    AcquireOutcome, DepthImage, IntensityImage, LockedFrame, StreamKind, DEPTH_NO_DATA,
};

/// Depth in millimeters that maps to the darkest intensity.
pub const DEPTH_INTENSITY_RANGE_MM: u32 = 0x0fff;

pub const PLAYER_INDEX_BITS: u32 = 3;

/// How a raw depth sample packs the distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DepthEncoding {
    /// Depth in the upper 13 bits, player index in the lower 3.
    #[default]
    PlayerIndex,
    /// Samples are already millimeters.
    Millimeters,
}

impl DepthEncoding {
    pub fn decode_mm(self, raw: u16) -> u16 {
        match self {
            DepthEncoding::PlayerIndex => raw >> PLAYER_INDEX_BITS,
            DepthEncoding::Millimeters => raw,
        }
    }

    pub fn encode_mm(self, mm: u16, player: u8) -> u16 {
        match self {
            DepthEncoding::PlayerIndex => {
                (mm << PLAYER_INDEX_BITS) | (player as u16 & ((1 << PLAYER_INDEX_BITS) - 1))
            }
            DepthEncoding::Millimeters => mm,
        }
    }
}

/// Linear depth to gray mapping, `255 - floor(256 * mm / 4095)`.
///
/// The quotient is truncated to 8 bits before the subtraction, so depths at
/// or past 4095 mm wrap around instead of saturating.
pub fn depth_intensity(mm: u16) -> u8 {
    let scaled = (256 * mm as u32) / DEPTH_INTENSITY_RANGE_MM;
    255 - scaled as u8
}

pub fn intensity_pixel(mm: u16) -> Rgb<u8> {
    let v = depth_intensity(mm);
    Rgb([v, v, v])
}

pub fn raw_depth_sample(sample: &[u8]) -> u16 {
    u16::from_le_bytes([sample[0], sample[1]])
}

/// B,G,R,A device bytes into an RGBA pixel.
pub fn color_pixel(sample: &[u8]) -> Rgba<u8> {
    Rgba([sample[2], sample[1], sample[0], sample[3]])
}

pub fn raw_depth_pixel(sample: &[u8]) -> Luma<u16> {
    Luma([raw_depth_sample(sample)])
}

pub fn depth_mm_pixel(sample: &[u8], encoding: DepthEncoding) -> Luma<u16> {
    Luma([encoding.decode_mm(raw_depth_sample(sample))])
}

/// Gray pixel straight from a raw sample; the no-data sentinel renders black.
pub fn intensity_pixel_from_raw(sample: &[u8], encoding: DepthEncoding) -> Rgb<u8> {
    let raw = raw_depth_sample(sample);
    if raw == DEPTH_NO_DATA {
        Rgb([0, 0, 0])
    } else {
        intensity_pixel(encoding.decode_mm(raw))
    }
}

/// Converts a millimeter depth image to grayscale.
///
/// Unlike [`intensity_pixel_from_raw`] there is no sentinel check here: a
/// 65535 that made it into `depth` goes through the same formula.
pub fn depth_to_intensity(depth: &DepthImage, intensity: &mut IntensityImage) {
    for (src, dst) in depth.pixels().zip(intensity.pixels_mut()) {
        *dst = intensity_pixel(src[0]);
    }
}

/// Copies a locked frame into `dest`, one `transform` call per source pixel.
///
/// The frame is validated before the first write, so on error `dest` is
/// untouched. A zero pitch frame copies nothing.
pub fn copy_frame<P, F>(
    kind: StreamKind,
    frame: &LockedFrame,
    dest: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    mut transform: F,
) -> KinectDeviceResult<AcquireOutcome>
where
    P: Pixel,
    F: FnMut(&[u8]) -> P,
{
    if frame.is_empty() {
        return Ok(AcquireOutcome::Empty);
    }

    let (img_w, img_h) = dest.dimensions();
    if (frame.width, frame.height) != (img_w, img_h) {
        return Err(KinectDeviceError::ResolutionMismatch {
            kind,
            width: frame.width,
            height: frame.height,
            expected_width: img_w,
            expected_height: img_h,
        });
    }

    let bpp = kind.bytes_per_pixel();
    let (img_w, img_h) = (img_w as usize, img_h as usize);
    let row_bytes = img_w * bpp;
    let needed = frame.pitch * img_h.saturating_sub(1) + row_bytes;
    if frame.pitch < row_bytes || frame.bits.len() < needed {
        return Err(KinectDeviceError::ShortFrame {
            kind,
            pitch: frame.pitch,
            len: frame.bits.len(),
            needed,
        });
    }

    for (y, line) in frame.bits.chunks(frame.pitch).enumerate().take(img_h) {
        for (x, sample) in line[..row_bytes].chunks_exact(bpp).enumerate() {
            dest.put_pixel(x as u32, y as u32, transform(sample));
        }
    }
    Ok(AcquireOutcome::Copied)
}

/// UYVY 4:2:2 into B,G,R,A bytes (BT.601).
pub fn uyvy_to_bgra(src: &[u8], dst: &mut [u8]) {
    for (quad, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(8)) {
        let u = quad[0] as f32 - 128.0;
        let v = quad[2] as f32 - 128.0;
        for (y, px) in [quad[1], quad[3]].into_iter().zip(out.chunks_exact_mut(4)) {
            let y = y as f32;
            px[0] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            px[1] = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            px[2] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            px[3] = 255;
        }
    }
}

/// Bayer GRBG into B,G,R,A bytes, one color per 2x2 block.
pub fn grbg_to_bgra(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    for y in (0..height.saturating_sub(1)).step_by(2) {
        for x in (0..width.saturating_sub(1)).step_by(2) {
            let g0 = src[y * width + x] as u16;
            let r = src[y * width + x + 1];
            let b = src[(y + 1) * width + x];
            let g1 = src[(y + 1) * width + x + 1] as u16;
            let g = ((g0 + g1) / 2) as u8;
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let offset = ((y + dy) * width + x + dx) * 4;
                dst[offset..offset + 4].copy_from_slice(&[b, g, r, 255]);
            }
        }
    }
}

#[cfg(test)]
fn depth_frame_bytes(samples: &[u16], width: usize, pitch: usize) -> Vec<u8> {
    let mut bits = vec![0xaau8; pitch * (samples.len() / width)];
    for (y, row) in samples.chunks(width).enumerate() {
        for (x, s) in row.iter().enumerate() {
            let offset = y * pitch + x * 2;
            bits[offset..offset + 2].copy_from_slice(&s.to_le_bytes());
        }
    }
    bits
}

#[test]
fn test_depth_intensity_boundaries() {
    assert_eq!(depth_intensity(0), 255);
    assert_eq!(depth_intensity(15), 255);
    assert_eq!(depth_intensity(16), 254);
    assert_eq!(depth_intensity(2000), 130);
    assert_eq!(depth_intensity(4079), 1);
    assert_eq!(depth_intensity(4094), 0);
    // 256 truncates to 0 in eight bits
    assert_eq!(depth_intensity(4095), 255);
    assert_eq!(depth_intensity(8000), 11);
}

#[test]
fn test_decode_player_index() {
    assert_eq!(DepthEncoding::PlayerIndex.decode_mm(2000 << 3 | 5), 2000);
    assert_eq!(DepthEncoding::PlayerIndex.decode_mm(7), 0);
    assert_eq!(DepthEncoding::Millimeters.decode_mm(1234), 1234);
    let raw = DepthEncoding::PlayerIndex.encode_mm(1500, 2);
    assert_eq!(raw & 0b111, 2);
    assert_eq!(DepthEncoding::PlayerIndex.decode_mm(raw), 1500);
}

#[test]
fn test_sentinel_paths_diverge() {
    let sentinel = DEPTH_NO_DATA.to_le_bytes();
    let direct = intensity_pixel_from_raw(&sentinel, DepthEncoding::Millimeters);
    assert_eq!(direct, Rgb([0, 0, 0]));

    let mut depth = DepthImage::new(2, 1);
    depth.put_pixel(0, 0, Luma([DEPTH_NO_DATA]));
    depth.put_pixel(1, 0, Luma([2000]));
    let mut intensity = IntensityImage::new(2, 1);
    depth_to_intensity(&depth, &mut intensity);
    assert_eq!(*intensity.get_pixel(0, 0), Rgb([255, 255, 255]));
    assert_ne!(*intensity.get_pixel(0, 0), direct);
    assert_eq!(*intensity.get_pixel(1, 0), Rgb([130, 130, 130]));
}

#[test]
fn test_constant_depth_gives_uniform_intensity() {
    use crate::frame::{KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION};

    let (w, h) = (KINECT_X_RESOLUTION as usize, KINECT_Y_RESOLUTION as usize);
    let raw = DepthEncoding::PlayerIndex.encode_mm(1000, 1);
    let bits = depth_frame_bytes(&vec![raw; w * h], w, w * 2);
    let frame = LockedFrame {
        width: w as u32,
        height: h as u32,
        pitch: w * 2,
        bits: &bits,
    };
    let mut intensity = crate::frame::new_intensity_image();
    let outcome = copy_frame(StreamKind::Depth, &frame, &mut intensity, |s| {
        intensity_pixel_from_raw(s, DepthEncoding::PlayerIndex)
    })
    .unwrap();
    assert_eq!(outcome, AcquireOutcome::Copied);
    let g = depth_intensity(1000);
    assert!(intensity.pixels().all(|p| *p == Rgb([g, g, g])));
    assert_eq!(intensity.dimensions(), (KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION));
}

#[test]
fn test_copy_honors_pitch() {
    let samples: Vec<u16> = (0..12).collect();
    let bits = depth_frame_bytes(&samples, 4, 12);
    let frame = LockedFrame {
        width: 4,
        height: 3,
        pitch: 12,
        bits: &bits,
    };
    let mut depth = DepthImage::new(4, 3);
    copy_frame(StreamKind::Depth, &frame, &mut depth, raw_depth_pixel).unwrap();
    assert_eq!(depth.as_raw(), &samples);
}

#[test]
fn test_copy_color_swizzles_bgra() {
    let bits = [1u8, 2, 3, 4, 5, 6, 7, 8, 0, 0];
    let frame = LockedFrame {
        width: 2,
        height: 1,
        pitch: 10,
        bits: &bits,
    };
    let mut color = crate::frame::ColorImage::new(2, 1);
    copy_frame(StreamKind::Color, &frame, &mut color, color_pixel).unwrap();
    assert_eq!(*color.get_pixel(0, 0), Rgba([3, 2, 1, 4]));
    assert_eq!(*color.get_pixel(1, 0), Rgba([7, 6, 5, 8]));
}

#[test]
fn test_copy_empty_frame_keeps_contents() {
    let mut depth = DepthImage::from_pixel(4, 2, Luma([42]));
    let frame = LockedFrame {
        width: 4,
        height: 2,
        pitch: 0,
        bits: &[],
    };
    let outcome = copy_frame(StreamKind::Depth, &frame, &mut depth, raw_depth_pixel).unwrap();
    assert_eq!(outcome, AcquireOutcome::Empty);
    assert!(depth.pixels().all(|p| p[0] == 42));
}

#[test]
fn test_copy_rejects_short_frame() {
    let mut depth = DepthImage::from_pixel(4, 2, Luma([42]));
    let bits = vec![0u8; 15];
    let frame = LockedFrame {
        width: 4,
        height: 2,
        pitch: 8,
        bits: &bits,
    };
    let err = copy_frame(StreamKind::Depth, &frame, &mut depth, raw_depth_pixel).unwrap_err();
    assert!(matches!(err, KinectDeviceError::ShortFrame { needed: 16, .. }));
    assert!(depth.pixels().all(|p| p[0] == 42));

    let frame = LockedFrame {
        width: 4,
        height: 3,
        pitch: 8,
        bits: &bits,
    };
    let err = copy_frame(StreamKind::Depth, &frame, &mut depth, raw_depth_pixel).unwrap_err();
    assert!(matches!(err, KinectDeviceError::ResolutionMismatch { .. }));
}

#[test]
fn test_uyvy_to_bgra_gray() {
    let src = [128u8, 100, 128, 200];
    let mut dst = [0u8; 8];
    uyvy_to_bgra(&src, &mut dst);
    assert_eq!(dst, [100, 100, 100, 255, 200, 200, 200, 255]);
}

#[test]
fn test_grbg_to_bgra_block() {
    let src = [10u8, 200, 30, 20];
    let mut dst = [0u8; 16];
    grbg_to_bgra(&src, &mut dst, 2, 2);
    for px in dst.chunks_exact(4) {
        assert_eq!(px, [30, 15, 200, 255]);
    }
}
