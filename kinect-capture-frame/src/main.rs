use std::path::{Path, PathBuf};

use clap::Parser;
use kinect_device::frame::{new_color_image, new_depth_image, new_intensity_image, AcquireOutcome};
use kinect_device::processing::depth_to_intensity;
use kinect_device::{
    logger, DeviceArgs, KinectDeviceError, KinectDeviceResult, KinectSession, ShutdownSignal,
};
use lib::image::{EncodableLayout, ImageBuffer, PixelWithColorType};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Save one Kinect frame set as PNG files")]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,

    /// Directory the PNG files are written to
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn save<P>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    dir: &Path,
    name: &str,
) -> KinectDeviceResult<()>
where
    P: PixelWithColorType,
    [P::Subpixel]: EncodableLayout,
{
    let path = dir.join(name);
    image
        .save(&path)
        .map_err(|err| KinectDeviceError::ImageSave(path.display().to_string(), err))?;
    info!(path = %path.display(), "saved");
    Ok(())
}

fn report(what: &str, outcome: AcquireOutcome) {
    if outcome == AcquireOutcome::Empty {
        warn!(what, "device delivered an empty frame, saving a blank image");
    }
}

fn save_frames(session: &mut KinectSession, dir: &Path) -> KinectDeviceResult<()> {
    std::fs::create_dir_all(dir)?;

    let mut color = new_color_image();
    report("color", session.read_color(&mut color)?);
    save(&color, dir, "color.png")?;

    let mut raw = new_depth_image();
    report("raw depth", session.read_depth_raw(&mut raw)?);
    save(&raw, dir, "depth-raw.png")?;

    let mut depth = new_depth_image();
    report("depth", session.read_depth_mm(&mut depth)?);
    save(&depth, dir, "depth-mm.png")?;

    let mut intensity = new_intensity_image();
    depth_to_intensity(&depth, &mut intensity);
    save(&intensity, dir, "intensity.png")?;

    let mut direct = new_intensity_image();
    report("intensity", session.read_depth_intensity(&mut direct)?);
    save(&direct, dir, "intensity-direct.png")?;

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logger::init(cli.device.verbose);

    let shutdown = ShutdownSignal::new();
    shutdown.install_ctrlc_handler()?;

    let mut session = match KinectSession::open(&cli.device.to_config(), shutdown) {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "main: Kinect initialization error");
            std::process::exit(1);
        }
    };

    let result = save_frames(&mut session, &cli.output_dir);
    session.close();
    result?;
    Ok(())
}
