use clap::Parser;
use kinect_device::frame::{
    new_color_image, new_depth_image, new_intensity_image, ColorImage as ColorFrame, DepthImage,
    IntensityImage, KINECT_X_RESOLUTION, KINECT_Y_RESOLUTION,
};
use kinect_device::processing::depth_to_intensity;
use kinect_device::{logger, DeviceArgs, KinectDeviceResult, KinectSession, ShutdownSignal};
use lib::eframe::egui::{self, Key, Visuals};
use lib::eframe::epaint::{Color32, ColorImage, TextureHandle};
use lib::eframe::CreationContext;
use tracing::{error, info};

const COLOR_WINDOW: &str = "color image";
const DEPTH_WINDOW: &str = "depth image";
const INTENSITY_WINDOW: &str = "intensity image";

#[derive(Parser, Debug)]
#[command(author, version, about = "Live Kinect color, depth and intensity viewer")]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,
}

fn color_to_display(frame: &ColorFrame) -> ColorImage {
    let (img_w, img_h) = (frame.width() as usize, frame.height() as usize);
    let mut image = ColorImage::new([img_w, img_h], Color32::BLACK);
    for (x, y, p) in frame.enumerate_pixels() {
        image[(x as usize, y as usize)] = Color32::from_rgb(p[0], p[1], p[2]).to_opaque();
    }
    image
}

/// Millimeters scaled down to eight bits, like a 16-bit image on an 8-bit screen.
fn depth_to_display(frame: &DepthImage) -> ColorImage {
    let (img_w, img_h) = (frame.width() as usize, frame.height() as usize);
    let mut image = ColorImage::new([img_w, img_h], Color32::BLACK);
    for (x, y, p) in frame.enumerate_pixels() {
        image[(x as usize, y as usize)] = Color32::from_gray((p[0] >> 8) as u8);
    }
    image
}

fn intensity_to_display(frame: &IntensityImage) -> ColorImage {
    let (img_w, img_h) = (frame.width() as usize, frame.height() as usize);
    let mut image = ColorImage::new([img_w, img_h], Color32::BLACK);
    for (x, y, p) in frame.enumerate_pixels() {
        image[(x as usize, y as usize)] = Color32::from_rgb(p[0], p[1], p[2]);
    }
    image
}

struct ViewerState {
    session: Option<KinectSession>,
    shutdown: ShutdownSignal,
    color: ColorFrame,
    depth: DepthImage,
    intensity: IntensityImage,
    color_texture: TextureHandle,
    depth_texture: TextureHandle,
    intensity_texture: TextureHandle,
    tick: usize,
}

impl ViewerState {
    pub fn new(cc: &CreationContext, session: KinectSession) -> Self {
        cc.egui_ctx.set_visuals(Visuals::dark());
        let color = new_color_image();
        let depth = new_depth_image();
        let intensity = new_intensity_image();
        let color_texture = cc
            .egui_ctx
            .load_texture("kinect-color", color_to_display(&color));
        let depth_texture = cc
            .egui_ctx
            .load_texture("kinect-depth", depth_to_display(&depth));
        let intensity_texture = cc
            .egui_ctx
            .load_texture("kinect-intensity", intensity_to_display(&intensity));

        Self {
            shutdown: session.shutdown_signal().clone(),
            session: Some(session),
            color,
            depth,
            intensity,
            color_texture,
            depth_texture,
            intensity_texture,
            tick: 0,
        }
    }

    /// One capture iteration. Per-frame errors were already logged; only a
    /// cancelled wait is passed up.
    fn update_frames(&mut self) -> KinectDeviceResult<()> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };
        self.tick += 1;

        match session.read_color(&mut self.color) {
            Err(err) if err.is_cancelled() => return Err(err),
            _ => self.color_texture.set(color_to_display(&self.color)),
        }

        match session.read_depth_mm(&mut self.depth) {
            Err(err) if err.is_cancelled() => return Err(err),
            _ => self.depth_texture.set(depth_to_display(&self.depth)),
        }

        depth_to_intensity(&self.depth, &mut self.intensity);
        self.intensity_texture.set(intensity_to_display(&self.intensity));
        Ok(())
    }

    fn quit_requested(ctx: &egui::Context) -> bool {
        let input = ctx.input();
        input.key_pressed(Key::Escape) || input.key_pressed(Key::Q)
    }

    fn quit(&mut self, frame: &mut lib::eframe::Frame) {
        if let Some(session) = self.session.take() {
            info!(frames = self.tick, "closing viewer");
            session.close();
        }
        frame.quit();
    }
}

impl lib::eframe::App for ViewerState {
    fn update(&mut self, ctx: &egui::Context, frame: &mut lib::eframe::Frame) {
        if self.shutdown.is_triggered() || Self::quit_requested(ctx) {
            self.quit(frame);
            return;
        }
        if self.update_frames().is_err() {
            self.quit(frame);
            return;
        }

        let size = [KINECT_X_RESOLUTION as f32, KINECT_Y_RESOLUTION as f32];
        for (title, texture) in [
            (COLOR_WINDOW, &self.color_texture),
            (DEPTH_WINDOW, &self.depth_texture),
            (INTENSITY_WINDOW, &self.intensity_texture),
        ] {
            egui::Window::new(title).auto_sized().show(ctx, |ui| {
                ui.image(texture.id(), size);
            });
        }

        ctx.request_repaint();
    }
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.device.verbose);

    let shutdown = ShutdownSignal::new();
    if let Err(err) = shutdown.install_ctrlc_handler() {
        error!(%err, "could not install Ctrl+C handler");
    }

    let session = match KinectSession::open(&cli.device.to_config(), shutdown) {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "main: Kinect initialization error");
            std::process::exit(1);
        }
    };
    info!("main: Kinect initialized");

    let options = lib::eframe::NativeOptions {
        initial_window_size: Some(egui::vec2(
            KINECT_X_RESOLUTION as f32 * 2.0 + 48.0,
            KINECT_Y_RESOLUTION as f32 * 2.0 + 96.0,
        )),
        ..Default::default()
    };
    lib::eframe::run_native(
        "Kinect Viewer",
        options,
        Box::new(|cc| {
            let state = ViewerState::new(cc, session);
            Box::new(state)
        }),
    );
}

#[test]
fn test_depth_display_scales_by_256() {
    use lib::image::Luma;

    let mut depth = DepthImage::new(3, 1);
    depth.put_pixel(0, 0, Luma([2000]));
    depth.put_pixel(1, 0, Luma([255]));
    depth.put_pixel(2, 0, Luma([65535]));
    let image = depth_to_display(&depth);
    assert_eq!(image.size, [3, 1]);
    assert_eq!(image[(0, 0)], Color32::from_gray(7));
    assert_eq!(image[(1, 0)], Color32::from_gray(0));
    assert_eq!(image[(2, 0)], Color32::from_gray(255));
}

#[test]
fn test_color_display_is_opaque() {
    use lib::image::Rgba;

    let mut color = ColorFrame::new(1, 1);
    color.put_pixel(0, 0, Rgba([200, 100, 50, 0]));
    let image = color_to_display(&color);
    assert_eq!(image[(0, 0)], Color32::from_rgb(200, 100, 50));
}

#[test]
fn test_intensity_display_keeps_gray() {
    use lib::image::Rgb;

    let intensity = IntensityImage::from_pixel(2, 2, Rgb([130, 130, 130]));
    let image = intensity_to_display(&intensity);
    assert!(image.pixels.iter().all(|c| *c == Color32::from_gray(130)));
}
