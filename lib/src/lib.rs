pub use eframe;
pub use image;
pub use v4l;
