//! Small generated images for unit tests.

use std::io::Cursor;

use image::codecs::gif::GifEncoder;
use image::{DynamicImage, Frame, ImageFormat, Rgba, RgbaImage};

pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// 16x16 GIF with one solid-colour frame per entry.
pub fn gif_bytes(colors: &[[u8; 4]]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        let frames = colors
            .iter()
            .map(|c| Frame::new(RgbaImage::from_pixel(16, 16, Rgba(*c))));
        encoder.encode_frames(frames).unwrap();
    }
    out
}
