use anyhow::Result;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};

/// Gradient with a checker in the blue channel, encoded as `format`.
pub fn build_sample(width: u32, height: u32, format: ImageFormat) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 2 * 200) as u8,
        ])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), format)?;
    Ok(out)
}
