//! Pixel operations on tiles: extraction with padding, compositing and
//! downsampling

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};

use crate::experiment::{PixelRect, PixelSize};

use super::types::IntensityWindow;

/// 16-bit single-channel image
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Decoded site image as provided by the acquisition
#[derive(Debug, Clone)]
pub enum SourceImage {
    Gray8(GrayImage),
    Gray16(Gray16Image),
}

impl SourceImage {
    pub fn size(&self) -> PixelSize {
        let (width, height) = match self {
            SourceImage::Gray8(img) => img.dimensions(),
            SourceImage::Gray16(img) => img.dimensions(),
        };
        PixelSize::new(height as u64, width as u64)
    }

    /// 8-bit view of the image; 16-bit pixels are clipped to `window`
    pub fn to_gray8(&self, window: IntensityWindow) -> GrayImage {
        match self {
            SourceImage::Gray8(img) => img.clone(),
            SourceImage::Gray16(img) => {
                let (width, height) = img.dimensions();
                GrayImage::from_fn(width, height, |x, y| {
                    Luma([rescale_intensity(img.get_pixel(x, y)[0], window)])
                })
            }
        }
    }
}

/// Linear mapping of `[lower, upper]` onto `[0, 255]`, clipping outside values
pub fn rescale_intensity(value: u16, window: IntensityWindow) -> u8 {
    if window.upper <= window.lower {
        return if value > window.lower { u8::MAX } else { 0 };
    }
    let clipped = value.clamp(window.lower, window.upper);
    let range = (window.upper - window.lower) as u32;
    let scaled = (clipped - window.lower) as u32 * u8::MAX as u32;
    ((scaled + range / 2) / range) as u8
}

/// Tile filled with the background value
pub fn background_tile(tile_size: u32, background: u8) -> GrayImage {
    GrayImage::from_pixel(tile_size, tile_size, Luma([background]))
}

/// Copy `src` into `canvas` with its top-left corner at `(y, x)` in canvas
/// coordinates. Pixels falling outside the canvas are dropped.
pub fn paste_into(canvas: &mut GrayImage, src: &GrayImage, y: i64, x: i64) {
    imageops::replace(canvas, src, x, y);
}

/// The `tile_size × tile_size` window of `src` starting at `(y_offset,
/// x_offset)`.
///
/// Offsets may be negative or run past the image; every margin without
/// source pixels is filled with `background`.
pub fn extract_tile(
    src: &GrayImage,
    y_offset: i64,
    x_offset: i64,
    tile_size: u32,
    background: u8,
) -> GrayImage {
    let mut tile = background_tile(tile_size, background);
    paste_into(&mut tile, src, -y_offset, -x_offset);
    tile
}

/// Base tile covering `tile` in the global space, composed from every
/// source whose rectangle intersects it. Later sources overwrite earlier ones
/// where they overlap.
pub fn composite_tile(
    tile: PixelRect,
    sources: &[(PixelRect, &GrayImage)],
    tile_size: u32,
    background: u8,
) -> GrayImage {
    let mut canvas = background_tile(tile_size, background);
    for (rect, image) in sources {
        if !rect.intersects(&tile) {
            continue;
        }
        let y = rect.offset.y as i64 - tile.offset.y as i64;
        let x = rect.offset.x as i64 - tile.offset.x as i64;
        paste_into(&mut canvas, image, y, x);
    }
    canvas
}

/// Combine an `f × f` block of child tiles (row-major, `None` for children
/// outside the level) into one parent tile.
pub fn downsample(
    children: &[Option<GrayImage>],
    factor: u32,
    tile_size: u32,
    background: u8,
) -> GrayImage {
    let edge = factor * tile_size;
    let mut canvas = GrayImage::from_pixel(edge, edge, Luma([background]));
    for (i, child) in children.iter().enumerate() {
        let Some(child) = child else { continue };
        let row = (i as u32 / factor) as i64;
        let col = (i as u32 % factor) as i64;
        imageops::replace(
            &mut canvas,
            child,
            col * tile_size as i64,
            row * tile_size as i64,
        );
    }
    imageops::resize(&canvas, tile_size, tile_size, FilterType::Triangle)
}
