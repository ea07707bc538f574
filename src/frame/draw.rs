//! Raster helpers for the frame transforms
//!
//! All helpers operate on 8-bit RGB buffers. Text uses an 8x8 bitmap font
//! stretched to 8x16 cells so annotation bars read like a terminal line.

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::error::{Error, Result};

/// Width of one text cell in pixels
pub const GLYPH_WIDTH: u32 = 8;

/// Height of one text line in pixels
pub const LINE_HEIGHT: u32 = 16;

/// Padding around annotation text
pub const ANNOTATION_BAR_MARGIN: u32 = 6;

const GLYPH_ROWS: u32 = 8;
const ROW_SCALE: u32 = LINE_HEIGHT / GLYPH_ROWS;

pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Create an image filled with one color
pub fn uniform(width: u32, height: u32, color: Rgb<u8>) -> RgbImage {
    RgbImage::from_pixel(width, height, color)
}

/// Overwrite every pixel with `color`
pub fn fill(im: &mut RgbImage, color: Rgb<u8>) {
    for pixel in im.pixels_mut() {
        *pixel = color;
    }
}

/// Width that keeps the aspect ratio of a `width`x`height` image scaled to
/// `target_height`, rounded to the nearest pixel
pub fn scaled_width(width: u32, height: u32, target_height: u32) -> u32 {
    let scaled = (f64::from(width) * f64::from(target_height) / f64::from(height)).round();
    (scaled as u32).max(1)
}

/// Resize to an exact height, preserving aspect ratio (bilinear filtering)
pub fn resize_to_height(im: &RgbImage, height: u32) -> Result<RgbImage> {
    if height == 0 || im.width() == 0 || im.height() == 0 {
        return Err(Error::InvalidDimensions {
            width: im.width(),
            height,
        });
    }
    let width = scaled_width(im.width(), im.height(), height);
    Ok(imageops::resize(im, width, height, FilterType::Triangle))
}

/// Pixel height of an annotation bar holding `lines` lines of text
pub fn annotation_height(lines: u32) -> u32 {
    if lines == 0 {
        0
    } else {
        lines * LINE_HEIGHT + ANNOTATION_BAR_MARGIN
    }
}

/// Copy `source` into a taller image with room for annotation bars
pub fn pad_for_annotation(source: &RgbImage, top_lines: u32, bottom_lines: u32) -> RgbImage {
    let top = annotation_height(top_lines);
    let bottom = annotation_height(bottom_lines);
    let mut output = RgbImage::new(source.width(), source.height() + top + bottom);
    imageops::replace(&mut output, source, 0, i64::from(top));
    output
}

/// Draw an opaque black bar with white text across the top of `im`
pub fn annotate_top(im: &mut RgbImage, text: &str, lines: u32) {
    let bar_height = annotation_height(lines).min(im.height());
    let width = im.width();
    for y in 0..bar_height {
        for x in 0..width {
            im.put_pixel(x, y, BLACK);
        }
    }
    draw_label(im, text, WHITE, ANNOTATION_BAR_MARGIN, ANNOTATION_BAR_MARGIN / 2);
}

/// Draw a single line of monospace text with its top-left corner at (x, y).
///
/// Characters without a glyph render as `?`; anything outside the image is
/// clipped.
pub fn draw_label(im: &mut RgbImage, text: &str, color: Rgb<u8>, x: u32, y: u32) {
    let (width, height) = im.dimensions();
    for (index, ch) in text.chars().enumerate() {
        let origin_x = x + index as u32 * GLYPH_WIDTH;
        if origin_x >= width {
            break;
        }
        let glyph = BASIC_FONTS
            .get(ch)
            .or_else(|| BASIC_FONTS.get('?'))
            .unwrap_or([0; 8]);

        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = origin_x + col;
                if px >= width {
                    continue;
                }
                for dy in 0..ROW_SCALE {
                    let py = y + row as u32 * ROW_SCALE + dy;
                    if py < height {
                        im.put_pixel(px, py, color);
                    }
                }
            }
        }
    }
}

/// Black image with a vertically centred white message
pub fn placeholder(width: u32, height: u32, message: &str) -> RgbImage {
    const MARGIN: u32 = 10;
    let mut im = uniform(width, height, BLACK);
    let y = height.saturating_sub(LINE_HEIGHT) / 2;
    draw_label(&mut im, message, WHITE, MARGIN, y);
    im
}
