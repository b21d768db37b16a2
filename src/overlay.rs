// Keypoint overlay rendering
// Marks every localized landmark of every detection on a copy of the image

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

use crate::keypoints::Detection;

const MARKER_RADIUS: i64 = 5;
const MARKER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Draw filled green circles at each keypoint. Absent landmarks are skipped.
pub fn draw_keypoints(image: &DynamicImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.to_rgb8();

    for detection in detections {
        for kp in detection.keypoints.iter().filter(|kp| !kp.is_absent()) {
            fill_circle(&mut canvas, kp.x as i64, kp.y as i64, MARKER_RADIUS, MARKER_COLOR);
        }
    }

    canvas
}

fn fill_circle(canvas: &mut RgbImage, cx: i64, cy: i64, radius: i64, color: Rgb<u8>) {
    let (width, height) = (canvas.width() as i64, canvas.height() as i64);

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 && x < width && y < height {
                canvas.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

/// Encode an overlay as PNG bytes
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode overlay as PNG")?;
    Ok(bytes)
}
