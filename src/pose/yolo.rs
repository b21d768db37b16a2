//! YOLOv8-pose ONNX backend
//!
//! Letterboxes the image to the square network input, runs the session and
//! decodes the `[1, 5 + 3K, N]` output: box, score, then `(x, y, visibility)`
//! per keypoint for each of the N anchors. Candidates are filtered by
//! confidence, suppressed by box IoU and mapped back to source pixels.

use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use log::{debug, info};
use ndarray::Array4;
use ort::session::Session;
use std::sync::Mutex;

use super::PoseEstimator;
use crate::config::DetectorConfig;
use crate::keypoints::{Detection, Keypoint};

const INPUT_NAME: &str = "images";
const OUTPUT_NAME: &str = "output0";
const PAD_VALUE: u8 = 114;

/// Pose estimator backed by an exported YOLOv8-pose model
pub struct YoloPoseEstimator {
    // Session::run needs exclusive access
    session: Mutex<Session>,
    config: DetectorConfig,
}

impl YoloPoseEstimator {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        info!("Loading pose model from {:?}", config.model_path);

        if !config.model_path.exists() {
            return Err(anyhow!("Pose model not found: {:?}", config.model_path));
        }

        let session = Session::builder()?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(&config.model_path)?;

        info!(
            "Pose model loaded (input {}px, {} keypoints, conf {}, iou {})",
            config.input_size, config.keypoint_count, config.confidence_threshold, config.iou_threshold
        );

        Ok(Self {
            session: Mutex::new(session),
            config,
        })
    }
}

impl PoseEstimator for YoloPoseEstimator {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let (input, letterbox) = letterbox(image, self.config.input_size)?;
        let input_value = ort::value::Value::from_array(input)?;

        let (shape, data) = {
            let mut session = self.session.lock()
                .map_err(|e| anyhow!("Failed to lock pose session: {}", e))?;
            let outputs = session.run(ort::inputs!(INPUT_NAME => input_value))?;

            let (shape, data) = outputs[OUTPUT_NAME]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("Failed to extract pose output: {e}"))?;
            (shape.as_ref().to_vec(), data.to_vec())
        };

        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("Unexpected pose output shape {:?}", shape));
        }

        let detections = decode(
            &data,
            shape[1] as usize,
            shape[2] as usize,
            &letterbox,
            &self.config,
        )?;
        debug!("Pose model returned {} detection(s)", detections.len());

        Ok(detections)
    }

    fn keypoint_count(&self) -> usize {
        self.config.keypoint_count
    }
}

/// Mapping between source pixels and network input pixels
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: f32,
    height: f32,
}

impl Letterbox {
    fn new(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);

        Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
            width: width as f32,
            height: height as f32,
        }
    }

    fn resized(&self) -> (u32, u32) {
        (
            ((self.width * self.scale).round() as u32).max(1),
            ((self.height * self.scale).round() as u32).max(1),
        )
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            ((x - self.pad_x) / self.scale).clamp(0.0, self.width),
            ((y - self.pad_y) / self.scale).clamp(0.0, self.height),
        )
    }
}

fn letterbox(image: &DynamicImage, size: u32) -> Result<(Array4<f32>, Letterbox)> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("Cannot run pose model on an empty image"));
    }

    let lb = Letterbox::new(width, height, size);
    let (new_w, new_h) = lb.resized();
    let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

    let mut input = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    Ok((input, lb))
}

struct Candidate {
    bbox: [f32; 4],
    score: f32,
    keypoints: Vec<Keypoint>,
}

fn decode(
    output: &[f32],
    channels: usize,
    anchors: usize,
    lb: &Letterbox,
    config: &DetectorConfig,
) -> Result<Vec<Detection>> {
    let expected = 5 + 3 * config.keypoint_count;
    if channels != expected {
        return Err(anyhow!(
            "Pose output has {} channels, expected {} for {} keypoints",
            channels, expected, config.keypoint_count
        ));
    }
    if output.len() < channels * anchors {
        return Err(anyhow!("Pose output is truncated"));
    }

    let at = |c: usize, i: usize| output[c * anchors + i];

    let mut candidates = Vec::new();
    for i in 0..anchors {
        let score = at(4, i);
        if score < config.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let (x1, y1) = lb.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = lb.to_source(cx + w / 2.0, cy + h / 2.0);

        let keypoints = (0..config.keypoint_count)
            .map(|k| {
                let base = 5 + 3 * k;
                if at(base + 2, i) < config.visibility_threshold {
                    Keypoint::ABSENT
                } else {
                    let (x, y) = lb.to_source(at(base, i), at(base + 1, i));
                    Keypoint::new(x, y)
                }
            })
            .collect();

        candidates.push(Candidate {
            bbox: [x1, y1, x2, y2],
            score,
            keypoints,
        });
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= config.max_detections {
            break;
        }
        if kept.iter().all(|k| iou(&k.bbox, &candidate.bbox) <= config.iou_threshold) {
            kept.push(candidate);
        }
    }

    Ok(kept
        .into_iter()
        .map(|c| Detection::new(c.keypoints, c.score))
        .collect())
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;

    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(keypoints: usize) -> DetectorConfig {
        DetectorConfig {
            keypoint_count: keypoints,
            ..DetectorConfig::default()
        }
    }

    /// Build a channel-major output tensor from per-anchor rows
    fn output(rows: &[Vec<f32>]) -> (Vec<f32>, usize, usize) {
        let channels = rows[0].len();
        let anchors = rows.len();
        let mut data = vec![0.0; channels * anchors];
        for (i, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                data[c * anchors + i] = *v;
            }
        }
        (data, channels, anchors)
    }

    #[test]
    fn test_letterbox_geometry() {
        let lb = Letterbox::new(1280, 640, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!(lb.resized(), (640, 320));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(lb.to_source(320.0, 320.0), (640.0, 320.0));
        // Points in the padding clamp to the image edge
        assert_eq!(lb.to_source(-10.0, 10.0), (0.0, 0.0));
    }

    #[test]
    fn test_letterbox_tensor_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, Rgb([255, 0, 0])));
        let (input, lb) = letterbox(&image, 64).unwrap();

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.pad_y, 16.0);
        // Padding row is grey, content row is red
        assert!((input[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!(input[[0, 0, 32, 32]] > 0.95);
        assert!(input[[0, 1, 32, 32]] < 0.05);
    }

    #[test]
    fn test_decode_filters_and_maps_keypoints() {
        let lb = Letterbox::new(640, 640, 640);
        let (data, channels, anchors) = output(&[
            // cx, cy, w, h, score, (x, y, vis) x 2
            vec![100.0, 100.0, 50.0, 50.0, 0.9, 90.0, 95.0, 0.9, 110.0, 105.0, 0.2],
            vec![400.0, 400.0, 50.0, 50.0, 0.1, 1.0, 1.0, 1.0, 2.0, 2.0, 1.0],
        ]);

        let detections = decode(&data, channels, anchors, &lb, &config(2)).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[0].keypoints[0], Keypoint::new(90.0, 95.0));
        assert!(detections[0].keypoints[1].is_absent());
    }

    #[test]
    fn test_decode_suppresses_overlaps_and_orders_by_score() {
        let lb = Letterbox::new(640, 640, 640);
        let (data, channels, anchors) = output(&[
            vec![100.0, 100.0, 50.0, 50.0, 0.6, 1.0, 1.0, 1.0],
            vec![102.0, 101.0, 50.0, 50.0, 0.8, 2.0, 2.0, 1.0],
            vec![400.0, 400.0, 50.0, 50.0, 0.7, 3.0, 3.0, 1.0],
        ]);

        let detections = decode(&data, channels, anchors, &lb, &config(1)).unwrap();

        let scores: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        assert_eq!(scores, vec![0.8, 0.7]);
    }

    #[test]
    fn test_decode_rejects_wrong_topology() {
        let lb = Letterbox::new(640, 640, 640);
        let (data, channels, anchors) = output(&[vec![0.0; 8]]);
        assert!(decode(&data, channels, anchors, &lb, &config(24)).is_err());
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let config = DetectorConfig {
            model_path: "/definitely/not/here.onnx".into(),
            ..DetectorConfig::default()
        };
        assert!(YoloPoseEstimator::new(config).is_err());
    }
}
