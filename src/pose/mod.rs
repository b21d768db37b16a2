//! Pose estimation
//!
//! The pipeline only depends on [`PoseEstimator`]; the ONNX YOLOv8-pose
//! backend is one implementation of it.

pub mod yolo;

use anyhow::Result;
use image::DynamicImage;

use crate::keypoints::Detection;

pub use yolo::YoloPoseEstimator;

/// Given an image, return zero or more keypoint sets.
///
/// Confidence and IoU filtering are the estimator's concern. Every returned
/// detection carries exactly the model's keypoint count, with `(0, 0)` for
/// landmarks it could not localize. An empty result is not an error.
pub trait PoseEstimator: Send + Sync {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<Detection>>;

    /// Landmarks per detection
    fn keypoint_count(&self) -> usize;
}
