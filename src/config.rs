// Application configuration for Where's My Dog
// Defaults, optional JSON file, then environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where records and artifacts live on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; relative paths below are resolved against it
    pub data_dir: PathBuf,
    pub database_file: PathBuf,
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wheres-my-dog");

        Self {
            data_dir,
            database_file: PathBuf::from("dogs.db"),
            upload_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
        }
    }
}

impl StorageConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database_file)
    }

    pub fn upload_path(&self) -> PathBuf {
        self.resolve(&self.upload_dir)
    }

    pub fn processed_path(&self) -> PathBuf {
        self.resolve(&self.processed_dir)
    }
}

/// Pose model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Path to the exported YOLOv8-pose ONNX model
    pub model_path: PathBuf,
    /// Square network input size in pixels
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Landmarks per detection in the trained topology
    pub keypoint_count: usize,
    /// Keypoints scored below this are reported as absent (0, 0)
    pub visibility_threshold: f32,
    pub intra_threads: usize,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("weights/best.onnx"),
            input_size: 640,
            confidence_threshold: 0.3,
            iou_threshold: 0.55,
            keypoint_count: 24,
            visibility_threshold: 0.5,
            intra_threads: 4,
            max_detections: 100,
        }
    }
}

/// QR token rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Pixels per QR module
    pub module_size: u32,
    /// Emit the standard 4-module quiet zone
    pub quiet_zone: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            module_size: 10,
            quiet_zone: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub detector: DetectorConfig,
    pub token: TokenConfig,
    /// Accepted upload extensions, compared case-insensitively
    pub allowed_extensions: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            detector: DetectorConfig::default(),
            token: TokenConfig::default(),
            allowed_extensions: ["png", "jpg", "jpeg", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional JSON file, then apply `WMD_*`
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("WMD_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("WMD_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(model);
        }
        if let Some(conf) = lookup("WMD_CONFIDENCE") {
            self.detector.confidence_threshold = conf
                .parse()
                .with_context(|| format!("Invalid WMD_CONFIDENCE: {}", conf))?;
        }
        if let Some(iou) = lookup("WMD_IOU") {
            self.detector.iou_threshold = iou
                .parse()
                .with_context(|| format!("Invalid WMD_IOU: {}", iou))?;
        }
        Ok(())
    }
}
