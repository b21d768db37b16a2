//! Sighting pipeline
//!
//! One submission (image + name + optional note) flows through:
//! validate → infer → canonicalize → derive identity → upsert → render
//! artifacts → respond. Nothing is written until a dog has been detected,
//! and the upsert is the only write to the record store. The store lock is only
//! taken for the upsert itself, never across inference.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::artifacts::{safe_file_name, ArtifactHandle, ArtifactKind, ArtifactStore};
use crate::database::{DatabaseManager, IdentityRecord};
use crate::error::{InputError, SightingError};
use crate::identity::derive_id;
use crate::keypoints::canonicalize;
use crate::overlay::{draw_keypoints, encode_png};
use crate::pose::PoseEstimator;
use crate::token::TokenEncoder;

/// What the operator submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SightingRequest {
    /// Dog name; hashed byte-for-byte into the identity key
    pub label: String,
    /// Client file name of the photo
    pub file_name: String,
    #[serde(skip)]
    pub image: Vec<u8>,
    /// Where the dog was seen
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SightingReport {
    pub record: IdentityRecord,
    pub was_existing: bool,
    /// Note stored before this sighting (returning dogs only)
    pub previous_note: Option<String>,
    /// Last sighting before this one (returning dogs only)
    pub previous_last_seen: Option<DateTime<Utc>>,
    pub overlay: ArtifactHandle,
    pub token: ArtifactHandle,
    pub detection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SightingOutcome {
    /// The model found no dog; nothing was recorded
    NoKeypoints,
    Recorded(SightingReport),
}

impl SightingOutcome {
    pub const NO_KEYPOINTS_MESSAGE: &'static str = "No keypoints detected in the image.";
}

struct ValidatedSighting {
    file_name: String,
    image: DynamicImage,
    note: Option<String>,
}

pub struct SightingPipeline {
    db: Arc<DatabaseManager>,
    estimator: Arc<dyn PoseEstimator>,
    tokens: TokenEncoder,
    artifacts: Arc<dyn ArtifactStore>,
    allowed_extensions: Vec<String>,
}

impl SightingPipeline {
    pub fn new(
        db: Arc<DatabaseManager>,
        estimator: Arc<dyn PoseEstimator>,
        tokens: TokenEncoder,
        artifacts: Arc<dyn ArtifactStore>,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            db,
            estimator,
            tokens,
            artifacts,
            allowed_extensions,
        }
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Process one sighting end to end
    pub fn submit(&self, request: &SightingRequest) -> Result<SightingOutcome, SightingError> {
        let span = tracing::info_span!(
            "sighting",
            file = %request.file_name,
            key = tracing::field::Empty
        );
        let _entered = span.enter();

        let sighting = self.validate(request)?;

        let started = Instant::now();
        let detections = self
            .estimator
            .predict(&sighting.image)
            .map_err(|e| SightingError::external("pose estimator", e))?;
        perf_debug!("Pose inference for {} took {:?}", sighting.file_name, started.elapsed());

        let Some(first) = detections.first() else {
            info!("No keypoints detected in {}", sighting.file_name);
            return Ok(SightingOutcome::NoKeypoints);
        };
        let expected = self.estimator.keypoint_count();
        if first.keypoints.len() != expected {
            return Err(SightingError::external(
                "pose estimator",
                anyhow!(
                    "detection has {} keypoints, model topology has {}",
                    first.keypoints.len(),
                    expected
                ),
            ));
        }
        let Some(geometry) = canonicalize(&detections) else {
            info!("No keypoints detected in {}", sighting.file_name);
            return Ok(SightingOutcome::NoKeypoints);
        };
        log::debug!(
            "{} detection(s) in {}, persisting the first ({} of {} keypoints localized)",
            detections.len(),
            sighting.file_name,
            first.localized_count(),
            expected
        );

        self.artifacts
            .put(ArtifactKind::Upload, &sighting.file_name, &request.image)
            .map_err(|e| SightingError::external("artifact store", e))?;

        let key = derive_id(&request.label);
        span.record("key", key.as_str());

        let outcome = self
            .db
            .upsert_dog(
                key.as_str(),
                &request.label,
                &geometry,
                sighting.note.as_deref(),
                Utc::now(),
            )
            .map_err(SightingError::Store)?;

        info!(
            "Recorded {} sighting of '{}' ({})",
            if outcome.was_existing() { "returning" } else { "first" },
            outcome.record.label,
            key
        );

        let started = Instant::now();
        let overlay_png = encode_png(&draw_keypoints(&sighting.image, &detections))
            .map_err(|e| SightingError::external("overlay renderer", e))?;
        let overlay = self
            .artifacts
            .put(ArtifactKind::Processed, &overlay_name(&sighting.file_name), &overlay_png)
            .map_err(|e| SightingError::external("artifact store", e))?;

        let token_png = self
            .tokens
            .encode(&key)
            .map_err(|e| SightingError::external("barcode renderer", e))?;
        let token = self
            .artifacts
            .put(
                ArtifactKind::Processed,
                &TokenEncoder::artifact_name(&sighting.file_name),
                &token_png,
            )
            .map_err(|e| SightingError::external("artifact store", e))?;
        perf_debug!("Rendering artifacts took {:?}", started.elapsed());

        let was_existing = outcome.was_existing();
        let (previous_note, previous_last_seen) = match outcome.previous {
            Some(prev) => (prev.note, prev.last_seen),
            None => (None, None),
        };

        Ok(SightingOutcome::Recorded(SightingReport {
            record: outcome.record,
            was_existing,
            previous_note,
            previous_last_seen,
            overlay,
            token,
            detection_count: detections.len(),
        }))
    }

    fn validate(&self, request: &SightingRequest) -> Result<ValidatedSighting, InputError> {
        if request.label.is_empty() {
            return Err(InputError::MissingLabel);
        }
        if request.file_name.is_empty() || request.image.is_empty() {
            return Err(InputError::MissingImage);
        }

        let file_name = safe_file_name(&request.file_name)
            .ok_or_else(|| InputError::InvalidFileName(request.file_name.clone()))?;

        let extension = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
        {
            return Err(InputError::UnsupportedFileType(extension.to_string()));
        }

        let image = image::load_from_memory(&request.image)
            .map_err(|e| InputError::UnreadableImage(e.to_string()))?;

        let note = request
            .note
            .as_ref()
            .filter(|note| !note.trim().is_empty())
            .cloned();

        Ok(ValidatedSighting {
            file_name,
            image,
            note,
        })
    }
}

/// Overlays are always written as PNG; the full upload name keeps them distinct
fn overlay_name(file_name: &str) -> String {
    format!("processed_{}.png", file_name)
}
