// State management for Where's My Dog

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use crate::artifacts::FsArtifactStore;
use crate::config::AppConfig;
use crate::database::DatabaseManager;
use crate::pipeline::SightingPipeline;
use crate::pose::{PoseEstimator, YoloPoseEstimator};
use crate::token::{QrCodeRenderer, TokenEncoder};

/// Everything a front end needs to serve sightings and record listings
pub struct AppState {
    /// Database manager for SQLite persistence
    database: Arc<DatabaseManager>,
    pipeline: Arc<SightingPipeline>,
}

impl AppState {
    /// Open the store and artifact directories and load the pose model
    pub fn open(config: AppConfig) -> Result<Self> {
        let estimator = YoloPoseEstimator::new(config.detector.clone())
            .context("Failed to initialize pose estimator")?;
        Self::with_estimator(config, Arc::new(estimator))
    }

    /// Same as [`AppState::open`] with a caller-supplied estimator
    pub fn with_estimator(config: AppConfig, estimator: Arc<dyn PoseEstimator>) -> Result<Self> {
        let database = Arc::new(
            DatabaseManager::new(config.storage.database_path())
                .context("Failed to open record store")?,
        );
        let artifacts = Arc::new(FsArtifactStore::new(
            config.storage.upload_path(),
            config.storage.processed_path(),
        )?);
        let tokens = TokenEncoder::new(Arc::new(QrCodeRenderer::new(&config.token)));

        let pipeline = Arc::new(SightingPipeline::new(
            database.clone(),
            estimator,
            tokens,
            artifacts,
            config.allowed_extensions.clone(),
        ));

        info!("App state ready (data dir {:?})", config.storage.data_dir);

        Ok(Self { database, pipeline })
    }

    pub fn db(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn pipeline(&self) -> Arc<SightingPipeline> {
        self.pipeline.clone()
    }
}
