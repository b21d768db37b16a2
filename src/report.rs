// HTML views of records and sighting results
// Rendered with askama; every interpolated value is HTML-escaped

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};

use crate::database::IdentityRecord;
use crate::pipeline::SightingOutcome;

const NEVER: &str = "never";

/// Display form of one stored record
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: String,
    pub label: String,
    pub keypoint_count: usize,
    pub note: String,
    pub last_seen: String,
}

impl From<&IdentityRecord> for RecordRow {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            id: record.id.clone(),
            label: record.label.clone(),
            keypoint_count: record.geometry.keypoint_count(),
            note: record.note.clone().unwrap_or_default(),
            last_seen: format_seen(record.last_seen),
        }
    }
}

#[derive(Template)]
#[template(path = "records.html")]
pub struct RecordsPage {
    pub rows: Vec<RecordRow>,
}

#[derive(Template)]
#[template(path = "sighting.html")]
pub struct SightingPage {
    pub recorded: bool,
    pub message: String,
    pub was_existing: bool,
    pub id: String,
    pub label: String,
    pub previous_note: String,
    pub previous_last_seen: String,
    pub overlay_name: String,
    pub token_name: String,
}

impl From<&SightingOutcome> for SightingPage {
    fn from(outcome: &SightingOutcome) -> Self {
        match outcome {
            SightingOutcome::NoKeypoints => Self {
                recorded: false,
                message: SightingOutcome::NO_KEYPOINTS_MESSAGE.to_string(),
                was_existing: false,
                id: String::new(),
                label: String::new(),
                previous_note: String::new(),
                previous_last_seen: String::new(),
                overlay_name: String::new(),
                token_name: String::new(),
            },
            SightingOutcome::Recorded(report) => Self {
                recorded: true,
                message: String::new(),
                was_existing: report.was_existing,
                id: report.record.id.clone(),
                label: report.record.label.clone(),
                previous_note: report.previous_note.clone().unwrap_or_default(),
                previous_last_seen: format_seen(report.previous_last_seen),
                overlay_name: report.overlay.name.clone(),
                token_name: report.token.name.clone(),
            },
        }
    }
}

fn format_seen(seen: Option<DateTime<Utc>>) -> String {
    seen.map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| NEVER.to_string())
}

/// Render the record listing page
pub fn render_records(records: &[IdentityRecord]) -> Result<String> {
    RecordsPage {
        rows: records.iter().map(RecordRow::from).collect(),
    }
    .render()
    .context("Failed to render records page")
}

/// Render the result page for one submission
pub fn render_sighting(outcome: &SightingOutcome) -> Result<String> {
    SightingPage::from(outcome)
        .render()
        .context("Failed to render sighting page")
}
