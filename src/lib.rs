// Where's My Dog - keypoint-based dog sighting tracker
//
// A sighting (photo + name + optional note) is run through a pose model,
// its first detection's keypoints are stored under the SHA-256 of the name,
// and a QR token carrying that key is rendered for the operator.

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

// Core modules
pub mod artifacts;
pub mod config;
pub mod database;
pub mod error;
pub mod identity;
pub mod keypoints;
pub mod overlay;
pub mod pipeline;
pub mod pose;
pub mod report;
pub mod state;
pub mod token;

pub use config::AppConfig;
pub use database::{DatabaseManager, IdentityRecord};
pub use error::{InputError, SightingError};
pub use identity::{derive_id, IdentityKey};
pub use keypoints::{canonicalize, Detection, GeometryRecord, Keypoint};
pub use pipeline::{SightingOutcome, SightingPipeline, SightingReport, SightingRequest};
pub use state::AppState;
