// Keypoint canonicalization
// Turns raw pose detections into the geometry string stored with a record

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 2D landmark position in detector coordinates.
///
/// `(0, 0)` is the "absent" sentinel: the model could not localize the landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub const ABSENT: Keypoint = Keypoint { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_absent(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// One animal instance localized by the pose model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// One entry per landmark of the model topology, in topology order
    pub keypoints: Vec<Keypoint>,
    /// Detection confidence reported by the model
    pub confidence: f32,
}

impl Detection {
    pub fn new(keypoints: Vec<Keypoint>, confidence: f32) -> Self {
        Self { keypoints, confidence }
    }

    /// Number of landmarks that were actually localized
    pub fn localized_count(&self) -> usize {
        self.keypoints.iter().filter(|kp| !kp.is_absent()).count()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("geometry is empty")]
    Empty,
    #[error("geometry has an odd number of values ({0})")]
    OddLength(usize),
    #[error("invalid coordinate '{0}'")]
    InvalidNumber(String),
    #[error("coordinate {0} is negative or not finite")]
    OutOfRange(f32),
}

/// Flattened `x0,y0,x1,y1,...` coordinates of the persisted detection.
///
/// Values are opaque detector coordinates (pixels of the submitted image for
/// the YOLO estimator) and are not comparable across images of different
/// resolution without rescaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GeometryRecord {
    values: Vec<f32>,
}

impl GeometryRecord {
    /// Build a record from flattened coordinates, enforcing the invariants
    pub fn from_values(values: Vec<f32>) -> Result<Self, GeometryError> {
        if values.is_empty() {
            return Err(GeometryError::Empty);
        }
        if values.len() % 2 != 0 {
            return Err(GeometryError::OddLength(values.len()));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(GeometryError::OutOfRange(*bad));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn keypoint_count(&self) -> usize {
        self.values.len() / 2
    }

    pub fn keypoints(&self) -> Vec<Keypoint> {
        self.values
            .chunks_exact(2)
            .map(|pair| Keypoint::new(pair[0], pair[1]))
            .collect()
    }

    /// Serialize to the stored text form, e.g. `[12.5,40,0,0]`
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse the stored text form.
    ///
    /// Also accepts the numpy `array2string` output written by earlier
    /// deployments (`[12.5 ,  0. , 3.]`, possibly wrapped over several lines).
    pub fn parse(s: &str) -> Result<Self, GeometryError> {
        let inner = s.trim();
        let inner = inner.strip_prefix('[').unwrap_or(inner);
        let inner = inner.strip_suffix(']').unwrap_or(inner);

        if inner.trim().is_empty() {
            return Err(GeometryError::Empty);
        }

        let values = inner
            .split(',')
            .map(|token| {
                let token = token.trim();
                token
                    .parse::<f32>()
                    .map_err(|_| GeometryError::InvalidNumber(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_values(values)
    }
}

impl fmt::Display for GeometryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // f32 Display is the shortest representation that parses back exactly
        f.write_str("[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str("]")
    }
}

impl FromStr for GeometryRecord {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GeometryRecord {
    type Error = GeometryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<GeometryRecord> for String {
    fn from(g: GeometryRecord) -> Self {
        g.serialize()
    }
}

/// Canonicalize the detections of one image.
///
/// Returns `None` when nothing was detected. Otherwise the first detection is
/// authoritative and the rest are ignored. Coordinates that are negative or
/// not finite are replaced by the absent sentinel so the result always
/// satisfies the geometry invariants.
pub fn canonicalize(detections: &[Detection]) -> Option<GeometryRecord> {
    let first = detections.first()?;
    if first.keypoints.is_empty() {
        return None;
    }

    let values = first
        .keypoints
        .iter()
        .flat_map(|kp| {
            let valid = kp.x.is_finite() && kp.y.is_finite() && kp.x >= 0.0 && kp.y >= 0.0;
            let kp = if valid { *kp } else { Keypoint::ABSENT };
            [kp.x, kp.y]
        })
        .collect();

    Some(GeometryRecord { values })
}
