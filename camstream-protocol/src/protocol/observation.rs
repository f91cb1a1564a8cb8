//! Observation bundles
//!
//! The server sends detector output as JSON keyed by camera id. Each value
//! names its variant in a `message_type` field:
//!
//! ```json
//! {
//!   "0": {"message_type": "charuco_overlay", "camera_id": "0", "frame_number": 12, ...},
//!   "1": {"message_type": "mediapipe_overlay", "camera_id": "1", "frame_number": 12, ...}
//! }
//! ```
//!
//! Variants are validated once here and then flattened into the
//! camera-agnostic [`PointObservation`] the overlay compiler consumes.

use crate::points::{ObservationMetadata, Point, PointObservation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detector output for one camera and one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Observation {
    CharucoOverlay(CharucoObservation),
    MediapipeOverlay(MediapipeObservation),
}

impl Observation {
    pub fn camera_id(&self) -> &str {
        match self {
            Observation::CharucoOverlay(o) => &o.camera_id,
            Observation::MediapipeOverlay(o) => &o.camera_id,
        }
    }

    pub fn frame_number(&self) -> u64 {
        match self {
            Observation::CharucoOverlay(o) => o.frame_number,
            Observation::MediapipeOverlay(o) => o.frame_number,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Observation::CharucoOverlay(_) => "charuco_overlay",
            Observation::MediapipeOverlay(_) => "mediapipe_overlay",
        }
    }

    /// Flatten into named points
    pub fn to_points(&self) -> PointObservation {
        match self {
            Observation::CharucoOverlay(o) => o.to_points(),
            Observation::MediapipeOverlay(o) => o.to_points(),
        }
    }
}

/// Observations keyed by camera id, as they arrive in one message
pub type ObservationBundle = BTreeMap<String, Observation>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CharucoCorner {
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArucoMarker {
    pub id: i64,
    pub corners: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharucoMetadata {
    pub n_charuco_detected: i64,
    pub n_charuco_total: i64,
    pub n_aruco_detected: i64,
    pub n_aruco_total: i64,
    #[serde(default)]
    pub has_pose: bool,
    pub image_width: u32,
    pub image_height: u32,
}

/// Calibration board detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharucoObservation {
    pub camera_id: String,
    pub frame_number: u64,
    #[serde(default)]
    pub charuco_corners: Vec<CharucoCorner>,
    #[serde(default)]
    pub aruco_markers: Vec<ArucoMarker>,
    pub metadata: CharucoMetadata,
}

impl CharucoObservation {
    pub fn to_points(&self) -> PointObservation {
        let mut points = PointObservation::new();

        for corner in &self.charuco_corners {
            points.insert(
                format!("charuco_{}", corner.id),
                Point::new(corner.x, corner.y),
            );
        }
        for marker in &self.aruco_markers {
            for (k, [x, y]) in marker.corners.iter().enumerate() {
                points.insert(
                    format!("aruco_{}_corner_{}", marker.id, k),
                    Point::new(*x, *y),
                );
            }
        }

        let m = &self.metadata;
        let counts = BTreeMap::from([
            ("n_charuco_detected".to_string(), m.n_charuco_detected),
            ("n_charuco_total".to_string(), m.n_charuco_total),
            ("n_aruco_detected".to_string(), m.n_aruco_detected),
            ("n_aruco_total".to_string(), m.n_aruco_total),
            ("has_pose".to_string(), m.has_pose as i64),
        ]);

        points.with_metadata(ObservationMetadata {
            frame_number: Some(self.frame_number),
            image_width: Some(m.image_width),
            image_height: Some(m.image_height),
            counts,
        })
    }
}

/// One named landmark as mediapipe reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPoint {
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f64>,
}

impl NamedPoint {
    fn point(&self) -> Point {
        Point {
            x: self.x,
            y: self.y,
            z: self.z,
            visibility: self.visibility,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediapipeMetadata {
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default)]
    pub n_body_detected: i64,
    #[serde(default)]
    pub n_right_hand_detected: i64,
    #[serde(default)]
    pub n_left_hand_detected: i64,
    #[serde(default)]
    pub n_face_detected: i64,
}

/// Holistic landmark detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediapipeObservation {
    pub camera_id: String,
    pub frame_number: u64,
    #[serde(default)]
    pub body_points: Vec<NamedPoint>,
    #[serde(default)]
    pub right_hand_points: Vec<NamedPoint>,
    #[serde(default)]
    pub left_hand_points: Vec<NamedPoint>,
    #[serde(default)]
    pub face_points: Vec<NamedPoint>,
    pub metadata: MediapipeMetadata,
}

impl MediapipeObservation {
    pub fn to_points(&self) -> PointObservation {
        let mut points = PointObservation::new();

        for p in &self.body_points {
            points.insert(p.name.clone(), p.point());
        }
        let prefixed = [
            ("right_hand_", &self.right_hand_points),
            ("left_hand_", &self.left_hand_points),
            ("face_", &self.face_points),
        ];
        for (prefix, group) in prefixed {
            for p in group {
                points.insert(format!("{}{}", prefix, p.name), p.point());
            }
        }

        let m = &self.metadata;
        let counts = BTreeMap::from([
            ("n_body_detected".to_string(), m.n_body_detected),
            ("n_right_hand_detected".to_string(), m.n_right_hand_detected),
            ("n_left_hand_detected".to_string(), m.n_left_hand_detected),
            ("n_face_detected".to_string(), m.n_face_detected),
        ]);

        points.with_metadata(ObservationMetadata {
            frame_number: Some(self.frame_number),
            image_width: Some(m.image_width),
            image_height: Some(m.image_height),
            counts,
        })
    }
}
