//! Named landmark data for one camera and one frame

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A single named landmark in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    /// Visibility or detection confidence in `[0, 1]` when the detector reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f64>,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            visibility: None,
        }
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_visibility(mut self, visibility: f64) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Whether both coordinates are finite numbers
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Whether this point may be drawn under the given visibility threshold
    ///
    /// Points without a visibility score always pass. Non-finite coordinates
    /// never do.
    pub fn passes(&self, min_visibility: f64) -> bool {
        if !self.is_finite() {
            return false;
        }
        match self.visibility {
            Some(v) => v >= min_visibility,
            None => true,
        }
    }
}

/// Per-frame detection summary that travels with a [`PointObservation`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    /// Detector counters such as `n_charuco_detected`
    #[serde(default)]
    pub counts: BTreeMap<String, i64>,
}

impl ObservationMetadata {
    pub fn count(&self, name: &str) -> Option<i64> {
        self.counts.get(name).copied()
    }
}

/// Mapping from point name to landmark for one camera and one frame
///
/// Replaced wholesale every frame; there is no incremental merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointObservation {
    #[serde(default)]
    pub points: HashMap<String, Point>,
    #[serde(default)]
    pub metadata: ObservationMetadata,
}

impl PointObservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: ObservationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, point: Point) {
        self.points.insert(name.into(), point);
    }

    /// Builder variant of [`insert`](Self::insert)
    pub fn with_point(mut self, name: impl Into<String>, point: Point) -> Self {
        self.insert(name, point);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Point> {
        self.points.get(name)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_threshold() {
        let p = Point::new(1.0, 2.0).with_visibility(0.4);
        assert!(!p.passes(0.5));
        assert!(p.passes(0.3));
        assert!(Point::new(1.0, 2.0).passes(0.99));
    }

    #[test]
    fn test_non_finite_never_passes() {
        assert!(!Point::new(f64::NAN, 2.0).passes(0.0));
        assert!(!Point::new(1.0, f64::INFINITY).passes(0.0));
    }

    #[test]
    fn test_observation_builder() {
        let obs = PointObservation::new()
            .with_point("nose", Point::new(10.0, 20.0))
            .with_point("left_eye", Point::new(8.0, 18.0).with_z(0.1));

        assert_eq!(obs.len(), 2);
        assert_eq!(obs.get("left_eye").and_then(|p| p.z), Some(0.1));
        assert!(obs.get("right_eye").is_none());
    }

    #[test]
    fn test_point_deserialize_without_optional_fields() {
        let p: Point = serde_json::from_str(r#"{"x": 1.5, "y": 2.5}"#).unwrap();
        assert_eq!(p, Point::new(1.5, 2.5));
    }
}
