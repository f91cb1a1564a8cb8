//! Declarative overlay description
//!
//! An [`OverlayTopology`] says what to draw from named points, independent of
//! any particular camera or frame. It is built once, either in code or loaded
//! through serde, and then compiled against every frame's observation.

use super::template::Template;
use crate::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

fn default_true() -> bool {
    true
}

fn default_opacity() -> f64 {
    1.0
}

fn default_point_radius() -> f64 {
    3.0
}

fn default_stroke_width() -> f64 {
    2.0
}

fn default_font_size() -> f64 {
    12.0
}

fn default_label_offset() -> [f64; 2] {
    [5.0, -5.0]
}

fn default_crosshair_half_length() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointStyle {
    #[serde(default = "default_point_radius")]
    pub radius: f64,
    pub fill: String,
    #[serde(default)]
    pub stroke: Option<String>,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

impl Default for PointStyle {
    fn default() -> Self {
        Self {
            radius: default_point_radius(),
            fill: "rgb(0, 255, 0)".to_string(),
            stroke: None,
            opacity: 1.0,
        }
    }
}

impl PointStyle {
    pub fn filled(fill: impl Into<String>, radius: f64) -> Self {
        Self {
            radius,
            fill: fill.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStyle {
    pub stroke: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

impl Default for LineStyle {
    fn default() -> Self {
        Self {
            stroke: "rgb(255, 0, 255)".to_string(),
            stroke_width: default_stroke_width(),
            opacity: 1.0,
        }
    }
}

impl LineStyle {
    pub fn stroked(stroke: impl Into<String>, stroke_width: f64) -> Self {
        Self {
            stroke: stroke.into(),
            stroke_width,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    #[default]
    Start,
    Center,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    #[serde(default = "default_font_size")]
    pub font_size: f64,
    #[serde(default)]
    pub font_family: Option<String>,
    pub fill: String,
    #[serde(default)]
    pub stroke: Option<String>,
    #[serde(default)]
    pub stroke_width: f64,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub align: TextAlign,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: default_font_size(),
            font_family: None,
            fill: "white".to_string(),
            stroke: Some("black".to_string()),
            stroke_width: 1.0,
            bold: false,
            align: TextAlign::Start,
        }
    }
}

impl TextStyle {
    pub fn sized(fill: impl Into<String>, font_size: f64) -> Self {
        Self {
            font_size,
            fill: fill.into(),
            ..Self::default()
        }
    }
}

/// Element variants and the point names each one needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Point {
        point: String,
        #[serde(default)]
        style: PointStyle,
        /// Optional label template drawn next to the point
        #[serde(default)]
        label: Option<String>,
        #[serde(default = "default_label_offset")]
        label_offset: [f64; 2],
        #[serde(default)]
        label_style: TextStyle,
    },
    Line {
        from: String,
        to: String,
        #[serde(default)]
        style: LineStyle,
    },
    Circle {
        center: String,
        radius: f64,
        #[serde(default)]
        style: LineStyle,
    },
    Ellipse {
        center: String,
        semi_major: f64,
        semi_minor: f64,
        /// Radians, counter-clockwise from the x axis
        #[serde(default)]
        rotation: f64,
        #[serde(default)]
        style: LineStyle,
    },
    Crosshair {
        center: String,
        #[serde(default = "default_crosshair_half_length")]
        half_length: f64,
        #[serde(default)]
        style: LineStyle,
    },
    Text {
        anchor: String,
        template: String,
        #[serde(default)]
        offset: [f64; 2],
        #[serde(default)]
        style: TextStyle,
    },
}

/// Discriminant of [`ElementKind`], used for per-kind policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Point,
    Line,
    Circle,
    Ellipse,
    Crosshair,
    Text,
}

impl ElementKind {
    pub fn element_type(&self) -> ElementType {
        match self {
            ElementKind::Point { .. } => ElementType::Point,
            ElementKind::Line { .. } => ElementType::Line,
            ElementKind::Circle { .. } => ElementType::Circle,
            ElementKind::Ellipse { .. } => ElementType::Ellipse,
            ElementKind::Crosshair { .. } => ElementType::Crosshair,
            ElementKind::Text { .. } => ElementType::Text,
        }
    }

    /// Point names that must resolve for the element to be drawn
    ///
    /// Text templates may reference further points; those are checked when
    /// the template renders.
    pub fn required_points(&self) -> Vec<&str> {
        match self {
            ElementKind::Point { point, .. } => vec![point.as_str()],
            ElementKind::Line { from, to, .. } => vec![from.as_str(), to.as_str()],
            ElementKind::Circle { center, .. }
            | ElementKind::Ellipse { center, .. }
            | ElementKind::Crosshair { center, .. } => vec![center.as_str()],
            ElementKind::Text { anchor, .. } => vec![anchor.as_str()],
        }
    }
}

/// One named thing to draw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayElement {
    pub name: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(flatten)]
    pub kind: ElementKind,
}

impl OverlayElement {
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            name: name.into(),
            visible: true,
            kind,
        }
    }

    pub fn point(name: impl Into<String>, point: impl Into<String>, style: PointStyle) -> Self {
        Self::new(
            name,
            ElementKind::Point {
                point: point.into(),
                style,
                label: None,
                label_offset: default_label_offset(),
                label_style: TextStyle::default(),
            },
        )
    }

    pub fn line(
        name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        style: LineStyle,
    ) -> Self {
        Self::new(
            name,
            ElementKind::Line {
                from: from.into(),
                to: to.into(),
                style,
            },
        )
    }

    pub fn circle(
        name: impl Into<String>,
        center: impl Into<String>,
        radius: f64,
        style: LineStyle,
    ) -> Self {
        Self::new(
            name,
            ElementKind::Circle {
                center: center.into(),
                radius,
                style,
            },
        )
    }

    pub fn ellipse(
        name: impl Into<String>,
        center: impl Into<String>,
        semi_major: f64,
        semi_minor: f64,
        rotation: f64,
        style: LineStyle,
    ) -> Self {
        Self::new(
            name,
            ElementKind::Ellipse {
                center: center.into(),
                semi_major,
                semi_minor,
                rotation,
                style,
            },
        )
    }

    pub fn crosshair(
        name: impl Into<String>,
        center: impl Into<String>,
        half_length: f64,
        style: LineStyle,
    ) -> Self {
        Self::new(
            name,
            ElementKind::Crosshair {
                center: center.into(),
                half_length,
                style,
            },
        )
    }

    pub fn text(
        name: impl Into<String>,
        anchor: impl Into<String>,
        template: impl Into<String>,
        style: TextStyle,
    ) -> Self {
        Self::new(
            name,
            ElementKind::Text {
                anchor: anchor.into(),
                template: template.into(),
                offset: [0.0, 0.0],
                style,
            },
        )
    }

    /// Attach a label to a Point element; no effect on other kinds
    pub fn with_label(mut self, label: impl Into<String>, style: TextStyle) -> Self {
        if let ElementKind::Point {
            label: ref mut current,
            label_style: ref mut current_style,
            ..
        } = self.kind
        {
            *current = Some(label.into());
            *current_style = style;
        }
        self
    }

    /// Shift a Text element away from its anchor; no effect on other kinds
    pub fn with_offset(mut self, dx: f64, dy: f64) -> Self {
        if let ElementKind::Text { ref mut offset, .. } = self.kind {
            *offset = [dx, dy];
        }
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// A point derived from other points or fixed in overlay space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputedPointKind {
    /// Mean of whichever inputs are present
    Centroid { of: Vec<String> },
    /// Fixed overlay coordinates
    Fixed { x: f64, y: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedPoint {
    pub name: String,
    #[serde(flatten)]
    pub kind: ComputedPointKind,
}

/// Camera-independent description of an overlay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayTopology {
    pub name: String,
    #[serde(default)]
    pub computed_points: Vec<ComputedPoint>,
    #[serde(default)]
    pub elements: Vec<OverlayElement>,
}

impl OverlayTopology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_element(mut self, element: OverlayElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn add_element(&mut self, element: OverlayElement) {
        self.elements.push(element);
    }

    pub fn with_centroid(mut self, name: impl Into<String>, of: Vec<String>) -> Self {
        self.computed_points.push(ComputedPoint {
            name: name.into(),
            kind: ComputedPointKind::Centroid { of },
        });
        self
    }

    pub fn with_fixed_point(mut self, name: impl Into<String>, x: f64, y: f64) -> Self {
        self.computed_points.push(ComputedPoint {
            name: name.into(),
            kind: ComputedPointKind::Fixed { x, y },
        });
        self
    }

    pub fn element(&self, name: &str) -> Option<&OverlayElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Check the topology for mistakes that would otherwise show up as
    /// silently missing elements at frame rate
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StreamError::Configuration(msg));

        let mut computed = HashSet::new();
        for point in &self.computed_points {
            if !computed.insert(point.name.as_str()) {
                return invalid(format!(
                    "overlay {}: computed point {} defined twice",
                    self.name, point.name
                ));
            }
            match &point.kind {
                ComputedPointKind::Centroid { of } if of.is_empty() => {
                    return invalid(format!(
                        "overlay {}: centroid {} has no inputs",
                        self.name, point.name
                    ));
                }
                ComputedPointKind::Fixed { x, y } if !x.is_finite() || !y.is_finite() => {
                    return invalid(format!(
                        "overlay {}: fixed point {} is not finite",
                        self.name, point.name
                    ));
                }
                _ => {}
            }
        }

        let mut names = HashSet::new();
        for element in &self.elements {
            if !names.insert(element.name.as_str()) {
                return invalid(format!(
                    "overlay {}: element {} defined twice",
                    self.name, element.name
                ));
            }

            let bad_size = match &element.kind {
                ElementKind::Circle { radius, .. } => !(*radius > 0.0),
                ElementKind::Ellipse {
                    semi_major,
                    semi_minor,
                    ..
                } => !(*semi_major > 0.0 && *semi_minor > 0.0),
                ElementKind::Crosshair { half_length, .. } => !(*half_length > 0.0),
                _ => false,
            };
            if bad_size {
                return invalid(format!(
                    "overlay {}: element {} needs a positive size",
                    self.name, element.name
                ));
            }

            let templates = match &element.kind {
                ElementKind::Text { template, .. } => vec![template],
                ElementKind::Point {
                    label: Some(label), ..
                } => vec![label],
                _ => vec![],
            };
            for template in templates {
                Template::check(template).map_err(|reason| {
                    StreamError::Configuration(format!(
                        "overlay {}: element {} has a bad template: {}",
                        self.name, element.name, reason
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Calibration board overlay
    ///
    /// Draws every corner id below `max_corners`, the outline and id of
    /// every marker below `max_markers`, and a detection summary line.
    pub fn charuco(max_corners: usize, max_markers: usize) -> Self {
        let corner_style = PointStyle {
            radius: 4.0,
            fill: "#00FF00".to_string(),
            stroke: Some("#009600".to_string()),
            opacity: 1.0,
        };
        let corner_label = TextStyle::sized("#00FF00", 10.0);
        let marker_line = LineStyle::stroked("#FF6400", 2.0);
        let marker_label = TextStyle {
            bold: true,
            align: TextAlign::Center,
            stroke: Some("#FF6400".to_string()),
            ..TextStyle::sized("white", 14.0)
        };

        let mut topology = Self::new("charuco").with_fixed_point("info_corner", 10.0, 25.0);

        for id in 0..max_corners {
            let name = format!("charuco_{}", id);
            topology.add_element(
                OverlayElement::point(name.clone(), name, corner_style.clone())
                    .with_label(id.to_string(), corner_label.clone()),
            );
        }

        for id in 0..max_markers {
            let corners: Vec<String> = (0..4)
                .map(|k| format!("aruco_{}_corner_{}", id, k))
                .collect();
            for k in 0..4 {
                topology.add_element(OverlayElement::line(
                    format!("aruco_{}_edge_{}", id, k),
                    corners[k].clone(),
                    corners[(k + 1) % 4].clone(),
                    marker_line.clone(),
                ));
            }
            let center = format!("aruco_{}_center", id);
            topology = topology.with_centroid(center.clone(), corners);
            topology.add_element(OverlayElement::text(
                format!("aruco_{}_id", id),
                center,
                id.to_string(),
                marker_label.clone(),
            ));
        }

        topology.with_element(OverlayElement::text(
            "detection_info",
            "info_corner",
            "Charuco: {n_charuco_detected}/{n_charuco_total}  ArUco: {n_aruco_detected}/{n_aruco_total}",
            TextStyle::sized("white", 14.0),
        ))
    }

    /// Body skeleton overlay for holistic landmark names
    pub fn mediapipe_body() -> Self {
        const KEY_POINTS: [&str; 5] = [
            "nose",
            "left_shoulder",
            "right_shoulder",
            "left_hip",
            "right_hip",
        ];

        let point_style = PointStyle::filled("#00FF00", 4.0);
        let line_style = LineStyle {
            opacity: 0.6,
            ..LineStyle::stroked("rgb(0, 255, 0)", 2.0)
        };
        let label_style = TextStyle::sized("#00FF00", 10.0);

        let mut topology = Self::new("mediapipe_body");

        for (from, to) in BODY_CONNECTIONS {
            topology.add_element(OverlayElement::line(
                format!("{}-{}", from, to),
                from,
                to,
                line_style.clone(),
            ));
        }
        for name in BODY_LANDMARKS {
            let mut element = OverlayElement::point(name, name, point_style.clone());
            if KEY_POINTS.contains(&name) {
                element = element.with_label(name, label_style.clone());
            }
            topology.add_element(element);
        }

        topology
    }
}

/// Holistic body landmark names
pub const BODY_LANDMARKS: [&str; 33] = [
    "nose",
    "left_eye_inner",
    "left_eye",
    "left_eye_outer",
    "right_eye_inner",
    "right_eye",
    "right_eye_outer",
    "left_ear",
    "right_ear",
    "mouth_left",
    "mouth_right",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_pinky",
    "right_pinky",
    "left_index",
    "right_index",
    "left_thumb",
    "right_thumb",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
    "left_heel",
    "right_heel",
    "left_foot_index",
    "right_foot_index",
];

/// Skeleton segments between body landmarks
pub const BODY_CONNECTIONS: [(&str, &str); 35] = [
    ("nose", "left_eye_inner"),
    ("left_eye_inner", "left_eye"),
    ("left_eye", "left_eye_outer"),
    ("left_eye_outer", "left_ear"),
    ("nose", "right_eye_inner"),
    ("right_eye_inner", "right_eye"),
    ("right_eye", "right_eye_outer"),
    ("right_eye_outer", "right_ear"),
    ("mouth_left", "mouth_right"),
    ("left_shoulder", "right_shoulder"),
    ("left_shoulder", "left_elbow"),
    ("left_elbow", "left_wrist"),
    ("left_wrist", "left_pinky"),
    ("left_wrist", "left_index"),
    ("left_wrist", "left_thumb"),
    ("left_pinky", "left_index"),
    ("right_shoulder", "right_elbow"),
    ("right_elbow", "right_wrist"),
    ("right_wrist", "right_pinky"),
    ("right_wrist", "right_index"),
    ("right_wrist", "right_thumb"),
    ("right_pinky", "right_index"),
    ("left_shoulder", "left_hip"),
    ("right_shoulder", "right_hip"),
    ("left_hip", "right_hip"),
    ("left_hip", "left_knee"),
    ("left_knee", "left_ankle"),
    ("left_ankle", "left_heel"),
    ("left_heel", "left_foot_index"),
    ("left_ankle", "left_foot_index"),
    ("right_hip", "right_knee"),
    ("right_knee", "right_ankle"),
    ("right_ankle", "right_heel"),
    ("right_heel", "right_foot_index"),
    ("right_ankle", "right_foot_index"),
];
