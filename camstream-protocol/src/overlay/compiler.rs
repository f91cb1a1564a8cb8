//! Overlay compiler
//!
//! Resolves an [`OverlayTopology`] against one frame's [`PointObservation`].
//! Every element either compiles with its full style or is left out; a
//! missing or low-visibility point is a normal per-frame condition reported
//! as a [`ResolutionGap`], never an error and never a default coordinate.

use super::primitive::{Coord, DrawablePrimitive};
use super::template::{MissingPoint, Template};
use super::topology::{ComputedPointKind, ElementKind, ElementType, OverlayTopology};
use crate::points::{ObservationMetadata, Point, PointObservation};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

fn default_threshold() -> f64 {
    0.5
}

/// Minimum visibility a point needs, per element kind
///
/// Points without a visibility score always qualify.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisibilityPolicy {
    #[serde(default = "default_threshold")]
    pub point: f64,
    #[serde(default = "default_threshold")]
    pub line: f64,
    #[serde(default = "default_threshold")]
    pub circle: f64,
    #[serde(default = "default_threshold")]
    pub ellipse: f64,
    #[serde(default = "default_threshold")]
    pub crosshair: f64,
    #[serde(default = "default_threshold")]
    pub text: f64,
    /// Applied to centroid inputs
    #[serde(default = "default_threshold")]
    pub computed: f64,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self::uniform(default_threshold())
    }
}

impl VisibilityPolicy {
    pub fn uniform(threshold: f64) -> Self {
        Self {
            point: threshold,
            line: threshold,
            circle: threshold,
            ellipse: threshold,
            crosshair: threshold,
            text: threshold,
            computed: threshold,
        }
    }

    pub fn threshold(&self, element_type: ElementType) -> f64 {
        match element_type {
            ElementType::Point => self.point,
            ElementType::Line => self.line,
            ElementType::Circle => self.circle,
            ElementType::Ellipse => self.ellipse,
            ElementType::Crosshair => self.crosshair,
            ElementType::Text => self.text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    Missing,
    BelowVisibility,
    NonFinite,
}

/// A referenced point that kept an element (or its label) from being drawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionGap {
    pub element: String,
    pub point: String,
    pub reason: GapReason,
}

/// Compiled primitives plus what was skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompileReport {
    pub primitives: Vec<DrawablePrimitive>,
    pub gaps: Vec<ResolutionGap>,
}

/// Compile with the default visibility policy
pub fn compile(
    topology: &OverlayTopology,
    points: &PointObservation,
    metadata: Option<&ObservationMetadata>,
) -> Vec<DrawablePrimitive> {
    compile_with_report(topology, &VisibilityPolicy::default(), points, metadata).primitives
}

/// Compile and report the gaps
pub fn compile_with_report(
    topology: &OverlayTopology,
    policy: &VisibilityPolicy,
    points: &PointObservation,
    metadata: Option<&ObservationMetadata>,
) -> CompileReport {
    let templates = parse_templates(topology);
    run(topology, &templates, policy, points, metadata)
}

/// A topology with its templates parsed once
#[derive(Debug, Clone)]
pub struct OverlayCompiler {
    topology: OverlayTopology,
    templates: Vec<Option<Template>>,
    policy: VisibilityPolicy,
}

impl OverlayCompiler {
    pub fn new(topology: OverlayTopology) -> Self {
        let templates = parse_templates(&topology);
        Self {
            topology,
            templates,
            policy: VisibilityPolicy::default(),
        }
    }

    /// Validate first, so authoring mistakes surface once instead of as
    /// elements that never appear
    pub fn try_new(topology: OverlayTopology) -> Result<Self> {
        topology.validate()?;
        Ok(Self::new(topology))
    }

    pub fn with_policy(mut self, policy: VisibilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn topology(&self) -> &OverlayTopology {
        &self.topology
    }

    pub fn policy(&self) -> &VisibilityPolicy {
        &self.policy
    }

    pub fn compile(
        &self,
        points: &PointObservation,
        metadata: Option<&ObservationMetadata>,
    ) -> Vec<DrawablePrimitive> {
        self.compile_with_report(points, metadata).primitives
    }

    pub fn compile_with_report(
        &self,
        points: &PointObservation,
        metadata: Option<&ObservationMetadata>,
    ) -> CompileReport {
        run(
            &self.topology,
            &self.templates,
            &self.policy,
            points,
            metadata,
        )
    }
}

fn parse_templates(topology: &OverlayTopology) -> Vec<Option<Template>> {
    topology
        .elements
        .iter()
        .map(|e| match &e.kind {
            ElementKind::Text { template, .. } => Some(Template::parse(template)),
            ElementKind::Point {
                label: Some(label), ..
            } => Some(Template::parse(label)),
            _ => None,
        })
        .collect()
}

/// Observed points first, then the topology's computed points
struct Resolver<'a> {
    observed: &'a PointObservation,
    computed: HashMap<&'a str, Point>,
}

impl<'a> Resolver<'a> {
    fn new(
        topology: &'a OverlayTopology,
        observed: &'a PointObservation,
        policy: &VisibilityPolicy,
    ) -> Self {
        let mut computed = HashMap::new();
        for point in &topology.computed_points {
            let value = match &point.kind {
                ComputedPointKind::Fixed { x, y } => Some(Point::new(*x, *y)),
                ComputedPointKind::Centroid { of } => {
                    let inputs: Vec<&Point> = of
                        .iter()
                        .filter_map(|name| observed.get(name))
                        .filter(|p| p.passes(policy.computed))
                        .collect();
                    if inputs.is_empty() {
                        None
                    } else {
                        let n = inputs.len() as f64;
                        let x = inputs.iter().map(|p| p.x).sum::<f64>() / n;
                        let y = inputs.iter().map(|p| p.y).sum::<f64>() / n;
                        Some(Point::new(x, y))
                    }
                }
            };
            if let Some(value) = value {
                computed.insert(point.name.as_str(), value);
            }
        }
        Self { observed, computed }
    }

    fn resolve(&self, name: &str, threshold: f64) -> std::result::Result<Point, GapReason> {
        if let Some(point) = self.observed.get(name) {
            if !point.is_finite() {
                return Err(GapReason::NonFinite);
            }
            if !point.passes(threshold) {
                return Err(GapReason::BelowVisibility);
            }
            return Ok(*point);
        }
        self.computed
            .get(name)
            .copied()
            .ok_or(GapReason::Missing)
    }
}

fn offset(p: &Point, by: [f64; 2]) -> Coord {
    [p.x + by[0], p.y + by[1]]
}

fn run(
    topology: &OverlayTopology,
    templates: &[Option<Template>],
    policy: &VisibilityPolicy,
    points: &PointObservation,
    metadata: Option<&ObservationMetadata>,
) -> CompileReport {
    let metadata = metadata.unwrap_or(&points.metadata);
    let resolver = Resolver::new(topology, points, policy);
    let mut report = CompileReport::default();

    for (element, template) in topology.elements.iter().zip(templates) {
        if !element.visible {
            continue;
        }
        let threshold = policy.threshold(element.kind.element_type());

        let mut resolved = Vec::with_capacity(2);
        let mut missing = false;
        for name in element.kind.required_points() {
            match resolver.resolve(name, threshold) {
                Ok(point) => resolved.push(point),
                Err(reason) => {
                    missing = true;
                    report.gaps.push(ResolutionGap {
                        element: element.name.clone(),
                        point: name.to_string(),
                        reason,
                    });
                }
            }
        }
        if missing {
            trace!("Skipping overlay element {}", element.name);
            continue;
        }

        let lookup = |name: &str| resolver.resolve(name, threshold).ok();
        let name = element.name.clone();

        match (&element.kind, resolved.as_slice()) {
            (
                ElementKind::Point {
                    style,
                    label_offset,
                    label_style,
                    ..
                },
                [p],
            ) => {
                report.primitives.push(DrawablePrimitive::Point {
                    element: name.clone(),
                    center: [p.x, p.y],
                    style: style.clone(),
                });
                if let Some(template) = template {
                    match template.render(Some(p), lookup, metadata) {
                        Ok(text) => report.primitives.push(DrawablePrimitive::Text {
                            element: name,
                            position: offset(p, *label_offset),
                            text,
                            style: label_style.clone(),
                        }),
                        Err(MissingPoint(point)) => report.gaps.push(ResolutionGap {
                            element: name,
                            point,
                            reason: GapReason::Missing,
                        }),
                    }
                }
            }
            (ElementKind::Line { style, .. }, [a, b]) => {
                report.primitives.push(DrawablePrimitive::Line {
                    element: name,
                    from: [a.x, a.y],
                    to: [b.x, b.y],
                    style: style.clone(),
                });
            }
            (ElementKind::Circle { radius, style, .. }, [c]) => {
                report.primitives.push(DrawablePrimitive::Circle {
                    element: name,
                    center: [c.x, c.y],
                    radius: *radius,
                    style: style.clone(),
                });
            }
            (
                ElementKind::Ellipse {
                    semi_major,
                    semi_minor,
                    rotation,
                    style,
                    ..
                },
                [c],
            ) => {
                report.primitives.push(DrawablePrimitive::Ellipse {
                    element: name,
                    center: [c.x, c.y],
                    semi_major: *semi_major,
                    semi_minor: *semi_minor,
                    rotation: *rotation,
                    style: style.clone(),
                });
            }
            (
                ElementKind::Crosshair {
                    half_length, style, ..
                },
                [c],
            ) => {
                report.primitives.push(DrawablePrimitive::crosshair(
                    name,
                    [c.x, c.y],
                    *half_length,
                    style.clone(),
                ));
            }
            (
                ElementKind::Text {
                    offset: by, style, ..
                },
                [anchor],
            ) => {
                let Some(template) = template else {
                    continue;
                };
                match template.render(Some(anchor), lookup, metadata) {
                    Ok(text) => report.primitives.push(DrawablePrimitive::Text {
                        element: name,
                        position: offset(anchor, *by),
                        text,
                        style: style.clone(),
                    }),
                    Err(MissingPoint(point)) => report.gaps.push(ResolutionGap {
                        element: name,
                        point,
                        reason: GapReason::Missing,
                    }),
                }
            }
            _ => {}
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::topology::{LineStyle, OverlayElement, PointStyle, TextStyle};

    fn face() -> OverlayTopology {
        OverlayTopology::new("face").with_element(OverlayElement::line(
            "eyes",
            "leftEye",
            "rightEye",
            LineStyle::default(),
        ))
    }

    #[test]
    fn test_missing_point_compiles_to_nothing() {
        let topology = OverlayTopology::new("nose").with_element(OverlayElement::point(
            "nose",
            "nose",
            PointStyle::default(),
        ));
        let primitives = compile(&topology, &PointObservation::new(), None);
        assert!(primitives.is_empty());
    }

    #[test]
    fn test_line_needs_both_endpoints() {
        let mut points = PointObservation::new().with_point("leftEye", Point::new(10.0, 20.0));
        assert!(compile(&face(), &points, None).is_empty());

        points.insert("rightEye", Point::new(30.0, 20.0));
        let primitives = compile(&face(), &points, None);
        assert_eq!(
            primitives,
            vec![DrawablePrimitive::Line {
                element: "eyes".to_string(),
                from: [10.0, 20.0],
                to: [30.0, 20.0],
                style: LineStyle::default(),
            }]
        );
    }

    #[test]
    fn test_gap_reported() {
        let points = PointObservation::new()
            .with_point("leftEye", Point::new(10.0, 20.0))
            .with_point("rightEye", Point::new(30.0, 20.0).with_visibility(0.1));

        let report = compile_with_report(&face(), &VisibilityPolicy::default(), &points, None);
        assert!(report.primitives.is_empty());
        assert_eq!(
            report.gaps,
            vec![ResolutionGap {
                element: "eyes".to_string(),
                point: "rightEye".to_string(),
                reason: GapReason::BelowVisibility,
            }]
        );
    }

    #[test]
    fn test_visibility_policy_per_kind() {
        let topology = OverlayTopology::new("t")
            .with_element(OverlayElement::point("p", "nose", PointStyle::default()))
            .with_element(OverlayElement::crosshair("c", "nose", 8.0, LineStyle::default()));
        let points = PointObservation::new().with_point("nose", Point::new(1.0, 1.0).with_visibility(0.4));

        let policy = VisibilityPolicy {
            crosshair: 0.3,
            ..VisibilityPolicy::default()
        };
        let primitives = compile_with_report(&topology, &policy, &points, None).primitives;

        assert_eq!(primitives.len(), 1);
        assert_eq!(primitives[0].kind(), "crosshair");
    }

    #[test]
    fn test_non_finite_point_skipped() {
        let topology = OverlayTopology::new("t").with_element(OverlayElement::circle(
            "c",
            "wrist",
            5.0,
            LineStyle::default(),
        ));
        let points = PointObservation::new().with_point("wrist", Point::new(f64::NAN, 1.0));
        let report = compile_with_report(&topology, &VisibilityPolicy::default(), &points, None);
        assert!(report.primitives.is_empty());
        assert_eq!(report.gaps[0].reason, GapReason::NonFinite);
    }

    #[test]
    fn test_point_label_and_centroid() {
        let topology = OverlayTopology::new("t")
            .with_centroid("mid", vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .with_element(
                OverlayElement::point("mid", "mid", PointStyle::default())
                    .with_label("{x:.0},{y:.0}", TextStyle::default()),
            );
        let points = PointObservation::new()
            .with_point("a", Point::new(0.0, 0.0))
            .with_point("b", Point::new(10.0, 20.0));

        let primitives = compile(&topology, &points, None);
        assert_eq!(primitives.len(), 2);
        assert_eq!(
            primitives[1],
            DrawablePrimitive::Text {
                element: "mid".to_string(),
                position: [10.0, 5.0],
                text: "5,10".to_string(),
                style: TextStyle::default(),
            }
        );
    }

    #[test]
    fn test_centroid_absent_without_inputs() {
        let topology = OverlayTopology::new("t")
            .with_centroid("mid", vec!["a".to_string()])
            .with_element(OverlayElement::point("mid", "mid", PointStyle::default()));
        assert!(compile(&topology, &PointObservation::new(), None).is_empty());
    }

    #[test]
    fn test_fixed_anchor_text_uses_metadata() {
        let topology = OverlayTopology::new("hud")
            .with_fixed_point("corner", 10.0, 25.0)
            .with_element(OverlayElement::text(
                "info",
                "corner",
                "frame {frame_number}: {n_body_detected}",
                TextStyle::default(),
            ));
        let mut metadata = ObservationMetadata {
            frame_number: Some(9),
            ..ObservationMetadata::default()
        };
        metadata.counts.insert("n_body_detected".to_string(), 1);

        let primitives = compile(&topology, &PointObservation::new(), Some(&metadata));
        match &primitives[..] {
            [DrawablePrimitive::Text { position, text, .. }] => {
                assert_eq!(*position, [10.0, 25.0]);
                assert_eq!(text, "frame 9: 1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_referencing_missing_point_is_skipped() {
        let topology = OverlayTopology::new("hud")
            .with_fixed_point("corner", 0.0, 0.0)
            .with_element(OverlayElement::text(
                "nose_readout",
                "corner",
                "nose {nose.x:.1}",
                TextStyle::default(),
            ));
        let report = compile_with_report(
            &topology,
            &VisibilityPolicy::default(),
            &PointObservation::new(),
            None,
        );
        assert!(report.primitives.is_empty());
        assert_eq!(report.gaps[0].point, "nose");
    }

    #[test]
    fn test_hidden_elements_skipped() {
        let topology = OverlayTopology::new("t")
            .with_element(OverlayElement::point("p", "nose", PointStyle::default()).hidden());
        let points = PointObservation::new().with_point("nose", Point::new(1.0, 1.0));
        assert!(compile(&topology, &points, None).is_empty());
    }

    #[test]
    fn test_compiler_reuses_templates() {
        let compiler = OverlayCompiler::try_new(OverlayTopology::charuco(2, 1)).unwrap();
        let points = PointObservation::new()
            .with_point("charuco_0", Point::new(1.0, 1.0))
            .with_point("aruco_0_corner_0", Point::new(0.0, 0.0))
            .with_point("aruco_0_corner_1", Point::new(4.0, 0.0))
            .with_point("aruco_0_corner_2", Point::new(4.0, 4.0))
            .with_point("aruco_0_corner_3", Point::new(0.0, 4.0));

        let primitives = compiler.compile(&points, None);
        let kinds: Vec<&str> = primitives.iter().map(|p| p.kind()).collect();
        // corner point + label, 4 edges, marker id, info line
        assert_eq!(kinds.iter().filter(|k| **k == "line").count(), 4);
        assert_eq!(kinds.iter().filter(|k| **k == "text").count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == "point").count(), 1);
    }
}
