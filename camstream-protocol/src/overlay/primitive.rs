//! Renderer-ready overlay output

use super::topology::{LineStyle, PointStyle, TextStyle};
use serde::Serialize;

/// Image-space coordinate
pub type Coord = [f64; 2];

/// A fully resolved element, recomputed every frame
///
/// `element` is the name of the topology element that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DrawablePrimitive {
    Point {
        element: String,
        center: Coord,
        style: PointStyle,
    },
    Line {
        element: String,
        from: Coord,
        to: Coord,
        style: LineStyle,
    },
    Circle {
        element: String,
        center: Coord,
        radius: f64,
        style: LineStyle,
    },
    Ellipse {
        element: String,
        center: Coord,
        semi_major: f64,
        semi_minor: f64,
        rotation: f64,
        style: LineStyle,
    },
    Crosshair {
        element: String,
        center: Coord,
        horizontal: [Coord; 2],
        vertical: [Coord; 2],
        style: LineStyle,
    },
    Text {
        element: String,
        position: Coord,
        text: String,
        style: TextStyle,
    },
}

impl DrawablePrimitive {
    pub fn element(&self) -> &str {
        match self {
            DrawablePrimitive::Point { element, .. }
            | DrawablePrimitive::Line { element, .. }
            | DrawablePrimitive::Circle { element, .. }
            | DrawablePrimitive::Ellipse { element, .. }
            | DrawablePrimitive::Crosshair { element, .. }
            | DrawablePrimitive::Text { element, .. } => element,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DrawablePrimitive::Point { .. } => "point",
            DrawablePrimitive::Line { .. } => "line",
            DrawablePrimitive::Circle { .. } => "circle",
            DrawablePrimitive::Ellipse { .. } => "ellipse",
            DrawablePrimitive::Crosshair { .. } => "crosshair",
            DrawablePrimitive::Text { .. } => "text",
        }
    }

    /// Crosshair segments at a fixed half length around `center`
    pub fn crosshair(element: String, center: Coord, half_length: f64, style: LineStyle) -> Self {
        let [cx, cy] = center;
        DrawablePrimitive::Crosshair {
            element,
            center,
            horizontal: [[cx - half_length, cy], [cx + half_length, cy]],
            vertical: [[cx, cy - half_length], [cx, cy + half_length]],
            style,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crosshair_segments() {
        let p = DrawablePrimitive::crosshair("c".to_string(), [10.0, 20.0], 5.0, LineStyle::default());
        match p {
            DrawablePrimitive::Crosshair {
                horizontal,
                vertical,
                ..
            } => {
                assert_eq!(horizontal, [[5.0, 20.0], [15.0, 20.0]]);
                assert_eq!(vertical, [[10.0, 15.0], [10.0, 25.0]]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let p = DrawablePrimitive::Line {
            element: "eyes".to_string(),
            from: [0.0, 0.0],
            to: [1.0, 1.0],
            style: LineStyle::default(),
        };
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["type"], "line");
        assert_eq!(value["element"], "eyes");
        assert_eq!(p.kind(), "line");
    }
}
