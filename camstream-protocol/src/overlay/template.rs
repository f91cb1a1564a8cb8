//! Dynamic text templates
//!
//! Placeholders in braces are filled from live frame data:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{x}` `{y}` `{z}` `{visibility}` | field of the element's anchor point |
//! | `{nose.x}` | field of any named point |
//! | `{frame_number}` `{image_width}` `{image_height}` | observation metadata |
//! | `{n_charuco_detected}` (any other name) | metadata counter |
//!
//! A `:.N` suffix sets the decimal places, e.g. `{x:.1}`. Literal braces are
//! written `{{` and `}}`. A named point that is absent makes the whole
//! render fail so the element can be skipped; absent metadata renders `-`.

use crate::points::{ObservationMetadata, Point};

const ABSENT: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointField {
    X,
    Y,
    Z,
    Visibility,
}

impl PointField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "x" => Some(PointField::X),
            "y" => Some(PointField::Y),
            "z" => Some(PointField::Z),
            "visibility" => Some(PointField::Visibility),
            _ => None,
        }
    }

    fn read(self, point: &Point) -> Option<f64> {
        match self {
            PointField::X => Some(point.x),
            PointField::Y => Some(point.y),
            PointField::Z => point.z,
            PointField::Visibility => point.visibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Anchor(PointField),
    Point { name: String, field: PointField },
    FrameNumber,
    ImageWidth,
    ImageHeight,
    Counter(String),
}

impl Placeholder {
    fn parse(key: &str) -> Self {
        if let Some(field) = PointField::parse(key) {
            return Placeholder::Anchor(field);
        }
        match key {
            "frame_number" => return Placeholder::FrameNumber,
            "image_width" => return Placeholder::ImageWidth,
            "image_height" => return Placeholder::ImageHeight,
            _ => {}
        }
        if let Some((name, field)) = key.rsplit_once('.') {
            if let Some(field) = PointField::parse(field) {
                if !name.is_empty() {
                    return Placeholder::Point {
                        name: name.to_string(),
                        field,
                    };
                }
            }
        }
        Placeholder::Counter(key.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value {
        placeholder: Placeholder,
        precision: Option<usize>,
    },
}

/// A named point the template needed but could not find
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPoint(pub String);

/// Parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse leniently: anything that is not a well-formed placeholder is
    /// kept as literal text
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(i) = rest.find(['{', '}']) {
            literal.push_str(&rest[..i]);
            let tail = &rest[i..];

            if tail.starts_with("{{") || tail.starts_with("}}") {
                literal.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }

            if tail.starts_with('{') {
                if let Some(end) = tail.find('}') {
                    if let Some(segment) = parse_placeholder(&tail[1..end]) {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        segments.push(segment);
                        rest = &tail[end + 1..];
                        continue;
                    }
                }
            }

            literal.push_str(&tail[..1]);
            rest = &tail[1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    /// Strict well-formedness check used when validating a topology
    pub fn check(source: &str) -> std::result::Result<(), String> {
        let bytes = source.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => i += 2,
                b'}' if bytes.get(i + 1) == Some(&b'}') => i += 2,
                b'{' => {
                    let Some(len) = source[i + 1..].find('}') else {
                        return Err(format!("unclosed '{{' at byte {}", i));
                    };
                    let body = &source[i + 1..i + 1 + len];
                    if body.contains('{') {
                        return Err(format!("nested '{{' at byte {}", i));
                    }
                    if parse_placeholder(body).is_none() {
                        return Err(format!("bad placeholder {{{}}}", body));
                    }
                    i += len + 2;
                }
                b'}' => return Err(format!("unmatched '}}' at byte {}", i)),
                _ => i += 1,
            }
        }
        Ok(())
    }

    /// Point names referenced explicitly (not the anchor)
    pub fn referenced_points(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Value {
                    placeholder: Placeholder::Point { name, .. },
                    ..
                } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Fill in the placeholders
    ///
    /// `lookup` resolves named points with whatever visibility policy the
    /// caller applies.
    pub fn render<F>(
        &self,
        anchor: Option<&Point>,
        lookup: F,
        metadata: &ObservationMetadata,
    ) -> std::result::Result<String, MissingPoint>
    where
        F: Fn(&str) -> Option<Point>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value {
                    placeholder,
                    precision,
                } => {
                    let rendered = match placeholder {
                        Placeholder::Anchor(field) => {
                            format_float(anchor.and_then(|p| field.read(p)), *precision)
                        }
                        Placeholder::Point { name, field } => {
                            let point = lookup(name).ok_or_else(|| MissingPoint(name.clone()))?;
                            format_float(field.read(&point), *precision)
                        }
                        Placeholder::FrameNumber => format_int(metadata.frame_number.map(|n| n as i64)),
                        Placeholder::ImageWidth => format_int(metadata.image_width.map(i64::from)),
                        Placeholder::ImageHeight => format_int(metadata.image_height.map(i64::from)),
                        Placeholder::Counter(name) => format_int(metadata.count(name)),
                    };
                    out.push_str(&rendered);
                }
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(body: &str) -> Option<Segment> {
    let (key, precision) = match body.split_once(':') {
        Some((key, format)) => {
            let digits = format.strip_prefix('.')?;
            (key, Some(digits.parse::<usize>().ok()?))
        }
        None => (body, None),
    };
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(Segment::Value {
        placeholder: Placeholder::parse(key),
        precision,
    })
}

fn format_float(value: Option<f64>, precision: Option<usize>) -> String {
    match (value, precision) {
        (Some(v), Some(p)) => format!("{:.*}", p, v),
        (Some(v), None) => format!("{}", v),
        (None, _) => ABSENT.to_string(),
    }
}

fn format_int(value: Option<i64>) -> String {
    value.map_or_else(|| ABSENT.to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn metadata() -> ObservationMetadata {
        ObservationMetadata {
            frame_number: Some(42),
            image_width: Some(1280),
            image_height: None,
            counts: BTreeMap::from([("n_charuco_detected".to_string(), 7)]),
        }
    }

    fn no_points(_: &str) -> Option<Point> {
        None
    }

    #[test]
    fn test_anchor_fields_with_precision() {
        let template = Template::parse("({x:.1}, {y:.1}) v={visibility}");
        let anchor = Point::new(1.24, 2.0);
        let text = template.render(Some(&anchor), no_points, &metadata()).unwrap();
        assert_eq!(text, "(1.2, 2.0) v=-");
    }

    #[test]
    fn test_metadata_and_counters() {
        let template = Template::parse("#{frame_number} {image_width}x{image_height} c={n_charuco_detected} m={missing}");
        let text = template.render(None, no_points, &metadata()).unwrap();
        assert_eq!(text, "#42 1280x- c=7 m=-");
    }

    #[test]
    fn test_named_point_reference() {
        let template = Template::parse("nose at {nose.x:.0}");
        let lookup = |name: &str| (name == "nose").then(|| Point::new(99.6, 0.0));
        assert_eq!(
            template.render(None, lookup, &metadata()).unwrap(),
            "nose at 100"
        );
        assert_eq!(template.referenced_points(), vec!["nose"]);

        assert_eq!(
            template.render(None, no_points, &metadata()),
            Err(MissingPoint("nose".to_string()))
        );
    }

    #[test]
    fn test_escaped_braces_and_static() {
        let template = Template::parse("{{literal}}");
        assert!(template.is_static());
        assert_eq!(
            template.render(None, no_points, &metadata()).unwrap(),
            "{literal}"
        );
    }

    #[test]
    fn test_lenient_parse_keeps_garbage() {
        let template = Template::parse("open { brace");
        assert_eq!(
            template.render(None, no_points, &metadata()).unwrap(),
            "open { brace"
        );
    }

    #[test]
    fn test_strict_check() {
        assert!(Template::check("ok {x:.2} {{ }}").is_ok());
        assert!(Template::check("open {x").is_err());
        assert!(Template::check("close }").is_err());
        assert!(Template::check("{x:2}").is_err());
        assert!(Template::check("{}").is_err());
    }
}
