//! Overlay topology loading and offline compilation

use anyhow::{bail, Context, Result};
use camstream_protocol::overlay::{CompileReport, OverlayCompiler, OverlayTopology, VisibilityPolicy};
use camstream_protocol::protocol::{Observation, ObservationBundle};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Corner ids drawn by the built-in charuco overlay
pub const CHARUCO_MAX_CORNERS: usize = 100;
/// Marker ids drawn by the built-in charuco overlay
pub const CHARUCO_MAX_MARKERS: usize = 30;

/// Resolve a built-in name or load a topology file
///
/// Files ending in `.toml` are read as TOML, anything else as JSON.
pub fn load_topology(source: &str) -> Result<OverlayTopology> {
    let topology = match source {
        "charuco" => OverlayTopology::charuco(CHARUCO_MAX_CORNERS, CHARUCO_MAX_MARKERS),
        "mediapipe" | "mediapipe_body" => OverlayTopology::mediapipe_body(),
        path => read_topology_file(Path::new(path))?,
    };
    topology
        .validate()
        .with_context(|| format!("Invalid overlay topology '{}'", topology.name))?;
    Ok(topology)
}

fn read_topology_file(path: &Path) -> Result<OverlayTopology> {
    if !path.exists() {
        bail!(
            "'{}' is neither a built-in topology (charuco, mediapipe_body) nor an existing file",
            path.display()
        );
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology file {}", path.display()))?;

    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML topology {}", path.display()))
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON topology {}", path.display()))
    }
}

/// Read one observation or a bundle keyed by camera id
pub fn load_observations(path: &Path) -> Result<ObservationBundle> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read observation file {}", path.display()))?;
    parse_observations(&contents)
        .with_context(|| format!("Failed to parse observation file {}", path.display()))
}

fn parse_observations(contents: &str) -> Result<ObservationBundle> {
    let value: Value = serde_json::from_str(contents)?;
    if value.get("message_type").is_some() {
        let observation: Observation = serde_json::from_value(value)?;
        let mut bundle = ObservationBundle::new();
        bundle.insert(observation.camera_id().to_string(), observation);
        return Ok(bundle);
    }
    Ok(serde_json::from_value(value)?)
}

/// Compile every observation, keyed by camera id
pub fn compile_bundle(
    topology: OverlayTopology,
    policy: VisibilityPolicy,
    bundle: &ObservationBundle,
) -> BTreeMap<String, CompileReport> {
    let compiler = OverlayCompiler::new(topology).with_policy(policy);
    bundle
        .iter()
        .map(|(camera_id, observation)| {
            let points = observation.to_points();
            let report = compiler.compile_with_report(&points, Some(&points.metadata));
            (camera_id.clone(), report)
        })
        .collect()
}

/// JSON rendering of compile results for the CLI
pub fn reports_to_json(reports: &BTreeMap<String, CompileReport>, include_gaps: bool) -> Value {
    let cameras: serde_json::Map<String, Value> = reports
        .iter()
        .map(|(camera_id, report)| {
            let mut entry = json!({ "primitives": report.primitives });
            if include_gaps {
                entry["gaps"] = json!(report.gaps);
            }
            (camera_id.clone(), entry)
        })
        .collect();
    Value::Object(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const OBSERVATION: &str = r#"{
        "message_type": "mediapipe_overlay",
        "camera_id": "2",
        "frame_number": 5,
        "body_points": [
            {"name": "left_shoulder", "x": 10.0, "y": 10.0},
            {"name": "right_shoulder", "x": 30.0, "y": 10.0}
        ],
        "metadata": {"image_width": 640, "image_height": 480}
    }"#;

    #[test]
    fn test_builtin_names() {
        assert_eq!(load_topology("charuco").unwrap().name, "charuco");
        assert_eq!(load_topology("mediapipe").unwrap().name, "mediapipe_body");
        assert!(load_topology("no-such-topology").is_err());
    }

    #[test]
    fn test_toml_topology_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("eyes.toml");
        fs::write(
            &path,
            r#"
name = "shoulders"

[[elements]]
name = "shoulder_line"
type = "line"
from = "left_shoulder"
to = "right_shoulder"
"#,
        )
        .unwrap();

        let topology = load_topology(path.to_str().unwrap()).unwrap();
        assert_eq!(topology.name, "shoulders");
        assert!(topology.element("shoulder_line").is_some());
    }

    #[test]
    fn test_single_observation_becomes_bundle() {
        let bundle = parse_observations(OBSERVATION).unwrap();
        assert_eq!(bundle.len(), 1);
        assert!(bundle.contains_key("2"));
    }

    #[test]
    fn test_compile_bundle_to_json() {
        let bundle = parse_observations(OBSERVATION).unwrap();
        let reports = compile_bundle(
            OverlayTopology::mediapipe_body(),
            VisibilityPolicy::default(),
            &bundle,
        );

        let value = reports_to_json(&reports, true);
        let primitives = value["2"]["primitives"].as_array().unwrap();
        assert!(primitives
            .iter()
            .any(|p| p["element"] == "left_shoulder-right_shoulder" && p["type"] == "line"));
        assert!(!value["2"]["gaps"].as_array().unwrap().is_empty());
    }
}
