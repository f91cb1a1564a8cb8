//! Overlay Compiler
//!
//! Turns named landmark data plus a declarative [`OverlayTopology`] into
//! renderer-agnostic [`DrawablePrimitive`]s.
//!
//! ```rust
//! use camstream_protocol::overlay::{compile, LineStyle, OverlayElement, OverlayTopology};
//! use camstream_protocol::points::{Point, PointObservation};
//!
//! let topology = OverlayTopology::new("eyes").with_element(OverlayElement::line(
//!     "eye_line",
//!     "left_eye",
//!     "right_eye",
//!     LineStyle::default(),
//! ));
//!
//! let points = PointObservation::new().with_point("left_eye", Point::new(10.0, 20.0));
//! assert!(compile(&topology, &points, None).is_empty());
//!
//! let points = points.with_point("right_eye", Point::new(30.0, 20.0));
//! assert_eq!(compile(&topology, &points, None).len(), 1);
//! ```

pub mod compiler;
pub mod primitive;
pub mod template;
pub mod topology;

pub use compiler::{
    compile, compile_with_report, CompileReport, GapReason, OverlayCompiler, ResolutionGap,
    VisibilityPolicy,
};
pub use primitive::{Coord, DrawablePrimitive};
pub use template::Template;
pub use topology::{
    ComputedPoint, ComputedPointKind, ElementKind, ElementType, LineStyle, OverlayElement,
    OverlayTopology, PointStyle, TextAlign, TextStyle,
};
