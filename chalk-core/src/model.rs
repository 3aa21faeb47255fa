//! Plain board model shared by the store, the renderer and the replicated
//! document. Nothing in here knows about CRDTs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pressure used when an input device does not report one.
pub const DEFAULT_PRESSURE: f64 = 0.5;

/// Values per point in the flat point encoding: x, y, pressure.
const POINT_STRIDE: usize = 3;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    /// `None` when the device reported no pressure.
    pub pressure: Option<f64>,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, pressure: None }
    }

    pub fn with_pressure(x: f64, y: f64, pressure: f64) -> Self {
        Self { x, y, pressure: Some(pressure) }
    }
}

/// Flatten points into `[x0, y0, p0, x1, y1, p1, ...]`.
///
/// Missing pressure is written as [`DEFAULT_PRESSURE`].
pub fn flatten_points(points: &[Point]) -> Vec<f64> {
    let mut flat = Vec::with_capacity(points.len() * POINT_STRIDE);
    for p in points {
        flat.push(p.x);
        flat.push(p.y);
        flat.push(p.pressure.unwrap_or(DEFAULT_PRESSURE));
    }
    flat
}

/// Rebuild points from a flat triple array. A trailing partial triple is dropped.
pub fn unflatten_points(flat: &[f64]) -> Vec<Point> {
    flat.chunks_exact(POINT_STRIDE)
        .map(|c| Point::with_pressure(c[0], c[1], c[2]))
        .collect()
}

/// Drawing tool that produced a stroke.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Pen,
    Highlighter,
    Eraser,
    Line,
    Rectangle,
    Circle,
    Arrow,
    Text,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Pen => "pen",
            Tool::Highlighter => "highlighter",
            Tool::Eraser => "eraser",
            Tool::Line => "line",
            Tool::Rectangle => "rectangle",
            Tool::Circle => "circle",
            Tool::Arrow => "arrow",
            Tool::Text => "text",
        }
    }

    /// Parse a stored tool name. Unknown names fall back to [`Tool::Pen`].
    pub fn parse(raw: &str) -> Tool {
        match raw {
            "highlighter" => Tool::Highlighter,
            "eraser" => Tool::Eraser,
            "line" => Tool::Line,
            "rectangle" => Tool::Rectangle,
            "circle" => Tool::Circle,
            "arrow" => Tool::Arrow,
            "text" => Tool::Text,
            _ => Tool::Pen,
        }
    }
}

/// Page background: one of four flat patterns, or a PDF page underlay.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    #[default]
    White,
    Grid,
    Dots,
    Lined,
    Pdf { url: String, asset_id: String },
}

impl Background {
    /// Name of a flat background, `None` for structured ones.
    pub fn flat_name(&self) -> Option<&'static str> {
        match self {
            Background::White => Some("white"),
            Background::Grid => Some("grid"),
            Background::Dots => Some("dots"),
            Background::Lined => Some("lined"),
            Background::Pdf { .. } => None,
        }
    }

    /// Parse a flat background name. Unknown names become [`Background::White`].
    pub fn from_flat(raw: &str) -> Background {
        match raw {
            "grid" => Background::Grid,
            "dots" => Background::Dots,
            "lined" => Background::Lined,
            _ => Background::White,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Stroke {
    pub id: String,
    pub tool: Tool,
    pub color: String,
    pub size: f64,
    pub opacity: f64,
    pub points: Vec<Point>,
    /// Content of text strokes.
    pub text: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl Stroke {
    pub fn new(tool: Tool, color: impl Into<String>, size: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool,
            color: color.into(),
            size,
            opacity: 1.0,
            points: Vec::new(),
            text: None,
            width: None,
            height: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }
}

/// Partial stroke update. `None` leaves a field untouched; for the optional
/// fields `Some(None)` clears the stored value.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct StrokePatch {
    pub tool: Option<Tool>,
    pub color: Option<String>,
    pub size: Option<f64>,
    pub opacity: Option<f64>,
    pub points: Option<Vec<Point>>,
    pub text: Option<Option<String>>,
    pub width: Option<Option<f64>>,
    pub height: Option<Option<f64>>,
}

impl StrokePatch {
    pub fn is_empty(&self) -> bool {
        *self == StrokePatch::default()
    }

    /// Patch that restores the fields this patch touches to their values in `before`.
    pub fn inverse_for(&self, before: &Stroke) -> StrokePatch {
        StrokePatch {
            tool: self.tool.map(|_| before.tool),
            color: self.color.as_ref().map(|_| before.color.clone()),
            size: self.size.map(|_| before.size),
            opacity: self.opacity.map(|_| before.opacity),
            points: self.points.as_ref().map(|_| before.points.clone()),
            text: self.text.as_ref().map(|_| before.text.clone()),
            width: self.width.map(|_| before.width),
            height: self.height.map(|_| before.height),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[default]
    Image,
    Pdf,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Pdf => "pdf",
        }
    }

    pub fn parse(raw: &str) -> AssetKind {
        match raw {
            "pdf" => AssetKind::Pdf,
            _ => AssetKind::Image,
        }
    }
}

/// An uploaded image (or document page) placed on a board page.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Asset {
    pub id: String,
    pub kind: AssetKind,
    pub src: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub rotation: f64,
}

impl Asset {
    pub fn image(src: impl Into<String>, x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: AssetKind::Image,
            src: src.into(),
            x,
            y,
            w,
            h,
            rotation: 0.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct AssetPatch {
    pub src: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub w: Option<f64>,
    pub h: Option<f64>,
    pub rotation: Option<f64>,
}

impl AssetPatch {
    pub fn is_empty(&self) -> bool {
        *self == AssetPatch::default()
    }

    pub fn inverse_for(&self, before: &Asset) -> AssetPatch {
        AssetPatch {
            src: self.src.as_ref().map(|_| before.src.clone()),
            x: self.x.map(|_| before.x),
            y: self.y.map(|_| before.y),
            w: self.w.map(|_| before.w),
            h: self.h.map(|_| before.h),
            rotation: self.rotation.map(|_| before.rotation),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Page {
    pub id: String,
    pub name: String,
    pub background: Background,
    /// Custom page size; `None` means the default canvas size.
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub strokes: Vec<Stroke>,
    pub assets: Vec<Asset>,
}

impl Page {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Board-level metadata kept in the document's `meta` map.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BoardMeta {
    pub session_id: String,
    pub name: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub revision: u64,
}

impl Default for BoardMeta {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            name: "Untitled".to_string(),
            created_at: 0,
            revision: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_roundtrip_with_pressure() {
        let points = vec![
            Point::with_pressure(10.0, 20.0, 0.5),
            Point::with_pressure(30.0, 40.0, 0.8),
            Point::with_pressure(50.0, 60.0, 0.3),
        ];
        assert_eq!(unflatten_points(&flatten_points(&points)), points);
    }

    #[test]
    fn test_points_missing_pressure_defaults() {
        let points = vec![Point::new(1.0, 2.0), Point::with_pressure(3.0, 4.0, 0.9)];
        let flat = flatten_points(&points);
        assert_eq!(flat, vec![1.0, 2.0, 0.5, 3.0, 4.0, 0.9]);

        let decoded = unflatten_points(&flat);
        assert_eq!(decoded[0], Point::with_pressure(1.0, 2.0, DEFAULT_PRESSURE));
        assert_eq!(decoded[1], points[1]);
    }

    #[test]
    fn test_unflatten_drops_partial_triple() {
        let decoded = unflatten_points(&[1.0, 2.0, 0.4, 7.0, 8.0]);
        assert_eq!(decoded, vec![Point::with_pressure(1.0, 2.0, 0.4)]);
        assert!(unflatten_points(&[1.0, 2.0]).is_empty());
        assert!(unflatten_points(&[]).is_empty());
    }

    #[test]
    fn test_tool_parse_unknown_is_pen() {
        assert_eq!(Tool::parse("highlighter"), Tool::Highlighter);
        assert_eq!(Tool::parse("laser"), Tool::Pen);
        for tool in [Tool::Pen, Tool::Eraser, Tool::Arrow, Tool::Text] {
            assert_eq!(Tool::parse(tool.as_str()), tool);
        }
    }

    #[test]
    fn test_background_flat_names() {
        assert_eq!(Background::from_flat("dots"), Background::Dots);
        assert_eq!(Background::from_flat("checkered"), Background::White);
        assert_eq!(Background::Lined.flat_name(), Some("lined"));
        let pdf = Background::Pdf { url: "u".into(), asset_id: "a".into() };
        assert_eq!(pdf.flat_name(), None);
    }

    #[test]
    fn test_stroke_patch_inverse_only_touches_patched_fields() {
        let before = Stroke::new(Tool::Pen, "#ff0000", 3.0).with_id("s1");
        let patch = StrokePatch {
            color: Some("#00ff00".into()),
            text: Some(Some("hello".into())),
            ..StrokePatch::default()
        };
        let inverse = patch.inverse_for(&before);
        assert_eq!(inverse.color.as_deref(), Some("#ff0000"));
        assert_eq!(inverse.text, Some(None));
        assert_eq!(inverse.size, None);
        assert!(!inverse.is_empty());
        assert!(StrokePatch::default().is_empty());
    }

    #[test]
    fn test_meta_default_name() {
        let meta = BoardMeta::default();
        assert_eq!(meta.name, "Untitled");
        assert_eq!(meta.revision, 0);
    }
}
