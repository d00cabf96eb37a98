//! Square crop geometry around a detected face.
//!
//! Turns one face box plus the source image size into a square crop
//! rectangle under a named framing mode. Every rectangle returned here is
//! square, non-empty and fully inside the image; when the ideal framing
//! would leave the image the crop is slid back inside rather than shrunk
//! or padded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CropConfig;
use crate::types::BoundingBox;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("image dimensions must be positive, got {height}x{width} (h x w)")]
    ZeroDimension { height: u32, width: u32 },
    #[error("bounding box is empty or inverted: {bbox:?}")]
    InvertedBox { bbox: BoundingBox },
    #[error("bounding box {bbox:?} exceeds image bounds {height}x{width} (h x w)")]
    BoxOutOfBounds {
        bbox: BoundingBox,
        height: u32,
        width: u32,
    },
}

/// Framing policy for a crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    /// Tight hairline-to-chin framing.
    Face,
    /// Wide framing biased down toward the upper torso.
    Body,
}

impl CropMode {
    pub const ALL: [CropMode; 2] = [CropMode::Face, CropMode::Body];

    pub fn as_str(self) -> &'static str {
        match self {
            CropMode::Face => "face",
            CropMode::Body => "body",
        }
    }
}

impl fmt::Display for CropMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "face" => Ok(CropMode::Face),
            "body" => Ok(CropMode::Body),
            other => Err(format!("unknown crop mode '{other}' (expected face or body)")),
        }
    }
}

/// Square crop rectangle in source pixel coordinates, half-open on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub y1: u32,
    pub y2: u32,
    pub x1: u32,
    pub x2: u32,
}

impl CropRect {
    pub fn side(&self) -> u32 {
        self.x2 - self.x1
    }

    /// `(y1, y2, x1, x2)`, the row-then-column slicing order.
    pub fn as_tuple(&self) -> (u32, u32, u32, u32) {
        (self.y1, self.y2, self.x1, self.x2)
    }
}

/// A mode-specific crop computed from a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropSpec {
    pub mode: CropMode,
    pub rect: CropRect,
}

/// Result of planning a crop for an image whose primary face may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CropPlan {
    /// A face was available: framed by the requested mode.
    Framed(CropSpec),
    /// No face: largest centered square.
    Fallback { rect: CropRect },
}

impl CropPlan {
    pub fn rect(&self) -> CropRect {
        match self {
            CropPlan::Framed(spec) => spec.rect,
            CropPlan::Fallback { rect } => *rect,
        }
    }

    pub fn mode(&self) -> Option<CropMode> {
        match self {
            CropPlan::Framed(spec) => Some(spec.mode),
            CropPlan::Fallback { .. } => None,
        }
    }
}

fn check_dimensions(image_height: u32, image_width: u32) -> Result<(), InputError> {
    if image_height == 0 || image_width == 0 {
        return Err(InputError::ZeroDimension {
            height: image_height,
            width: image_width,
        });
    }
    Ok(())
}

fn check_bbox(image_height: u32, image_width: u32, bbox: &BoundingBox) -> Result<(), InputError> {
    if bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
        return Err(InputError::InvertedBox { bbox: *bbox });
    }
    if bbox.x1 < 0
        || bbox.y1 < 0
        || bbox.x2 as i64 > image_width as i64
        || bbox.y2 as i64 > image_height as i64
    {
        return Err(InputError::BoxOutOfBounds {
            bbox: *bbox,
            height: image_height,
            width: image_width,
        });
    }
    Ok(())
}

/// Start offset of a `side`-long span centered as close to `center` as the
/// `[0, dim)` axis allows.
///
/// Equivalent to clamping the center into `[half, dim - (side - half)]`,
/// which for even sides is the familiar `[half, dim - half]`.
fn clamp_span_start(center: f64, side: u32, dim: u32) -> u32 {
    let half = (side / 2) as i64;
    let max_start = (dim - side) as i64;
    let start = center.round() as i64 - half;
    start.clamp(0, max_start) as u32
}

/// Compute the square crop for `bbox` under `mode`.
///
/// Side lengths round half away from zero. The final side never exceeds
/// the shorter image edge and is at least one pixel.
pub fn compute_crop(
    image_height: u32,
    image_width: u32,
    bbox: &BoundingBox,
    mode: CropMode,
    config: &CropConfig,
) -> Result<CropRect, InputError> {
    check_dimensions(image_height, image_width)?;
    check_bbox(image_height, image_width, bbox)?;

    let fw = bbox.width() as f64;
    let fh = bbox.height() as f64;
    let cx = (bbox.x1 as f64 + bbox.x2 as f64) / 2.0;
    let mut cy = (bbox.y1 as f64 + bbox.y2 as f64) / 2.0;
    let short_edge = image_height.min(image_width) as f64;

    let target = match mode {
        CropMode::Face => {
            // Detector boxes sit low on the face; lift toward the hairline.
            cy -= config.face_shift * fh;
            (fw.max(fh) * config.face_scale).round()
        }
        CropMode::Body => {
            let target = (fw.max(fh) * config.body_scale).round().min(short_edge);
            cy += config.body_shift * target;
            target
        }
    };

    let side = if target.is_finite() && target >= 1.0 {
        (target.min(short_edge)) as u32
    } else {
        1
    };

    let y1 = clamp_span_start(cy, side, image_height);
    let x1 = clamp_span_start(cx, side, image_width);

    Ok(CropRect {
        y1,
        y2: y1 + side,
        x1,
        x2: x1 + side,
    })
}

/// Largest square centered on the image, used when no face was detected.
pub fn center_square(image_height: u32, image_width: u32) -> Result<CropRect, InputError> {
    check_dimensions(image_height, image_width)?;

    let side = image_height.min(image_width);
    let y1 = image_height / 2 - side / 2;
    let x1 = image_width / 2 - side / 2;

    Ok(CropRect {
        y1,
        y2: y1 + side,
        x1,
        x2: x1 + side,
    })
}

/// Plan a crop for one image, falling back to [`center_square`] when
/// `face` is `None`.
pub fn plan_crop(
    image_height: u32,
    image_width: u32,
    face: Option<&BoundingBox>,
    mode: CropMode,
    config: &CropConfig,
) -> Result<CropPlan, InputError> {
    match face {
        Some(bbox) => {
            let rect = compute_crop(image_height, image_width, bbox, mode, config)?;
            Ok(CropPlan::Framed(CropSpec { mode, rect }))
        }
        None => {
            let rect = center_square(image_height, image_width)?;
            tracing::debug!(
                height = image_height,
                width = image_width,
                side = rect.side(),
                "no face; using centered square"
            );
            Ok(CropPlan::Fallback { rect })
        }
    }
}

/// Plan one crop per requested mode.
///
/// Without a face a single fallback plan is returned however many modes
/// were requested, since every mode would resolve to the same rectangle.
pub fn plan_crops(
    image_height: u32,
    image_width: u32,
    face: Option<&BoundingBox>,
    modes: &[CropMode],
    config: &CropConfig,
) -> Result<Vec<CropPlan>, InputError> {
    if face.is_none() {
        return Ok(vec![plan_crop(image_height, image_width, None, CropMode::Face, config)?]);
    }
    modes
        .iter()
        .map(|&mode| plan_crop(image_height, image_width, face, mode, config))
        .collect()
}
