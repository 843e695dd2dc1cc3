// Subtitle mask synthesis
//
// A mask is a single-channel image the size of its frame: 0 keeps the pixel,
// 255 marks it for the inpainting stage.
// - make_mask: one rectangular region, clamped to the image
// - generate_masks: one mask per frame of an extracted frame set
// - synthetic: reproducible frame+mask corpus for demos and tests

pub mod synthetic;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub use synthetic::*;

use crate::error::{DesubError, Result};
use crate::frames::{self, FrameSet, FRAME_PREFIX, MASK_PREFIX};

pub const MASK_FILL: u8 = 255;

/// Rectangle `[x1, x2) x [y1, y2)` in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl Region {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Intersects the region with a `width` x `height` image.
    ///
    /// Returns `None` when nothing of the region is left inside the image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<Rect> {
        let x1 = self.x1.clamp(0, i64::from(width));
        let x2 = self.x2.clamp(0, i64::from(width));
        let y1 = self.y1.clamp(0, i64::from(height));
        let y2 = self.y2.clamp(0, i64::from(height));

        if x1 >= x2 || y1 >= y2 {
            return None;
        }
        Some(Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x1, self.y1, self.x2, self.y2)
    }
}

impl FromStr for Region {
    type Err = DesubError;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DesubError::Config(format!("Invalid region '{}': {}", s, e)))?;

        match values.as_slice() {
            [x1, y1, x2, y2] => Ok(Region::new(*x1, *y1, *x2, *y2)),
            _ => Err(DesubError::Config(format!(
                "Invalid region '{}': expected x1,y1,x2,y2",
                s
            ))),
        }
    }
}

/// All-zero canvas with `region` (clamped to the canvas) set to [`MASK_FILL`].
pub fn make_mask(width: u32, height: u32, region: Region) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    if let Some(rect) = region.clamp(width, height) {
        draw_filled_rect_mut(&mut mask, rect, Luma([MASK_FILL]));
    }
    mask
}

/// Writes `mask_NNNNN.png` for every `frame_NNNNN.png` in `frames_dir`.
///
/// Each mask takes the dimensions of its own frame.
pub fn generate_masks<P: AsRef<Path>, Q: AsRef<Path>>(
    frames_dir: P,
    masks_dir: Q,
    region: Region,
) -> Result<FrameSet> {
    let frames_dir = frames_dir.as_ref();
    let masks_dir = masks_dir.as_ref();

    let frame_set = FrameSet::scan(frames_dir, FRAME_PREFIX)?;
    if frame_set.is_empty() {
        return Err(DesubError::InvalidFrameSet {
            dir: frames_dir.to_path_buf(),
            reason: "no frames to mask".to_string(),
        });
    }

    std::fs::create_dir_all(masks_dir)?;
    info!(
        "Generating subtitle masks for {} frames (region {})",
        frame_set.len(),
        region
    );

    for (index, frame_path) in frame_set.paths() {
        let (width, height) = image::image_dimensions(&frame_path)?;
        let mask_path = masks_dir.join(frames::file_name(MASK_PREFIX, index));
        make_mask(width, height, region).save(&mask_path)?;
        debug!("Wrote {}", mask_path.display());
    }

    let masks = FrameSet::scan(masks_dir, MASK_PREFIX)?;
    info!("Generated {} subtitle masks", masks.len());
    Ok(masks)
}
