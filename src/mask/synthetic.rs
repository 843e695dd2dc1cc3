use ab_glyph::{FontRef, PxScale};
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::f64::consts::PI;
use std::path::Path;
use tracing::info;

use super::{make_mask, Region};
use crate::error::{DesubError, Result};
use crate::frames::{self, FrameSet, FRAME_PREFIX, MASK_PREFIX};

const SUBTITLE_LINES: [&str; 5] = [
    "This is a sample subtitle",
    "Subtitle text to remove",
    "Burnt-in subtitle example",
    "Frame {} subtitle",
    "Inpainting will remove this",
];

const SUBTITLE_PADDING: u32 = 3;

static OVERLAY_FONT: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");

fn overlay_font() -> Result<FontRef<'static>> {
    Ok(FontRef::try_from_slice(OVERLAY_FONT)?)
}

/// Frames and masks of a generated demo corpus.
#[derive(Debug, Clone)]
pub struct DemoCorpus {
    pub frames: FrameSet,
    pub masks: FrameSet,
}

/// Writes `frame_count` synthetic frames and their masks, indexed from 1.
///
/// Output is fully determined by the arguments.
pub fn synthesize_demo_corpus<P: AsRef<Path>, Q: AsRef<Path>>(
    frames_dir: P,
    masks_dir: Q,
    frame_count: u32,
    frame_size: (u32, u32),
    region: Region,
) -> Result<DemoCorpus> {
    let frames_dir = frames_dir.as_ref();
    let masks_dir = masks_dir.as_ref();
    let (width, height) = frame_size;

    if frame_count == 0 || width == 0 || height == 0 {
        return Err(DesubError::Config(format!(
            "Demo corpus needs at least one non-empty frame (count {}, size {}x{})",
            frame_count, width, height
        )));
    }

    std::fs::create_dir_all(frames_dir)?;
    std::fs::create_dir_all(masks_dir)?;

    info!(
        "Generating {} synthetic {}x{} frames (subtitle region {})",
        frame_count, width, height, region
    );

    let mask = make_mask(width, height, region);
    for index in 1..=frame_count {
        render_frame(index, frame_count, frame_size, region)?
            .save(frames_dir.join(frames::file_name(FRAME_PREFIX, index)))?;
        mask.save(masks_dir.join(frames::file_name(MASK_PREFIX, index)))?;
    }

    let corpus = DemoCorpus {
        frames: FrameSet::scan_valid(frames_dir, FRAME_PREFIX)?,
        masks: FrameSet::scan_valid(masks_dir, MASK_PREFIX)?,
    };
    info!(
        "Generated {} frames in {} and masks in {}",
        corpus.frames.len(),
        frames_dir.display(),
        masks_dir.display()
    );
    Ok(corpus)
}

/// Renders frame `index` (1-based) of a `frame_count` long corpus.
pub fn render_frame(
    index: u32,
    frame_count: u32,
    frame_size: (u32, u32),
    region: Region,
) -> Result<RgbImage> {
    let (width, height) = frame_size;
    let font = overlay_font()?;
    let i = f64::from(index);
    let phase = frame_phase(index, frame_count);

    let mut img = RgbImage::from_fn(width, height, |x, y| background(phase, x, y));

    let sx = f64::from(width) / 256.0;
    let sy = f64::from(height) / 256.0;

    draw_text_mut(
        &mut img,
        Rgb([255, 255, 255]),
        (20.0 * sx) as i32,
        (28.0 * sy) as i32,
        PxScale::from((20.0 * sy).max(1.0) as f32),
        &font,
        &format!("Test video frame {:02}", index),
    );
    draw_text_mut(
        &mut img,
        Rgb([200, 200, 200]),
        (20.0 * sx) as i32,
        (60.0 * sy) as i32,
        PxScale::from((14.0 * sy).max(1.0) as f32),
        &font,
        "Sample content",
    );

    let center_x = (128.0 + 50.0 * (i / 5.0).sin()) * sx;
    let center_y = (120.0 + 30.0 * (i / 3.0).cos()) * sy;
    let radius = (15.0 * sx.min(sy)).max(1.0);
    draw_filled_circle_mut(
        &mut img,
        (center_x as i32, center_y as i32),
        radius as i32,
        Rgb([255, 255, 0]),
    );

    if let Some(rect) = region.clamp(width, height) {
        draw_subtitle(&mut img, &font, &subtitle_line(index), rect);
    }

    Ok(img)
}

fn frame_phase(index: u32, frame_count: u32) -> f64 {
    f64::from(index) / f64::from(frame_count.max(1)) * 2.0 * PI
}

fn background(phase: f64, x: u32, y: u32) -> Rgb<u8> {
    let (x, y) = (f64::from(x), f64::from(y));
    Rgb([
        channel(phase + x / 30.0),
        channel(phase + y / 30.0 + PI / 3.0),
        channel(phase + (x + y) / 40.0 + 2.0 * PI / 3.0),
    ])
}

fn channel(angle: f64) -> u8 {
    (128.0 + 127.0 * angle.sin()).clamp(0.0, 255.0) as u8
}

fn subtitle_line(index: u32) -> String {
    let line = SUBTITLE_LINES[index.saturating_sub(1) as usize % SUBTITLE_LINES.len()];
    line.replace("{}", &index.to_string())
}

/// Black box plus white text, both confined to `rect`.
///
/// The band is drawn on a copy of the region and pasted back, so glyph
/// overhang never leaks outside the mask.
fn draw_subtitle(img: &mut RgbImage, font: &FontRef<'_>, text: &str, rect: Rect) {
    let (left, top) = (rect.left() as u32, rect.top() as u32);
    let mut band = imageops::crop_imm(img, left, top, rect.width(), rect.height()).to_image();

    let inner_width = rect.width().saturating_sub(2 * SUBTITLE_PADDING).max(1);
    let inner_height = rect.height().saturating_sub(2 * SUBTITLE_PADDING).max(1);
    let mut px = inner_height as f32;
    let (natural_width, _) = text_size(PxScale::from(px), font, text);
    if natural_width > inner_width {
        px *= inner_width as f32 / natural_width as f32;
    }
    let scale = PxScale::from(px.max(1.0));

    let (text_width, _) = text_size(scale, font, text);
    let box_width = (text_width + 2 * SUBTITLE_PADDING).min(rect.width());
    draw_filled_rect_mut(
        &mut band,
        Rect::at(0, 0).of_size(box_width, rect.height()),
        Rgb([0, 0, 0]),
    );

    let text_y = (rect.height() as f32 - scale.y) / 2.0;
    draw_text_mut(
        &mut band,
        Rgb([255, 255, 255]),
        SUBTITLE_PADDING as i32,
        text_y.max(0.0) as i32,
        scale,
        font,
        text,
    );

    imageops::replace(img, &band, i64::from(left), i64::from(top));
}
