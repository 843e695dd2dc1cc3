//! Numbered image sequences on disk.
//!
//! Frames are stored as `frame_NNNNN.png`, masks as `mask_NNNNN.png`. The
//! index is what ties a mask (or an inpainted frame) to its source frame.

use std::path::{Path, PathBuf};

use crate::error::{DesubError, Result};

pub const FRAME_PREFIX: &str = "frame_";
pub const MASK_PREFIX: &str = "mask_";
pub const INDEX_WIDTH: usize = 5;
pub const IMAGE_EXTENSION: &str = "png";

/// File name of the image with the given index, e.g. `frame_00001.png`.
pub fn file_name(prefix: &str, index: u32) -> String {
    format!(
        "{}{:0width$}.{}",
        prefix,
        index,
        IMAGE_EXTENSION,
        width = INDEX_WIDTH
    )
}

/// printf-style pattern understood by the codec tool, e.g. `frame_%05d.png`.
pub fn sequence_pattern(prefix: &str) -> String {
    format!("{}%0{}d.{}", prefix, INDEX_WIDTH, IMAGE_EXTENSION)
}

/// Index of a `<prefix><digits>.png` name.
///
/// Digits are zero-padded to at least `INDEX_WIDTH`; past 99999 the codec
/// tool widens the field, so longer names are accepted without padding.
fn parse_index(prefix: &str, name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(prefix)?
        .strip_suffix(IMAGE_EXTENSION)?
        .strip_suffix('.')?;

    if digits.len() < INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > INDEX_WIDTH && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet {
    dir: PathBuf,
    prefix: String,
    indices: Vec<u32>,
}

impl FrameSet {
    /// Lists correctly named images in `dir`. Other files are ignored.
    pub fn scan<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let mut indices = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(index) = entry.file_name().to_str().and_then(|n| parse_index(prefix, n)) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            indices,
        })
    }

    /// Scans and requires a non-empty, gap-free sequence starting at 0 or 1.
    pub fn scan_valid<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let set = Self::scan(dir, prefix)?;
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| DesubError::InvalidFrameSet {
            dir: self.dir.clone(),
            reason,
        };

        let first = match self.indices.first() {
            Some(first) => *first,
            None => {
                return Err(invalid(format!(
                    "no files matching {}",
                    sequence_pattern(&self.prefix)
                )));
            }
        };
        if first > 1 {
            return Err(invalid(format!("sequence starts at {}", first)));
        }
        if let Some(gap) = self
            .indices
            .windows(2)
            .find(|pair| pair[1] != pair[0] + 1)
        {
            return Err(invalid(format!(
                "gap between index {} and {}",
                gap[0], gap[1]
            )));
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn first_index(&self) -> Option<u32> {
        self.indices.first().copied()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn path(&self, index: u32) -> PathBuf {
        self.dir.join(file_name(&self.prefix, index))
    }

    pub fn paths(&self) -> impl Iterator<Item = (u32, PathBuf)> + '_ {
        self.indices.iter().map(|&index| (index, self.path(index)))
    }
}
