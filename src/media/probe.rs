use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DesubError, Result};

/// Frame rate as reported by the container, e.g. `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for FrameRate {
    type Err = DesubError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| DesubError::Config(format!("Invalid frame rate '{}': {}", s, reason));

        let (num, den) = match s.trim().split_once('/') {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (s.trim(), "1"),
        };
        let num = num.parse::<u32>().map_err(|_| invalid("bad numerator"))?;
        let den = den.parse::<u32>().map_err(|_| invalid("bad denominator"))?;
        if den == 0 {
            return Err(invalid("zero denominator"));
        }
        Ok(FrameRate { num, den })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: FrameRate,
    pub duration_seconds: f64,
    /// Declared by the container; not every format carries it
    pub frame_count: Option<u64>,
}

// ffprobe -print_format json output, reduced to the fields used here
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parses probe JSON into [`VideoInfo`] using the first video stream.
pub fn parse_probe_output(video_path: &Path, json: &str) -> Result<VideoInfo> {
    let output: ProbeOutput = serde_json::from_str(json)?;

    let stream = output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| DesubError::NoVideoStream(video_path.to_path_buf()))?;

    let missing = |field: &str| DesubError::ToolFailed {
        description: "Video probe".to_string(),
        detail: format!("{} missing from probe output for {}", field, video_path.display()),
    };

    let width = stream.width.ok_or_else(|| missing("width"))?;
    let height = stream.height.ok_or_else(|| missing("height"))?;
    // Some streams report 0/0 as the real base rate; the average rate still holds.
    let fps = [stream.r_frame_rate.as_deref(), stream.avg_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(|rate| rate.parse::<FrameRate>().ok())
        .find(|rate| rate.num > 0)
        .ok_or_else(|| missing("frame rate"))?;

    let duration_seconds = output
        .format
        .and_then(|f| f.duration)
        .or(stream.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| missing("duration"))?;

    let frame_count = stream.nb_frames.and_then(|n| n.parse::<u64>().ok());

    Ok(VideoInfo {
        width,
        height,
        fps,
        duration_seconds,
        frame_count,
    })
}
