// Media I/O around the external codec tool
//
// - Commands: argument construction and process execution
// - Probe: metadata parsing
// - Processor: the ffmpeg/ffprobe backed implementation

pub mod commands;
pub mod probe;
pub mod processor;

use async_trait::async_trait;
use std::path::Path;

pub use commands::*;
pub use probe::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;
use crate::frames::FrameSet;

/// Frames written by one extraction, with the probe of their source.
#[derive(Debug, Clone)]
pub struct ExtractedFrames {
    pub source: VideoInfo,
    pub frames: FrameSet,
}

/// Main trait for media operations
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// Extract scaled, numbered frames from a video
    ///
    /// Frame files already in `output_dir` are replaced, never counted.
    async fn extract_frames(
        &self,
        video_path: &Path,
        output_dir: &Path,
        target_fps: Option<f64>,
    ) -> Result<ExtractedFrames>;

    /// Read dimensions, frame rate and duration of a video
    async fn probe(&self, video_path: &Path) -> Result<VideoInfo>;

    /// Encode the numbered frames in `frames_dir` into one video
    async fn assemble(
        &self,
        frames_dir: &Path,
        output_path: &Path,
        fps: f64,
        codec: &str,
    ) -> Result<()>;

    /// Check if the codec tool is available
    async fn check_availability(&self) -> Result<()>;

    /// Get codec tool version information
    async fn get_version_info(&self) -> Result<String>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Box<dyn MediaProcessorTrait> {
        Box::new(processor::MediaProcessorImpl::new(config))
    }
}
