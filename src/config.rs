use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DesubError, Result};
use crate::mask::Region;

fn default_crf() -> u32 {
    18
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub media: MediaConfig,
    pub capability: CapabilityConfig,
    pub storage: StorageConfig,
    pub masks: MaskConfig,
    pub pipeline: PipelineConfig,
    pub weights: WeightsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to ffprobe binary
    pub ffprobe_path: String,
    /// Working resolution frames are scaled to during extraction
    pub frame_width: u32,
    pub frame_height: u32,
    /// Constant rate factor used when reassembling (lower = better quality)
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Pixel format for broad playback compatibility
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Encoder used when none is given on the command line
    pub default_codec: String,
    /// Frame rate used for reassembly when the source rate is unknown
    pub default_fps: f64,
    /// Wall-clock limit per external invocation, in seconds
    pub tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Accelerator query tool (nvidia-smi compatible output)
    pub query_tool: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Region override; the SDK default chain is used when unset
    pub region: Option<String>,
    /// Custom endpoint (e.g. MinIO); enables path-style addressing
    pub endpoint: Option<String>,
    /// Skip the credential probe at construction time
    pub skip_validation: bool,
    /// Re-upload outputs that already exist remotely
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Region masked when generating masks for extracted frames
    pub subtitle_region: Region,
    /// Region used by the synthetic demo corpus
    pub demo_region: Region,
    pub demo_frame_count: u32,
    pub demo_frame_width: u32,
    pub demo_frame_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root under which each run gets its own directory
    pub work_dir: PathBuf,
    /// Inpainting stage (frames + masks -> inpainted frames)
    pub inpaint: Option<ExternalStageConfig>,
    /// Temporal refinement stage (frames + masks + inpainted -> refined frames)
    pub refine: Option<ExternalStageConfig>,
}

/// Command line of an opaque external stage.
///
/// Arguments may contain `{frames}`, `{masks}`, `{inpainted}`, `{output}`
/// and `{device}`, substituted at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStageConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the process
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub dir: PathBuf,
    pub files: Vec<WeightFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightFile {
    pub name: String,
    pub filename: String,
    pub url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            frame_width: 256,
            frame_height: 256,
            crf: default_crf(),
            pixel_format: default_pixel_format(),
            default_codec: "libx264".to_string(),
            default_fps: 30.0,
            tool_timeout_secs: None,
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            query_tool: "nvidia-smi".to_string(),
        }
    }
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            subtitle_region: Region::new(0, 205, 256, 256),
            demo_region: Region::new(30, 220, 230, 250),
            demo_frame_count: 10,
            demo_frame_width: 256,
            demo_frame_height: 256,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".desub").join("runs"),
            inpaint: None,
            refine: None,
        }
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".desub").join("weights"),
            files: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DesubError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| DesubError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DesubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DesubError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [media]
            ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"

            [pipeline.inpaint]
            program = "python"
            args = ["bin/predict.py", "indir={frames}", "maskdir={masks}", "outdir={output}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.media.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.media.ffprobe_path, "ffprobe");
        assert_eq!(config.media.crf, 18);
        assert_eq!(config.media.pixel_format, "yuv420p");
        assert_eq!(config.masks.subtitle_region, Region::new(0, 205, 256, 256));
        let inpaint = config.pipeline.inpaint.unwrap();
        assert_eq!(inpaint.program, "python");
        assert_eq!(inpaint.args.len(), 4);
        assert!(config.pipeline.refine.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desub.toml");

        let mut config = Config::default();
        config.storage.endpoint = Some("http://localhost:9000".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(loaded.media.frame_width, 256);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/nonexistent/desub.toml").unwrap_err();
        assert!(matches!(err, DesubError::Config(_)));
    }
}
