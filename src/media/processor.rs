use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{parse_probe_output, ExtractedFrames, MediaCommandBuilder, MediaProcessorTrait, VideoInfo};
use crate::config::MediaConfig;
use crate::error::{DesubError, Result};
use crate::frames::{FrameSet, FRAME_PREFIX};

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
}

impl MediaProcessorImpl {
    /// Create a new media processor implementation
    pub fn new(config: MediaConfig) -> Self {
        let command_builder = MediaCommandBuilder::new(
            &config.ffmpeg_path,
            &config.ffprobe_path,
            config.tool_timeout_secs.map(Duration::from_secs),
        );

        Self {
            config,
            command_builder,
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn extract_frames(
        &self,
        video_path: &Path,
        output_dir: &Path,
        target_fps: Option<f64>,
    ) -> Result<ExtractedFrames> {
        if !video_path.is_file() {
            return Err(DesubError::FileNotFound(video_path.to_path_buf()));
        }

        // Probing first keeps stream-less inputs from touching the output dir.
        let info = self.probe(video_path).await?;
        info!(
            "Extracting frames from {} ({}x{}, {:.3} fps, {:.1}s)",
            video_path.display(),
            info.width,
            info.height,
            info.fps.as_f64(),
            info.duration_seconds
        );

        fs::create_dir_all(output_dir).await?;

        let stale = FrameSet::scan(output_dir, FRAME_PREFIX)?;
        if !stale.is_empty() {
            warn!(
                "Removing {} frames left in {} by an earlier extraction",
                stale.len(),
                output_dir.display()
            );
            for (_, path) in stale.paths() {
                fs::remove_file(&path).await?;
            }
        }

        let command = self.command_builder.extract_frames(
            video_path,
            output_dir,
            (self.config.frame_width, self.config.frame_height),
            target_fps,
        );
        command.execute().await?;

        let frames = FrameSet::scan(output_dir, FRAME_PREFIX)?;
        if frames.is_empty() {
            return Err(DesubError::MissingOutput {
                description: command.description,
                path: output_dir.to_path_buf(),
            });
        }
        frames.validate()?;

        info!("Extracted {} frames to {}", frames.len(), output_dir.display());
        Ok(ExtractedFrames { source: info, frames })
    }

    async fn probe(&self, video_path: &Path) -> Result<VideoInfo> {
        debug!("Probing {}", video_path.display());

        let output = self.command_builder.probe(video_path).execute().await?;
        let info = parse_probe_output(video_path, &String::from_utf8_lossy(&output.stdout))?;

        debug!("Probe result for {}: {:?}", video_path.display(), info);
        Ok(info)
    }

    async fn assemble(
        &self,
        frames_dir: &Path,
        output_path: &Path,
        fps: f64,
        codec: &str,
    ) -> Result<()> {
        if !frames_dir.is_dir() {
            return Err(DesubError::FileNotFound(frames_dir.to_path_buf()));
        }
        if !(fps.is_finite() && fps > 0.0) {
            return Err(DesubError::Config(format!("Invalid frame rate: {}", fps)));
        }

        let frames = FrameSet::scan_valid(frames_dir, FRAME_PREFIX)?;
        let start_number = frames.first_index().unwrap_or(1);

        info!(
            "Creating video from {} frames at {} fps -> {}",
            frames.len(),
            fps,
            output_path.display()
        );

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let command = self.command_builder.assemble(
            frames_dir,
            start_number,
            output_path,
            fps,
            codec,
            &self.config.pixel_format,
            self.config.crf,
        );
        command.execute().await?;

        // A zero exit status is not proof of an output file.
        let size = match fs::metadata(output_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => {
                return Err(DesubError::MissingOutput {
                    description: command.description,
                    path: output_path.to_path_buf(),
                });
            }
        };

        info!(
            "Video created successfully ({:.1} MB)",
            size as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        self.command_builder.version_check().execute().await?;
        info!("Codec tool is available");
        Ok(())
    }

    async fn get_version_info(&self) -> Result<String> {
        debug!("Getting codec tool version information");

        let output = self.command_builder.version_check().execute().await?;
        let version_info = String::from_utf8_lossy(&output.stdout);
        // Extract the first line which typically contains the version
        let first_line = version_info.lines().next().unwrap_or("Unknown version");
        Ok(first_line.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Writes an executable shell script standing in for a codec tool.
    fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn processor(ffmpeg: &str, ffprobe: &str) -> MediaProcessorImpl {
        MediaProcessorImpl::new(MediaConfig {
            ffmpeg_path: ffmpeg.to_string(),
            ffprobe_path: ffprobe.to_string(),
            ..MediaConfig::default()
        })
    }

    fn source_video(dir: &Path) -> PathBuf {
        let path = dir.join("source.mp4");
        std::fs::write(&path, b"not really a video").unwrap();
        path
    }

    #[tokio::test]
    async fn test_extract_without_video_stream_creates_nothing() {
        let tools = tempfile::tempdir().unwrap();
        let ffprobe = fake_tool(
            tools.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"audio"}],"format":{"duration":"1.0"}}'"#,
        );
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", "exit 1");
        let work = tempfile::tempdir().unwrap();
        let output_dir = work.path().join("frames");

        let err = processor(&ffmpeg, &ffprobe)
            .extract_frames(&source_video(work.path()), &output_dir, None)
            .await
            .unwrap_err();

        assert!(matches!(err, DesubError::NoVideoStream(_)));
        assert!(!output_dir.exists());
    }

    #[tokio::test]
    async fn test_extract_with_empty_output_is_missing_output() {
        let tools = tempfile::tempdir().unwrap();
        let ffprobe = fake_tool(
            tools.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","width":64,"height":64,"r_frame_rate":"10/1"}],"format":{"duration":"1.0"}}'"#,
        );
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", "exit 0");
        let work = tempfile::tempdir().unwrap();

        let err = processor(&ffmpeg, &ffprobe)
            .extract_frames(&source_video(work.path()), &work.path().join("frames"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, DesubError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_extract_replaces_frames_of_earlier_run() {
        let tools = tempfile::tempdir().unwrap();
        let ffprobe = fake_tool(
            tools.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","width":64,"height":64,"r_frame_rate":"10/1"}],"format":{"duration":"0.2"}}'"#,
        );
        // The last argument is the output pattern; write two frames next to it.
        let ffmpeg = fake_tool(
            tools.path(),
            "ffmpeg",
            r#"for last; do :; done; dir=$(dirname "$last"); touch "$dir/frame_00001.png" "$dir/frame_00002.png""#,
        );
        let work = tempfile::tempdir().unwrap();
        let output_dir = work.path().join("frames");
        std::fs::create_dir_all(&output_dir).unwrap();
        for index in 1..=5 {
            std::fs::write(output_dir.join(format!("frame_{:05}.png", index)), b"old").unwrap();
        }
        std::fs::write(output_dir.join("notes.txt"), b"keep").unwrap();

        let extracted = processor(&ffmpeg, &ffprobe)
            .extract_frames(&source_video(work.path()), &output_dir, None)
            .await
            .unwrap();

        assert_eq!(extracted.frames.indices(), &[1, 2]);
        assert_eq!(extracted.source.width, 64);
        assert!(!output_dir.join("frame_00003.png").exists());
        assert!(!output_dir.join("frame_00005.png").exists());
        assert!(output_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_assemble_empty_dir_does_not_invoke_tool() {
        let work = tempfile::tempdir().unwrap();
        let frames_dir = work.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();

        // Were the tool invoked, this would surface as ToolNotFound.
        let err = processor("/nonexistent/ffmpeg", "/nonexistent/ffprobe")
            .assemble(&frames_dir, &work.path().join("out.mp4"), 10.0, "libx264")
            .await
            .unwrap_err();

        assert!(matches!(err, DesubError::InvalidFrameSet { .. }));
    }

    #[tokio::test]
    async fn test_assemble_zero_exit_without_file_is_failure() {
        let tools = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", "exit 0");
        let work = tempfile::tempdir().unwrap();
        let frames_dir = work.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        std::fs::write(frames_dir.join("frame_00001.png"), b"png").unwrap();

        let err = processor(&ffmpeg, "ffprobe")
            .assemble(&frames_dir, &work.path().join("out.mp4"), 10.0, "libx264")
            .await
            .unwrap_err();

        assert!(matches!(err, DesubError::MissingOutput { .. }));
    }

    #[tokio::test]
    async fn test_assemble_reports_tool_stderr() {
        let tools = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", "echo 'Unknown encoder' >&2; exit 1");
        let work = tempfile::tempdir().unwrap();
        let frames_dir = work.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        std::fs::write(frames_dir.join("frame_00001.png"), b"png").unwrap();

        let err = processor(&ffmpeg, "ffprobe")
            .assemble(&frames_dir, &work.path().join("out.mp4"), 10.0, "nope264")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Unknown encoder"));
    }
}
