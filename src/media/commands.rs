use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DesubError, Result};
use crate::frames;

/// External process invocation: program, arguments, environment, description.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub description: String,
    pub timeout: Option<Duration>,
}

impl ToolCommand {
    /// Create a new tool command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            description: description.into(),
            timeout: None,
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add environment variables for the child process
    pub fn envs<I>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.envs.extend(envs);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    pub fn pixel_format<S: Into<String>>(self, format: S) -> Self {
        self.arg("-pix_fmt").arg(format)
    }

    /// Execute the command and return its captured output.
    ///
    /// Spawn failures are `ToolNotFound`; a nonzero exit or an elapsed
    /// timeout are both `ToolFailed`.
    pub async fn execute(&self) -> Result<Output> {
        debug!("Executing {}: {} {:?}", self.description, self.binary_path, self.args);

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args).envs(self.envs.iter().cloned()).kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DesubError::ToolFailed {
                        description: self.description.clone(),
                        detail: format!("timed out after {}s", limit.as_secs()),
                    });
                }
            },
            None => cmd.output().await,
        }
        .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DesubError::ToolFailed {
                description: self.description.clone(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(output)
    }

    fn spawn_error(&self, e: std::io::Error) -> DesubError {
        if e.kind() == IoErrorKind::NotFound {
            DesubError::ToolNotFound {
                tool: self.binary_path.clone(),
                reason: e.to_string(),
            }
        } else {
            DesubError::ToolFailed {
                description: self.description.clone(),
                detail: format!("could not run {}: {}", self.binary_path, e),
            }
        }
    }
}

/// Builder for the codec tool invocations the adapter needs
pub struct MediaCommandBuilder {
    ffmpeg_path: String,
    ffprobe_path: String,
    timeout: Option<Duration>,
}

impl MediaCommandBuilder {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        ffmpeg_path: S1,
        ffprobe_path: S2,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    /// Build frame extraction command: scaled, optionally resampled, numbered PNGs
    pub fn extract_frames<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        video_path: P,
        output_dir: Q,
        (width, height): (u32, u32),
        target_fps: Option<f64>,
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.ffmpeg_path, "Frame extraction")
            .timeout(self.timeout)
            .overwrite()
            .input(video_path)
            .video_filter(format!("scale={}:{}", width, height))
            .arg("-q:v")
            .arg("2");

        if let Some(fps) = target_fps {
            cmd = cmd.arg("-r").arg(fps.to_string());
        }

        cmd.output(output_dir.as_ref().join(frames::sequence_pattern(frames::FRAME_PREFIX)))
    }

    /// Build reassembly command from a numbered frame sequence
    pub fn assemble<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        frames_dir: P,
        start_number: u32,
        output_path: Q,
        fps: f64,
        codec: &str,
        pixel_format: &str,
        crf: u32,
    ) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg_path, "Video assembly")
            .timeout(self.timeout)
            .overwrite()
            .arg("-framerate")
            .arg(fps.to_string())
            .arg("-start_number")
            .arg(start_number.to_string())
            .input(frames_dir.as_ref().join(frames::sequence_pattern(frames::FRAME_PREFIX)))
            .video_codec(codec)
            .pixel_format(pixel_format)
            .arg("-crf")
            .arg(crf.to_string())
            .output(output_path)
    }

    /// Build metadata probe command (JSON on stdout)
    pub fn probe<P: AsRef<Path>>(&self, video_path: P) -> ToolCommand {
        ToolCommand::new(&self.ffprobe_path, "Video probe")
            .timeout(self.timeout)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .output(video_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg_path, "Version check")
            .timeout(self.timeout)
            .arg("-version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> MediaCommandBuilder {
        MediaCommandBuilder::new("ffmpeg", "ffprobe", None)
    }

    #[test]
    fn test_extract_frames_arguments() {
        let cmd = builder().extract_frames("in.mp4", "/tmp/frames", (256, 256), None);
        assert_eq!(
            cmd.args,
            vec!["-y", "-i", "in.mp4", "-vf", "scale=256:256", "-q:v", "2", "/tmp/frames/frame_%05d.png"]
        );

        let resampled = builder().extract_frames("in.mp4", "/tmp/frames", (256, 256), Some(10.0));
        let r = resampled.args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(resampled.args[r + 1], "10");
        assert!(resampled.args.last().unwrap().ends_with("frame_%05d.png"));
    }

    #[test]
    fn test_assemble_arguments() {
        let cmd = builder().assemble("/tmp/frames", 1, "out.mp4", 29.97, "libx264", "yuv420p", 18);
        assert_eq!(
            cmd.args,
            vec![
                "-y", "-framerate", "29.97", "-start_number", "1", "-i", "/tmp/frames/frame_%05d.png",
                "-c:v", "libx264", "-pix_fmt", "yuv420p", "-crf", "18", "out.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_not_found() {
        let err = ToolCommand::new("/nonexistent/desub-tool", "Probe")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, DesubError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failed() {
        let err = ToolCommand::new("false", "Always fails").execute().await.unwrap_err();
        match err {
            DesubError::ToolFailed { description, .. } => assert_eq!(description, "Always fails"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_classified_as_tool_failed() {
        let err = ToolCommand::new("sleep", "Slow tool")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, DesubError::ToolFailed { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_environment_is_passed_to_child() {
        let output = ToolCommand::new("sh", "Print env")
            .args(["-c", "printf %s \"$PIPELINE_DEVICE\""])
            .envs(vec![("PIPELINE_DEVICE".to_string(), "cpu".to_string())])
            .execute()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "cpu");
    }
}
