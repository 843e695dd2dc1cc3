//! Invocation of the external inpainting and refinement stages.
//!
//! The stages are opaque programs. They read a frames directory and a masks
//! directory (refinement also reads the inpainted directory) and must write
//! one `frame_NNNNN.png` per input frame into their output directory.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::capability::ExecutionProfile;
use crate::config::ExternalStageConfig;
use crate::error::{DesubError, Result};
use crate::frames::{FrameSet, FRAME_PREFIX};
use crate::media::ToolCommand;

/// Directories a stage works on.
#[derive(Debug, Clone)]
pub struct StageDirs {
    pub frames: PathBuf,
    pub masks: PathBuf,
    pub inpainted: Option<PathBuf>,
    pub output: PathBuf,
}

pub struct ExternalStage {
    name: String,
    config: ExternalStageConfig,
    timeout: Option<Duration>,
}

impl ExternalStage {
    pub fn new<S: Into<String>>(name: S, config: ExternalStageConfig, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            config,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds the command line with placeholders substituted and the
    /// profile's environment attached.
    pub fn command(&self, dirs: &StageDirs, profile: &ExecutionProfile) -> Result<ToolCommand> {
        let args = self
            .config
            .args
            .iter()
            .map(|arg| self.substitute(arg, dirs, profile))
            .collect::<Result<Vec<_>>>()?;

        let mut command = ToolCommand::new(&self.config.program, format!("{} stage", self.name))
            .args(args)
            .envs(profile.env_vars())
            .timeout(self.timeout);
        if let Some(dir) = &self.config.current_dir {
            command = command.current_dir(dir);
        }
        Ok(command)
    }

    fn substitute(&self, arg: &str, dirs: &StageDirs, profile: &ExecutionProfile) -> Result<String> {
        let display = |p: &Path| p.to_string_lossy().into_owned();

        let mut value = arg
            .replace("{frames}", &display(&dirs.frames))
            .replace("{masks}", &display(&dirs.masks))
            .replace("{output}", &display(&dirs.output))
            .replace("{device}", profile.device.as_str());

        if value.contains("{inpainted}") {
            let inpainted = dirs.inpainted.as_deref().ok_or_else(|| {
                DesubError::Config(format!(
                    "{} stage argument '{}' needs an inpainted directory",
                    self.name, arg
                ))
            })?;
            value = value.replace("{inpainted}", &display(inpainted));
        }
        Ok(value)
    }

    /// Runs the stage and checks it produced a frame for every input frame.
    pub async fn run(
        &self,
        dirs: &StageDirs,
        profile: &ExecutionProfile,
        input: &FrameSet,
    ) -> Result<FrameSet> {
        tokio::fs::create_dir_all(&dirs.output).await?;

        info!(
            "Running {} stage on {} frames ({}) -> {}",
            self.name,
            input.len(),
            profile.device,
            dirs.output.display()
        );
        let command = self.command(dirs, profile)?;
        command.execute().await?;

        let output = FrameSet::scan(&dirs.output, FRAME_PREFIX)?;
        if output.is_empty() {
            return Err(DesubError::MissingOutput {
                description: command.description,
                path: dirs.output.clone(),
            });
        }
        if output.indices() != input.indices() {
            return Err(DesubError::ToolFailed {
                description: command.description,
                detail: format!(
                    "expected {} frames matching the input numbering, found {}",
                    input.len(),
                    output.len()
                ),
            });
        }

        info!("{} stage produced {} frames", self.name, output.len());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dirs(root: &Path) -> StageDirs {
        StageDirs {
            frames: root.join("frames"),
            masks: root.join("masks"),
            inpainted: None,
            output: root.join("inpainted"),
        }
    }

    fn write_frames(dir: &Path, count: u32) -> FrameSet {
        fs::create_dir_all(dir).unwrap();
        for index in 1..=count {
            fs::write(dir.join(crate::frames::file_name(FRAME_PREFIX, index)), b"png").unwrap();
        }
        FrameSet::scan_valid(dir, FRAME_PREFIX).unwrap()
    }

    #[test]
    fn test_placeholders_and_environment() {
        let stage = ExternalStage::new(
            "inpaint",
            ExternalStageConfig {
                program: "python".to_string(),
                args: vec![
                    "bin/predict.py".to_string(),
                    "indir={frames}".to_string(),
                    "maskdir={masks}".to_string(),
                    "outdir={output}".to_string(),
                    "--device={device}".to_string(),
                ],
                current_dir: Some(PathBuf::from("/opt/lama")),
            },
            None,
        );
        let command = stage
            .command(&dirs(Path::new("/work")), &ExecutionProfile::accelerated(1))
            .unwrap();

        assert_eq!(command.binary_path, "python");
        assert_eq!(
            command.args,
            vec![
                "bin/predict.py",
                "indir=/work/frames",
                "maskdir=/work/masks",
                "outdir=/work/inpainted",
                "--device=cuda"
            ]
        );
        assert_eq!(command.current_dir.as_deref(), Some(Path::new("/opt/lama")));
        assert!(command.envs.contains(&("PIPELINE_DEVICE".to_string(), "cuda".to_string())));
    }

    #[test]
    fn test_inpainted_placeholder_requires_directory() {
        let stage = ExternalStage::new(
            "refine",
            ExternalStageConfig {
                program: "python".to_string(),
                args: vec!["--inpainted_root".to_string(), "{inpainted}".to_string()],
                current_dir: None,
            },
            None,
        );
        let err = stage
            .command(&dirs(Path::new("/work")), &ExecutionProfile::cpu())
            .unwrap_err();
        assert!(matches!(err, DesubError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_checks_output_numbering() {
        let root = tempfile::tempdir().unwrap();
        let dirs = dirs(root.path());
        let input = write_frames(&dirs.frames, 3);
        fs::create_dir_all(&dirs.masks).unwrap();

        let copy_all = ExternalStage::new(
            "inpaint",
            ExternalStageConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "cp {frames}/*.png {output}/".to_string()],
                current_dir: None,
            },
            None,
        );
        let output = copy_all.run(&dirs, &ExecutionProfile::cpu(), &input).await.unwrap();
        assert_eq!(output.indices(), input.indices());

        let short = ExternalStage::new(
            "inpaint",
            ExternalStageConfig {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "rm -f {output}/*.png; cp {frames}/frame_00001.png {output}/".to_string(),
                ],
                current_dir: None,
            },
            None,
        );
        let err = short.run(&dirs, &ExecutionProfile::cpu(), &input).await.unwrap_err();
        assert!(matches!(err, DesubError::ToolFailed { .. }));
    }

    #[tokio::test]
    async fn test_run_with_no_output_is_missing_output() {
        let root = tempfile::tempdir().unwrap();
        let dirs = dirs(root.path());
        let input = write_frames(&dirs.frames, 2);

        let noop = ExternalStage::new(
            "refine",
            ExternalStageConfig {
                program: "true".to_string(),
                args: Vec::new(),
                current_dir: None,
            },
            None,
        );
        let err = noop.run(&dirs, &ExecutionProfile::cpu(), &input).await.unwrap_err();
        assert!(matches!(err, DesubError::MissingOutput { .. }));
    }
}
