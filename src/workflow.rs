//! Pipeline orchestration
//!
//! A run moves strictly forward through [`PipelineState`]: capability,
//! input staging, frame extraction, masks, the external inpaint and refine
//! stages, reassembly and output staging. The first failure halts the run
//! with the failing stage named; nothing produced so far is removed.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capability::ExecutionProfile;
use crate::config::{Config, ExternalStageConfig};
use crate::error::{DesubError, ErrorKind, Result};
use crate::frames::{FrameSet, MASK_PREFIX};
use crate::inference::{ExternalStage, StageDirs};
use crate::mask::{self, Region};
use crate::media::{ExtractedFrames, MediaProcessorFactory, MediaProcessorTrait, VideoInfo};
use crate::setup::SetupManager;
use crate::storage::{RemoteLocator, StagingClient, TreeTransferReport};

/// A local path or a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote(RemoteLocator),
}

impl Location {
    /// Anything using the remote scheme must be a well-formed locator.
    pub fn parse(value: &str) -> Result<Self> {
        if RemoteLocator::is_remote(value) {
            Ok(Location::Remote(RemoteLocator::parse(value)?))
        } else {
            Ok(Location::Local(PathBuf::from(value)))
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote(locator) => write!(f, "{}", locator),
        }
    }
}

impl FromStr for Location {
    type Err = DesubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Where the masks for a run come from.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskSource {
    /// Synthesize one mask per extracted frame covering this region
    Region(Region),
    /// A prepared `mask_NNNNN.png` directory, local or remote
    Directory(Location),
}

#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub input: Location,
    pub output: Location,
    pub masks: MaskSource,
    /// Resample to this rate during extraction
    pub target_fps: Option<f64>,
    /// Output rate; defaults to the target rate, then the probed rate
    pub fps: Option<f64>,
    pub codec: Option<String>,
    /// Push the whole run directory here once the output is staged
    pub artifacts: Option<RemoteLocator>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    CapabilityDetected,
    InputStaged,
    FramesExtracted,
    MasksReady,
    Inpainted,
    Refined,
    Reassembled,
    OutputStaged,
    Done,
    Failed {
        stage: String,
        kind: ErrorKind,
        cause: String,
    },
}

impl PipelineState {
    /// Name of the stage whose success leads to this state.
    pub fn stage_name(&self) -> &str {
        match self {
            PipelineState::Init => "init",
            PipelineState::CapabilityDetected => "capability detection",
            PipelineState::InputStaged => "input staging",
            PipelineState::FramesExtracted => "frame extraction",
            PipelineState::MasksReady => "mask preparation",
            PipelineState::Inpainted => "inpainting",
            PipelineState::Refined => "refinement",
            PipelineState::Reassembled => "reassembly",
            PipelineState::OutputStaged => "output staging",
            PipelineState::Done => "done",
            PipelineState::Failed { stage, .. } => stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub work_dir: PathBuf,
    pub profile: ExecutionProfile,
    pub states: Vec<PipelineState>,
    pub source: Option<VideoInfo>,
    pub frame_count: usize,
    pub output: Option<String>,
    pub output_upload_skipped: bool,
    pub skipped_stages: Vec<String>,
    pub artifacts: Option<TreeTransferReport>,
}

impl PipelineReport {
    fn new(work_root: &Path, profile: &ExecutionProfile) -> Self {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        let mut short_id = run_id.simple().to_string();
        short_id.truncate(8);
        let work_dir = work_root.join(format!("{}-{}", started_at.format("%Y%m%d-%H%M%S"), short_id));

        Self {
            run_id,
            started_at,
            work_dir,
            profile: profile.clone(),
            states: vec![PipelineState::Init],
            source: None,
            frame_count: 0,
            output: None,
            output_upload_skipped: false,
            skipped_stages: Vec::new(),
            artifacts: None,
        }
    }

    pub fn state(&self) -> Option<&PipelineState> {
        self.states.last()
    }

    fn advance(&mut self, state: PipelineState) {
        info!("Pipeline {} -> {}", self.run_id, state.stage_name());
        self.states.push(state);
    }

    fn fail(&mut self, err: &DesubError) {
        let (stage, cause) = match err {
            DesubError::StageFailed { stage, source } => (stage.clone(), source.to_string()),
            other => ("unknown".to_string(), other.to_string()),
        };
        let kind = err.kind();
        error!(
            "Pipeline {} failed during {} ({} error): {}",
            self.run_id, stage, kind, cause
        );
        self.states.push(PipelineState::Failed { stage, kind, cause });
    }
}

/// Per-run directory layout.
struct RunLayout {
    input: PathBuf,
    frames: PathBuf,
    masks: PathBuf,
    inpainted: PathBuf,
    refined: PathBuf,
    output: PathBuf,
}

impl RunLayout {
    fn new(root: &Path) -> Self {
        Self {
            input: root.join("input"),
            frames: root.join("frames"),
            masks: root.join("masks"),
            inpainted: root.join("inpainted"),
            refined: root.join("refined"),
            output: root.join("output"),
        }
    }
}

/// Last path segment of a key, for naming the local copy.
fn key_file_name(locator: &RemoteLocator, fallback: &str) -> String {
    locator
        .key
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn at<T>(outcome: Result<T>, next: &PipelineState) -> Result<T> {
    outcome.map_err(|e| e.at_stage(next.stage_name()))
}

pub struct Pipeline {
    config: Config,
    profile: ExecutionProfile,
    media: Box<dyn MediaProcessorTrait>,
    storage: StagingClient,
}

impl Pipeline {
    pub fn new(config: Config, profile: ExecutionProfile, storage: StagingClient) -> Self {
        let media = MediaProcessorFactory::create_processor(config.media.clone());
        Self::with_media(config, profile, storage, media)
    }

    pub fn with_media(
        config: Config,
        profile: ExecutionProfile,
        storage: StagingClient,
        media: Box<dyn MediaProcessorTrait>,
    ) -> Self {
        Self {
            config,
            profile,
            media,
            storage,
        }
    }

    pub fn profile(&self) -> &ExecutionProfile {
        &self.profile
    }

    /// Runs one job to completion or to its first failing stage.
    ///
    /// The report is written to `report.json` in the run directory either
    /// way. On failure the returned error is a `StageFailed`.
    pub async fn run(&self, job: &PipelineJob) -> Result<PipelineReport> {
        let mut report = PipelineReport::new(&self.config.pipeline.work_dir, &self.profile);
        info!(
            "Starting pipeline run {} for {} -> {} in {}",
            report.run_id,
            job.input,
            job.output,
            report.work_dir.display()
        );

        let outcome = match fs::create_dir_all(&report.work_dir).await {
            Ok(()) => self.execute(job, &mut report).await,
            Err(e) => Err(DesubError::from(e).at_stage("init")),
        };

        if let Err(e) = &outcome {
            report.fail(e);
        }
        if let Err(e) = self.write_report(&report).await {
            warn!("Could not write run report: {}", e);
        }

        outcome.map(|()| report)
    }

    async fn write_report(&self, report: &PipelineReport) -> Result<()> {
        let path = report.work_dir.join("report.json");
        fs::write(&path, serde_json::to_string_pretty(report)?).await?;
        Ok(())
    }

    async fn execute(&self, job: &PipelineJob, report: &mut PipelineReport) -> Result<()> {
        let layout = RunLayout::new(&report.work_dir);

        // The profile was detected before the pipeline was built.
        self.fetch_weights().await;
        report.advance(PipelineState::CapabilityDetected);

        let next = PipelineState::InputStaged;
        let source = at(self.stage_input(&job.input, &layout).await, &next)?;
        report.advance(next);

        let next = PipelineState::FramesExtracted;
        let ExtractedFrames { source: info, frames } = at(
            self.media
                .extract_frames(&source, &layout.frames, job.target_fps)
                .await,
            &next,
        )?;
        report.frame_count = frames.len();
        report.source = Some(info.clone());
        report.advance(next);

        let next = PipelineState::MasksReady;
        at(self.prepare_masks(&job.masks, &frames, &layout).await, &next)?;
        report.advance(next);

        let next = PipelineState::Inpainted;
        let inpaint_dirs = StageDirs {
            frames: layout.frames.clone(),
            masks: layout.masks.clone(),
            inpainted: None,
            output: layout.inpainted.clone(),
        };
        let current = at(
            self.run_external("inpaint", self.config.pipeline.inpaint.as_ref(), &inpaint_dirs, &frames, report)
                .await,
            &next,
        )?;
        report.advance(next);

        let next = PipelineState::Refined;
        let refine_dirs = StageDirs {
            frames: layout.frames.clone(),
            masks: layout.masks.clone(),
            inpainted: Some(current.dir().to_path_buf()),
            output: layout.refined.clone(),
        };
        let current = at(
            self.run_external("refine", self.config.pipeline.refine.as_ref(), &refine_dirs, &current, report)
                .await,
            &next,
        )?;
        report.advance(next);

        let next = PipelineState::Reassembled;
        let fps = job
            .fps
            .or(job.target_fps)
            .unwrap_or_else(|| self.source_fps(&info));
        let codec = job
            .codec
            .clone()
            .unwrap_or_else(|| self.config.media.default_codec.clone());
        let local_output = match &job.output {
            Location::Local(path) => path.clone(),
            Location::Remote(locator) => layout.output.join(key_file_name(locator, "output.mp4")),
        };
        at(
            self.media
                .assemble(current.dir(), &local_output, fps, &codec)
                .await,
            &next,
        )?;
        report.advance(next);

        let next = PipelineState::OutputStaged;
        report.output_upload_skipped = at(self.stage_output(&local_output, &job.output).await, &next)?;
        report.output = Some(job.output.to_string());
        report.advance(next);

        if let Some(base) = &job.artifacts {
            report.artifacts = self.push_artifacts(&report.work_dir, base, report.run_id).await;
        }

        report.advance(PipelineState::Done);
        info!(
            "Pipeline run {} finished: {} frames -> {}",
            report.run_id, report.frame_count, job.output
        );
        Ok(())
    }

    /// Weight fetching never blocks the run; a stage needing missing weights
    /// fails on its own.
    async fn fetch_weights(&self) {
        if self.config.weights.files.is_empty() {
            return;
        }
        let fetched = match SetupManager::new(&self.config) {
            Ok(setup) => setup.ensure_weights(&self.profile).await,
            Err(e) => Err(e),
        };
        match fetched {
            Ok(count) if count > 0 => info!("Fetched {} weight files", count),
            Ok(_) => {}
            Err(e) => warn!("Weight fetching failed: {}", e),
        }
    }

    async fn stage_input(&self, input: &Location, layout: &RunLayout) -> Result<PathBuf> {
        match input {
            Location::Local(path) => {
                if !path.is_file() {
                    return Err(DesubError::FileNotFound(path.clone()));
                }
                info!("Using local input {}", path.display());
                Ok(path.clone())
            }
            Location::Remote(locator) => {
                let local = layout.input.join(key_file_name(locator, "input.mp4"));
                self.storage.download(locator, &local).await?;
                Ok(local)
            }
        }
    }

    async fn prepare_masks(
        &self,
        source: &MaskSource,
        frames: &FrameSet,
        layout: &RunLayout,
    ) -> Result<FrameSet> {
        let masks = match source {
            MaskSource::Region(region) => {
                let frames_dir = frames.dir().to_path_buf();
                let masks_dir = layout.masks.clone();
                let region = *region;
                tokio::task::spawn_blocking(move || {
                    mask::generate_masks(frames_dir, masks_dir, region)
                })
                .await
                .map_err(|e| DesubError::Io(std::io::Error::other(e)))??
            }
            MaskSource::Directory(Location::Local(dir)) => {
                fs::create_dir_all(&layout.masks).await?;
                for (index, path) in FrameSet::scan_valid(dir, MASK_PREFIX)?.paths() {
                    fs::copy(&path, layout.masks.join(crate::frames::file_name(MASK_PREFIX, index))).await?;
                }
                FrameSet::scan_valid(&layout.masks, MASK_PREFIX)?
            }
            MaskSource::Directory(Location::Remote(base)) => {
                self.storage.download_tree(base, &layout.masks).await?;
                FrameSet::scan_valid(&layout.masks, MASK_PREFIX)?
            }
        };

        if masks.indices() != frames.indices() {
            return Err(DesubError::InvalidFrameSet {
                dir: masks.dir().to_path_buf(),
                reason: format!(
                    "{} masks do not pair with {} frames index for index",
                    masks.len(),
                    frames.len()
                ),
            });
        }
        Ok(masks)
    }

    async fn run_external(
        &self,
        name: &str,
        stage_config: Option<&ExternalStageConfig>,
        dirs: &StageDirs,
        input: &FrameSet,
        report: &mut PipelineReport,
    ) -> Result<FrameSet> {
        let Some(stage_config) = stage_config else {
            info!("{} stage not configured, carrying {} forward", name, input.dir().display());
            report.skipped_stages.push(name.to_string());
            return Ok(input.clone());
        };

        let timeout = self.config.media.tool_timeout_secs.map(Duration::from_secs);
        ExternalStage::new(name, stage_config.clone(), timeout)
            .run(dirs, &self.profile, input)
            .await
    }

    fn source_fps(&self, info: &VideoInfo) -> f64 {
        let fps = info.fps.as_f64();
        if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            warn!(
                "Probed frame rate {} unusable, falling back to {}",
                info.fps, self.config.media.default_fps
            );
            self.config.media.default_fps
        }
    }

    /// Returns true when the upload was skipped because the object exists.
    async fn stage_output(&self, local: &Path, output: &Location) -> Result<bool> {
        let Location::Remote(locator) = output else {
            return Ok(false);
        };
        if !self.config.storage.overwrite && self.storage.exists(locator).await {
            info!("{} already exists, skipping upload", locator);
            return Ok(true);
        }
        self.storage.upload(local, locator).await?;
        Ok(false)
    }

    /// Best effort; a failed push is logged and the run still succeeds.
    async fn push_artifacts(
        &self,
        work_dir: &Path,
        base: &RemoteLocator,
        run_id: Uuid,
    ) -> Option<TreeTransferReport> {
        let target = base.join(&run_id.to_string());
        match self.storage.upload_tree(work_dir, &target).await {
            Ok(tree) => {
                if !tree.failures.is_empty() {
                    warn!(
                        "{} of {} artifacts failed to upload to {}",
                        tree.failures.len(),
                        tree.attempted,
                        target
                    );
                }
                Some(tree)
            }
            Err(e) => {
                warn!("Artifact push to {} failed: {}", target, e);
                None
            }
        }
    }
}
