use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::mask::Region;
use crate::storage::RemoteLocator;
use crate::workflow::Location;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect accelerators and print the execution profile as shell exports
    ///
    /// Exits 0 when an accelerator is available and 1 in CPU-only mode.
    Detect {
        /// Print the profile as JSON instead
        #[arg(long)]
        json: bool,
    },

    /// Print width, height, frame rate and duration of a video
    Probe {
        /// Input video file
        input: PathBuf,
    },

    /// Extract numbered frames at the working resolution
    Extract {
        /// Input video file
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for frame_NNNNN.png files
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Resample to this frame rate
        #[arg(long)]
        fps: Option<f64>,
    },

    /// Encode a directory of numbered frames into a video
    Assemble {
        /// Directory containing frame_NNNNN.png files
        #[arg(short, long)]
        frames_dir: PathBuf,

        /// Output video file
        #[arg(short, long)]
        output: PathBuf,

        /// Output frame rate (defaults to the configured rate)
        #[arg(long)]
        fps: Option<f64>,

        /// Video codec (defaults to the configured codec)
        #[arg(long)]
        codec: Option<String>,
    },

    /// Write one subtitle mask per frame
    Masks {
        /// Directory containing frame_NNNNN.png files
        #[arg(short, long)]
        frames_dir: PathBuf,

        /// Directory for mask_NNNNN.png files
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Region to repair as x1,y1,x2,y2 (defaults to the configured band)
        #[arg(long)]
        region: Option<Region>,
    },

    /// Generate a deterministic synthetic frame and mask corpus
    Synth {
        /// Directory for generated frames
        #[arg(long, default_value = "demo/frames")]
        frames_dir: PathBuf,

        /// Directory for generated masks
        #[arg(long, default_value = "demo/masks")]
        masks_dir: PathBuf,

        /// Number of frames (defaults to the configured count)
        #[arg(short = 'n', long)]
        count: Option<u32>,

        /// Frame width
        #[arg(long)]
        width: Option<u32>,

        /// Frame height
        #[arg(long)]
        height: Option<u32>,

        /// Subtitle region as x1,y1,x2,y2
        #[arg(long)]
        region: Option<Region>,
    },

    /// Download an object, or every object under a prefix
    Download {
        /// Remote location (s3://bucket/key)
        uri: RemoteLocator,

        /// Local file, or directory with --recursive
        output: PathBuf,

        /// Download every object under the key
        #[arg(short, long)]
        recursive: bool,
    },

    /// Upload a file, or a directory tree
    Upload {
        /// Local file, or directory with --recursive
        input: PathBuf,

        /// Remote location (s3://bucket/key)
        uri: RemoteLocator,

        /// Upload every file below the directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Check whether a remote object exists (exit code 1 when absent)
    Exists {
        /// Remote location (s3://bucket/key)
        uri: RemoteLocator,
    },

    /// List configured model weights and their status
    Weights {
        /// Download missing weights regardless of the detected profile
        #[arg(long)]
        download: bool,
    },

    /// Write the effective configuration (defaults plus any loaded file) to a file
    Config {
        /// Output path
        #[arg(short, long, default_value = "desub.toml")]
        output: PathBuf,
    },

    /// Run the full subtitle removal pipeline
    Run {
        /// Input video, local path or s3://bucket/key
        #[arg(short, long)]
        input: Location,

        /// Output video, local path or s3://bucket/key
        #[arg(short, long)]
        output: Location,

        /// Region to mask on every frame as x1,y1,x2,y2
        #[arg(long, conflicts_with = "masks")]
        region: Option<Region>,

        /// Prepared mask directory, local or remote
        #[arg(long)]
        masks: Option<Location>,

        /// Resample to this frame rate during extraction
        #[arg(long)]
        target_fps: Option<f64>,

        /// Output frame rate (defaults to the source rate)
        #[arg(long)]
        fps: Option<f64>,

        /// Video codec
        #[arg(long)]
        codec: Option<String>,

        /// Upload the run directory under this location when done
        #[arg(long)]
        artifacts: Option<RemoteLocator>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let args = Args::try_parse_from([
            "desub",
            "run",
            "-i",
            "s3://bucket/in/clip.mp4",
            "-o",
            "clean.mp4",
            "--region",
            "0,205,256,256",
        ])
        .unwrap();

        match args.command {
            Commands::Run {
                input,
                output,
                region,
                masks,
                ..
            } => {
                assert!(matches!(input, Location::Remote(_)));
                assert_eq!(output, Location::Local(PathBuf::from("clean.mp4")));
                assert_eq!(region, Some(Region::new(0, 205, 256, 256)));
                assert!(masks.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_malformed_locator_rejected_at_parse() {
        assert!(Args::try_parse_from(["desub", "exists", "s3://bucket"]).is_err());
        assert!(
            Args::try_parse_from([
                "desub", "run", "-i", "a.mp4", "-o", "b.mp4", "--region", "0,0,1,1", "--masks", "m"
            ])
            .is_err()
        );
    }
}
