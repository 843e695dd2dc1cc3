//! desub - burnt-in subtitle removal workflow
//!
//! Entry point for the command-line tool: extracts frames with ffmpeg,
//! synthesizes subtitle masks, hands frames and masks to external inpainting
//! stages and reassembles the result, staging artifacts through S3.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use desub::capability::CapabilityDetector;
use desub::cli::{Args, Commands};
use desub::config::Config;
use desub::mask;
use desub::media::{MediaProcessorFactory, MediaProcessorTrait};
use desub::setup::SetupManager;
use desub::storage::{StagingClient, TreeTransferReport};
use desub::workflow::{Location, MaskSource, Pipeline, PipelineJob};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new("desub.toml").exists() {
                info!("Found desub.toml in current directory, loading...");
                Config::from_file("desub.toml")?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Detect { json } => {
            let profile = CapabilityDetector::new(config.capability.clone()).detect().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                for (key, value) in profile.env_vars() {
                    println!("export {}={}", key, value);
                }
            }
            std::process::exit(profile.exit_code());
        }
        Commands::Probe { input } => {
            let media = MediaProcessorFactory::create_processor(config.media.clone());
            let info = media.probe(&input).await?;
            println!("File:       {}", input.display());
            println!("Resolution: {}x{}", info.width, info.height);
            println!("Frame rate: {} ({:.3} fps)", info.fps, info.fps.as_f64());
            println!("Duration:   {:.2}s", info.duration_seconds);
            if let Some(frames) = info.frame_count {
                println!("Frames:     {}", frames);
            }
        }
        Commands::Extract { input, output_dir, fps } => {
            let media = MediaProcessorFactory::create_processor(config.media.clone());
            media.check_availability().await?;
            let extracted = media.extract_frames(&input, &output_dir, fps).await?;
            println!(
                "Extracted {} frames to {}",
                extracted.frames.len(),
                output_dir.display()
            );
        }
        Commands::Assemble { frames_dir, output, fps, codec } => {
            let media = MediaProcessorFactory::create_processor(config.media.clone());
            media.check_availability().await?;
            let fps = fps.unwrap_or(config.media.default_fps);
            let codec = codec.unwrap_or_else(|| config.media.default_codec.clone());
            media.assemble(&frames_dir, &output, fps, &codec).await?;
            println!("Wrote {}", output.display());
        }
        Commands::Masks { frames_dir, output_dir, region } => {
            let region = region.unwrap_or(config.masks.subtitle_region);
            let masks = mask::generate_masks(&frames_dir, &output_dir, region)?;
            println!("Wrote {} masks to {}", masks.len(), output_dir.display());
        }
        Commands::Synth { frames_dir, masks_dir, count, width, height, region } => {
            let corpus = mask::synthesize_demo_corpus(
                &frames_dir,
                &masks_dir,
                count.unwrap_or(config.masks.demo_frame_count),
                (
                    width.unwrap_or(config.masks.demo_frame_width),
                    height.unwrap_or(config.masks.demo_frame_height),
                ),
                region.unwrap_or(config.masks.demo_region),
            )?;
            println!(
                "Generated {} frames in {} and {} masks in {}",
                corpus.frames.len(),
                frames_dir.display(),
                corpus.masks.len(),
                masks_dir.display()
            );
        }
        Commands::Download { uri, output, recursive } => {
            let storage = StagingClient::connect(&config.storage).await;
            if recursive {
                let report = storage.download_tree(&uri, &output).await?;
                print_tree_report("Downloaded", &report);
            } else {
                let size = storage.download(&uri, &output).await?;
                println!("Downloaded {} ({} bytes) to {}", uri, size, output.display());
            }
        }
        Commands::Upload { input, uri, recursive } => {
            let storage = StagingClient::connect(&config.storage).await;
            if recursive {
                let report = storage.upload_tree(&input, &uri).await?;
                print_tree_report("Uploaded", &report);
            } else {
                let size = storage.upload(&input, &uri).await?;
                println!("Uploaded {} ({} bytes) to {}", input.display(), size, uri);
            }
        }
        Commands::Exists { uri } => {
            let storage = StagingClient::connect(&config.storage).await;
            let found = storage.exists(&uri).await;
            println!("{}", found);
            if !found {
                std::process::exit(1);
            }
        }
        Commands::Weights { download } => {
            let setup = SetupManager::new(&config)?;

            println!("\nModel weights in {}:", setup.weights_dir().display());
            println!("{:<20} {:<30} {:<10}", "Name", "Filename", "Status");
            println!("{}", "-".repeat(62));
            for file in setup.weight_files() {
                let status = if setup.local_path(file).exists() {
                    "Present"
                } else {
                    "Missing"
                };
                println!("{:<20} {:<30} {:<10}", file.name, file.filename, status);
            }

            if download {
                for file in setup.missing_weights() {
                    setup.download_weight(file).await?;
                }
                info!("All weights downloaded successfully");
            }
        }
        Commands::Config { output } => {
            config.save_to_file(&output)?;
            println!("Configuration written to {}", output.display());
        }
        Commands::Run {
            input,
            output,
            region,
            masks,
            target_fps,
            fps,
            codec,
            artifacts,
        } => {
            let profile = CapabilityDetector::new(config.capability.clone()).detect().await;

            let masks = match masks {
                Some(location) => MaskSource::Directory(location),
                None => MaskSource::Region(region.unwrap_or(config.masks.subtitle_region)),
            };
            let job = PipelineJob {
                input,
                output,
                masks,
                target_fps,
                fps,
                codec,
                artifacts,
            };

            let storage = if needs_remote(&job) {
                StagingClient::connect(&config.storage).await
            } else {
                StagingClient::unavailable("job uses local paths only")
            };

            let pipeline = Pipeline::new(config, profile, storage);
            let report = pipeline.run(&job).await?;
            println!(
                "Run {} finished: {} frames -> {} (work dir {})",
                report.run_id,
                report.frame_count,
                job.output,
                report.work_dir.display()
            );
        }
    }

    Ok(())
}

fn needs_remote(job: &PipelineJob) -> bool {
    let remote = |location: &Location| matches!(location, Location::Remote(_));
    remote(&job.input)
        || remote(&job.output)
        || job.artifacts.is_some()
        || matches!(&job.masks, MaskSource::Directory(location) if remote(location))
}

fn print_tree_report(verb: &str, report: &TreeTransferReport) {
    println!("{} {}/{} files", verb, report.transferred, report.attempted);
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.path.display(), failure.error);
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".desub").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "desub.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("desub.log").display()
    );

    Ok(())
}
