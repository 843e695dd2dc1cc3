//! desub - burnt-in subtitle removal workflow
//!
//! Orchestrates frame extraction and reassembly around ffmpeg, subtitle mask
//! synthesis, external inpainting stages and S3 artifact staging.

pub mod capability;
pub mod cli;
pub mod config;
pub mod error;
pub mod frames;
pub mod inference;
pub mod mask;
pub mod media;
pub mod setup;
pub mod storage;
pub mod workflow;
