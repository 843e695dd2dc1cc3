use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Font error: {0}")]
    Font(#[from] ab_glyph::InvalidFont),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed URI '{uri}': {reason}")]
    MalformedLocator { uri: String, reason: String },

    #[error("Tool '{tool}' could not be started: {reason}")]
    ToolNotFound { tool: String, reason: String },

    #[error("{description} failed: {detail}")]
    ToolFailed { description: String, detail: String },

    #[error("{description} produced no output at {}", path.display())]
    MissingOutput { description: String, path: PathBuf },

    #[error("Invalid frame set in {}: {reason}", dir.display())]
    InvalidFrameSet { dir: PathBuf, reason: String },

    #[error("No video stream found in {}", .0.display())]
    NoVideoStream(PathBuf),

    #[error("Remote storage unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Storage transfer failed for {location}: {detail}")]
    Transfer { location: String, detail: String },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<DesubError>,
    },
}

/// Failure classes the orchestrator reasons about.
///
/// Recorded with a failed run so callers can tell bad input from a broken tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Bad input or environment; fatal, never retried.
    Configuration,
    /// A single transfer inside a bulk operation; recorded and skipped.
    TransientIo,
    /// An external process failed or left no output; fatal to the stage.
    ToolInvocation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientIo => "transient-io",
            ErrorKind::ToolInvocation => "tool-invocation",
        };
        f.write_str(name)
    }
}

impl DesubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DesubError::Config(_)
            | DesubError::Toml(_)
            | DesubError::MalformedLocator { .. }
            | DesubError::ToolNotFound { .. }
            | DesubError::RemoteUnavailable(_)
            | DesubError::FileNotFound(_)
            | DesubError::Font(_) => ErrorKind::Configuration,
            DesubError::Transfer { .. } | DesubError::Http(_) => ErrorKind::TransientIo,
            DesubError::ToolFailed { .. }
            | DesubError::MissingOutput { .. }
            | DesubError::InvalidFrameSet { .. }
            | DesubError::NoVideoStream(_) => ErrorKind::ToolInvocation,
            DesubError::Io(_) | DesubError::Json(_) | DesubError::Image(_) => {
                ErrorKind::ToolInvocation
            }
            DesubError::StageFailed { source, .. } => source.kind(),
        }
    }

    /// Wraps an error with the name of the pipeline stage it halted.
    pub fn at_stage(self, stage: impl Into<String>) -> Self {
        DesubError::StageFailed {
            stage: stage.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, DesubError>;
