use std::path::PathBuf;

/// Message shown when the inference server cannot be reached.
pub const UNAVAILABLE_MESSAGE: &str =
    "Cannot connect to the inference server. Make sure the server is running.";

/// Message shown when a request exceeds the configured timeout.
pub const TIMEOUT_MESSAGE: &str =
    "The analysis timed out. The image may be too large or the model is taking too long to respond.";

/// Message shown when the server answered without a caption.
pub const NO_RESULT_MESSAGE: &str = "Could not retrieve an analysis result.";

/// Errors raised while turning an image file into a transmissible payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("cannot re-encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Classified failure of a single analyze call.
///
/// The `Display` output is the caption shown to the user in place of a
/// generated description.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("{}", UNAVAILABLE_MESSAGE)]
    Unavailable,

    #[error("{}", TIMEOUT_MESSAGE)]
    Timeout,

    #[error("API request failed: {code} - {body}")]
    Status { code: u16, body: String },

    #[error("Failed to convert the image: {0}")]
    Codec(#[from] CodecError),

    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl From<reqwest::Error> for AnalyzeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            AnalyzeError::Unavailable
        } else if err.is_timeout() {
            AnalyzeError::Timeout
        } else {
            AnalyzeError::Unexpected(err.to_string())
        }
    }
}

/// Errors raised while building the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Batch-level failures. Any of these aborts the whole batch before a
/// single image is analyzed.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("failed to read folder {path}: {source}")]
    Enumeration {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("folder scan aborted: {0}")]
    ScanAborted(tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("settings file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON export failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
}
