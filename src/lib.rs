//! Batch image captioning against a locally hosted multimodal inference
//! server.
//!
//! The crate is built from four pieces:
//!
//! * [`Config`] holds the connection and behavior parameters.
//! * [`codec`] re-encodes image files into base64 payloads.
//! * [`InferenceClient`] speaks the server's HTTP protocol and turns every
//!   failure into a displayable caption.
//! * [`BatchRunner`] walks a folder and captions each image with a bounded
//!   pool of workers, reporting progress as results arrive.
//!
//! ```no_run
//! use kornia_captioner::{BatchRunner, Config, InferenceClient, SUPPORTED_EXTENSIONS};
//! use std::{path::Path, sync::Arc};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let client = Arc::new(InferenceClient::new(config.clone())?);
//! let runner = BatchRunner::new(client, config.concurrency_level);
//!
//! let mut run = runner.run(Path::new("photos"), SUPPORTED_EXTENSIONS).await?;
//! while let Some(result) = run.next().await {
//!     println!("{}: {}", result.file_name, result.caption);
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod messages;

pub use batch::{
    AnalysisResult, BatchPoll, BatchProgress, BatchRun, BatchRunner, BatchState,
    SUPPORTED_EXTENSIONS,
};
pub use client::{CaptionModel, InferenceClient, ModelInfo};
pub use config::{Config, SaveFormat};
pub use error::{AnalyzeError, BatchError, ClientError, CodecError, ConfigError, ExportError};
pub use export::export_results;
