use crate::{
    codec,
    config::Config,
    error::{AnalyzeError, ClientError, NO_RESULT_MESSAGE},
    messages::{GenerateRequest, GenerateResponse, TagsResponse},
};
use std::{future::Future, path::Path, time::Duration};

/// Name substituted for models the server lists without one.
pub const UNKNOWN_MODEL_NAME: &str = "Unknown";

/// Trait for anything that can turn an image file into a caption.
///
/// The batch runner only talks to this trait, so the HTTP client can be
/// swapped for another backend (or a fake in tests).
pub trait CaptionModel: Send + Sync + 'static {
    /// Produces a caption for the image at `image_path`.
    ///
    /// Implementations never fail: errors are reported as a human-readable
    /// caption so one bad image cannot abort a batch.
    fn caption(&self, image_path: &Path) -> impl Future<Output = String> + Send;
}

/// A model installed on the inference server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: String,
}

/// HTTP client for the inference server.
///
/// Holds one pooled transport whose request timeout is the configured
/// `timeout_seconds`. The configuration is fixed for the client's lifetime;
/// build a new client to apply changed settings.
pub struct InferenceClient {
    http: reqwest::Client,
    config: Config,
    base_url: String,
}

impl InferenceClient {
    /// Creates a client from `config`, validating it first.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let config = config.validated();
        let timeout = config.timeout();
        Self::with_timeout(config, timeout)
    }

    /// Creates a client whose transport timeout is `timeout` instead of the
    /// configured one.
    pub fn with_timeout(config: Config, timeout: Duration) -> Result<Self, ClientError> {
        let config = config.validated();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = config.server_url.trim().trim_end_matches('/').to_string();

        log::debug!(
            "Inference client for {} (model {}, timeout {:?})",
            base_url,
            config.model_name,
            timeout
        );

        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Analyzes one image and returns its caption, or a descriptive message
    /// when anything goes wrong. Never fails.
    pub async fn analyze(&self, image_path: &Path) -> String {
        match self.try_analyze(image_path).await {
            Ok(caption) => caption,
            Err(e) => {
                log::warn!("Analysis of {} failed: {e:?}", image_path.display());
                e.to_string()
            }
        }
    }

    /// Analyzes one image, keeping the failure classification.
    ///
    /// A response without a caption is not an error; it yields the
    /// "no result" message.
    pub async fn try_analyze(&self, image_path: &Path) -> Result<String, AnalyzeError> {
        let image = codec::encode_image_base64(image_path)?;

        let request = GenerateRequest {
            model: &self.config.model_name,
            prompt: &self.config.prompt,
            images: vec![image],
            stream: false,
        };

        log::debug!("Sending {} to {}", image_path.display(), self.base_url);

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(AnalyzeError::Unavailable);
            }
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzeError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let reply: GenerateResponse = response.json().await?;
        if !reply.done {
            log::debug!("Server reported an unfinished generation");
        }

        match reply.response {
            Some(caption) if !caption.trim().is_empty() => Ok(caption),
            _ => Ok(NO_RESULT_MESSAGE.to_string()),
        }
    }

    /// Returns true iff `GET /api/tags` answers with a 2xx status.
    pub async fn is_available(&self) -> bool {
        match self.get_tags().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("Inference server at {} not reachable: {e}", self.base_url);
                false
            }
        }
    }

    /// Lists the models installed on the server, in server order. Any
    /// failure yields an empty list.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        match self.fetch_models().await {
            Ok(models) => models,
            Err(e) => {
                log::warn!("Failed to list models: {e}");
                Vec::new()
            }
        }
    }

    async fn fetch_models(&self) -> Result<Vec<ModelInfo>, AnalyzeError> {
        let response = self.get_tags().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzeError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let tags: TagsResponse = response.json().await?;
        let models: Vec<ModelInfo> = tags
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name.unwrap_or_else(|| UNKNOWN_MODEL_NAME.to_string()),
                size_bytes: m.size,
                modified_at: m.modified_at.unwrap_or_default(),
            })
            .collect();

        log::debug!("Listed {} models", models.len());
        Ok(models)
    }

    async fn get_tags(&self) -> reqwest::Result<reqwest::Response> {
        self.http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
    }
}

impl CaptionModel for InferenceClient {
    fn caption(&self, image_path: &Path) -> impl Future<Output = String> + Send {
        self.analyze(image_path)
    }
}
