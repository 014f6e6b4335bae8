use std::path::Path;
use std::sync::Arc;

use billscan_core::{OcrConfig, OcrResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::extract::Extractor;
use crate::pool::{EnginePool, PoolError};
use crate::preprocess::Normalizer;
use crate::recognizer::{self, EngineFactory, OcrError};
use crate::score;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
}

impl PipelineError {
    fn is_expected(&self) -> bool {
        matches!(
            self,
            PipelineError::Pool(PoolError::Timeout(_) | PoolError::Cancelled)
                | PipelineError::Ocr(OcrError::Cancelled)
        )
    }
}

/// Reads the amount off a bill photo.
///
/// Orchestrates: acquire engine → normalize → recognize → extract → score.
/// The engine is back in the pool before the result is returned, on every path.
pub struct OcrService<F: EngineFactory> {
    pool: Arc<EnginePool<F>>,
    normalizer: Normalizer,
}

impl<F: EngineFactory> OcrService<F> {
    pub fn new(pool: Arc<EnginePool<F>>, normalizer: Normalizer) -> Self {
        Self { pool, normalizer }
    }

    pub fn from_config(factory: F, config: &OcrConfig) -> Self {
        tracing::info!(
            "OCR service starting (languages={}, max_engines={}, preprocessing={})",
            config.languages,
            config.max_engines,
            config.enable_preprocessing
        );
        Self::new(
            Arc::new(EnginePool::from_config(factory, config)),
            Normalizer::new(config.enable_preprocessing),
        )
    }

    pub fn pool(&self) -> &Arc<EnginePool<F>> {
        &self.pool
    }

    /// Stop handing out engines. Requests already holding one finish normally.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Recognize the amount on an image file.
    pub async fn recognize_file(&self, path: &Path, cancel: &CancellationToken) -> OcrResult {
        tracing::info!("Processing OCR for image: {}", path.display());
        let outcome = match tokio::fs::read(path).await {
            Ok(data) => self.run(data, cancel).await,
            Err(e) => Err(PipelineError::Io(e)),
        };
        into_result(outcome)
    }

    /// Recognize the amount on an in-memory image.
    pub async fn recognize_bytes(&self, data: Vec<u8>, cancel: &CancellationToken) -> OcrResult {
        into_result(self.run(data, cancel).await)
    }

    async fn run(&self, data: Vec<u8>, cancel: &CancellationToken) -> Result<OcrResult, PipelineError> {
        let lease = self.pool.acquire(cancel).await?;

        let normalizer = self.normalizer;
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&data))
            .await
            .map_err(|e| OcrError::Worker(e.to_string()))?;
        tracing::debug!("Image normalized via {:?} path", normalized.strategy);

        if cancel.is_cancelled() {
            return Err(OcrError::Cancelled.into());
        }

        let text = recognizer::recognize(lease, normalized.bytes, cancel).await?;
        Ok(analyze_text(&text))
    }
}

fn into_result(outcome: Result<OcrResult, PipelineError>) -> OcrResult {
    match outcome {
        Ok(result) => result,
        Err(e) if e.is_expected() => {
            tracing::warn!("OCR did not run: {e}");
            OcrResult::failed(e.to_string())
        }
        Err(e) => {
            tracing::error!("Error during OCR processing: {e}");
            OcrResult::failed(e.to_string())
        }
    }
}

/// Extract and pick the amount from already-recognized text.
pub fn analyze_text(text: &str) -> OcrResult {
    tracing::debug!("OCR raw text: {text}");

    let candidates = Extractor::extract(text);
    let extracted = score::pick(&candidates, text).map(|c| c.value);
    let possible = candidates.iter().map(|c| c.value).collect();

    tracing::info!(
        "OCR completed. Extracted amount: {}",
        extracted.map_or_else(|| "none".to_string(), |v| v.to_string())
    );
    OcrResult::recognized(text.to_string(), possible, extracted)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
