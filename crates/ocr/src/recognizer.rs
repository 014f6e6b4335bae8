use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pool::EngineLease;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("Tesseract not available — build with `tesseract` feature")]
    NotAvailable,
    #[error("OCR cancelled")]
    Cancelled,
    #[error("OCR worker failed: {0}")]
    Worker(String),
}

/// Characters the engine may emit: digits, separators and the letters of the
/// currency and total keywords the extractor looks for, in English and
/// Vietnamese.
pub const CHAR_WHITELIST: &str = "0123456789.,$VNDvndđĐdongDONGđồngĐỒNG\
tổngTỔNGtongTONGtotalTOTALsumSUMthànhTHÀNHtiềnTIỀNtoánTOÁNpaymentPAYMENTcộngCỘNG ";

/// Engine parameters the invoker sets before each recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVariable {
    /// Restrict output to the listed characters.
    CharWhitelist,
    /// Bias character classification towards digits.
    NumericMode,
}

/// A stateful text-recognition engine.
///
/// Engines are `Send` but deliberately not `Sync`: an instance may move between
/// worker threads but is never used by two callers at once. The pool enforces
/// that by handing each instance to exactly one [`EngineLease`].
pub trait Engine: Send + 'static {
    fn set_variable(&mut self, variable: EngineVariable, value: &str) -> Result<(), OcrError>;

    /// Recognize text in a PNG-encoded image.
    fn recognize(&mut self, image_png: &[u8]) -> Result<String, OcrError>;
}

/// Builds engines on demand. Construction is expensive and blocking, so the
/// pool only calls this from a blocking worker.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn create(&self) -> Result<Self::Engine, OcrError>;
}

/// Run one engine over one normalized image on a blocking worker.
///
/// The lease moves into the worker and is released when the worker finishes,
/// even if the caller stops waiting. Cancellation is checked before the call
/// and after it; a cancellation that arrives mid-call lets the engine finish
/// and throws its output away.
pub async fn recognize<E: Engine>(
    lease: EngineLease<E>,
    image_png: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<String, OcrError> {
    if cancel.is_cancelled() {
        return Err(OcrError::Cancelled);
    }

    let worker = tokio::task::spawn_blocking(move || {
        let mut lease = lease;
        let engine = lease.engine_mut();
        engine.set_variable(EngineVariable::CharWhitelist, CHAR_WHITELIST)?;
        engine.set_variable(EngineVariable::NumericMode, "1")?;
        engine.recognize(&image_png)
    });

    let text = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::info!("Recognition cancelled; engine returns to the pool when it finishes");
            return Err(OcrError::Cancelled);
        }
        joined = worker => joined.map_err(|e| OcrError::Worker(e.to_string()))??,
    };

    if cancel.is_cancelled() {
        return Err(OcrError::Cancelled);
    }
    Ok(text)
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string after an optional delay, and records the variables
/// it was configured with.
pub struct MockEngine {
    text: String,
    delay: Duration,
    pub variables: Vec<(EngineVariable, String)>,
}

impl Engine for MockEngine {
    fn set_variable(&mut self, variable: EngineVariable, value: &str) -> Result<(), OcrError> {
        self.variables.push((variable, value.to_string()));
        Ok(())
    }

    fn recognize(&mut self, image_png: &[u8]) -> Result<String, OcrError> {
        if image_png.is_empty() {
            return Err(OcrError::ImageDecode("empty image".into()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self.text.clone())
    }
}

/// Factory for [`MockEngine`]s. Clones share the creation counter.
#[derive(Clone)]
pub struct MockEngineFactory {
    text: String,
    delay: Duration,
    fail: bool,
    created: Arc<AtomicUsize>,
}

impl MockEngineFactory {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay: Duration::ZERO,
            fail: false,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every recognition take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make engine construction fail.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of engines constructed so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    type Engine = MockEngine;

    fn create(&self) -> Result<MockEngine, OcrError> {
        if self.fail {
            return Err(OcrError::Engine("mock engine refused to start".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockEngine {
            text: self.text.clone(),
            delay: self.delay,
            variables: Vec::new(),
        })
    }
}

// ── Placeholder backend for builds without an engine ──────────────────────────

/// An engine that can never exist.
pub enum NoEngine {}

impl Engine for NoEngine {
    fn set_variable(&mut self, _variable: EngineVariable, _value: &str) -> Result<(), OcrError> {
        match *self {}
    }

    fn recognize(&mut self, _image_png: &[u8]) -> Result<String, OcrError> {
        match *self {}
    }
}

/// Factory used when no recognition backend is compiled in. Every request
/// fails with [`OcrError::NotAvailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableFactory;

impl EngineFactory for UnavailableFactory {
    type Engine = NoEngine;

    fn create(&self) -> Result<NoEngine, OcrError> {
        Err(OcrError::NotAvailable)
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{Engine, EngineFactory, EngineVariable, OcrError};
    use leptess::{LepTess, Variable};
    use std::path::PathBuf;

    pub struct TesseractEngine {
        inner: LepTess,
    }

    // SAFETY: the Tesseract handle is only touched by whoever holds the pool
    // lease, and a lease has exactly one owner at a time.
    unsafe impl Send for TesseractEngine {}

    impl Engine for TesseractEngine {
        fn set_variable(&mut self, variable: EngineVariable, value: &str) -> Result<(), OcrError> {
            let name = match variable {
                EngineVariable::CharWhitelist => Variable::TesseditCharWhitelist,
                EngineVariable::NumericMode => Variable::ClassifyBlnNumericMode,
            };
            self.inner
                .set_variable(name, value)
                .map_err(|e| OcrError::Engine(e.to_string()))
        }

        fn recognize(&mut self, image_png: &[u8]) -> Result<String, OcrError> {
            self.inner
                .set_image_from_mem(image_png)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            self.inner.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))
        }
    }

    pub struct TesseractFactory {
        data_path: PathBuf,
        lang: String,
    }

    impl TesseractFactory {
        pub fn new(data_path: PathBuf, lang: &str) -> Self {
            Self { data_path, lang: lang.to_string() }
        }
    }

    impl EngineFactory for TesseractFactory {
        type Engine = TesseractEngine;

        fn create(&self) -> Result<TesseractEngine, OcrError> {
            let data_path = self.data_path.to_str();
            let inner = LepTess::new(data_path, &self.lang)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            Ok(TesseractEngine { inner })
        }
    }
}
