pub mod extract;
pub mod pipeline;
pub mod pool;
pub mod preprocess;
pub mod recognizer;
pub mod score;
pub mod types;

pub use extract::{parse_english_amount, parse_vietnamese_amount, Extractor, MIN_AMOUNT};
pub use pipeline::{analyze_text, OcrService, PipelineError};
pub use pool::{EngineLease, EnginePool, PoolError};
pub use preprocess::{NormalizedImage, Normalizer, PreprocessError, Strategy};
pub use recognizer::{
    Engine, EngineFactory, EngineVariable, MockEngine, MockEngineFactory, NoEngine, OcrError,
    UnavailableFactory, CHAR_WHITELIST,
};
pub use score::{pick, rank, TOTAL_KEYWORDS};
pub use types::AmountCandidate;

#[cfg(feature = "tesseract")]
pub use recognizer::tesseract_backend::{TesseractEngine, TesseractFactory};
