pub mod amount;
pub mod config;
pub mod result;

pub use amount::{format_grouped, format_plain, round_whole};
pub use config::{ConfigError, OcrConfig};
pub use result::OcrResult;
