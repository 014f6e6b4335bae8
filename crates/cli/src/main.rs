use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use billscan_core::{OcrConfig, OcrResult};
use billscan_ocr::{analyze_text, EngineFactory, OcrService};
use clap::Parser;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Read the total off bill photos and print one JSON line per image.
#[derive(Debug, Parser)]
#[command(name = "billscan", version)]
struct Cli {
    /// TOML file with an `[ocr]` table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the recognizer's language data.
    #[arg(long)]
    tessdata: Option<PathBuf>,

    /// Language set, e.g. `eng+vie`.
    #[arg(long)]
    languages: Option<String>,

    #[arg(long)]
    max_engines: Option<usize>,

    #[arg(long)]
    rent_timeout_ms: Option<u64>,

    /// Skip orientation, deskew, contrast and threshold steps.
    #[arg(long)]
    no_preprocessing: bool,

    /// Treat inputs as already-recognized text files.
    #[arg(long)]
    from_text: bool,

    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

impl Cli {
    fn ocr_config(&self) -> anyhow::Result<OcrConfig> {
        let mut config = match &self.config {
            Some(path) => OcrConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => OcrConfig::default(),
        };

        if let Some(tessdata) = &self.tessdata {
            config.tessdata_path = tessdata.clone();
        }
        if let Some(languages) = &self.languages {
            config.languages = languages.clone();
        }
        if let Some(max_engines) = self.max_engines {
            config.max_engines = max_engines;
        }
        if let Some(rent_timeout_ms) = self.rent_timeout_ms {
            config.rent_timeout_ms = rent_timeout_ms;
        }
        if self.no_preprocessing {
            config.enable_preprocessing = false;
        }

        config.validated().context("invalid OCR configuration")
    }
}

#[derive(Serialize)]
struct Report {
    file: String,
    result: OcrResult,
}

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        process::exit(0);
    };
    tracing::error!("{error:#}");
    eprintln!("Error: {error:#}");
    process::exit(1);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    if cli.from_text {
        return analyze_text_files(&cli.inputs).await;
    }

    let config = cli.ocr_config()?;
    let service = Arc::new(OcrService::from_config(engine_factory(&config), &config));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding requests");
            on_interrupt.cancel();
        }
    });

    let mut requests = JoinSet::new();
    for path in cli.inputs.clone() {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        requests.spawn(async move {
            let result = service.recognize_file(&path, &cancel).await;
            Report { file: path.display().to_string(), result }
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = requests.join_next().await {
        let report = joined.context("recognition task panicked")?;
        if !report.result.success {
            failures += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    service.shutdown();
    anyhow::ensure!(failures == 0, "{failures} of {} images failed", cli.inputs.len());
    Ok(())
}

async fn analyze_text_files(inputs: &[PathBuf]) -> anyhow::Result<()> {
    for path in inputs {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let report = Report { file: path.display().to_string(), result: analyze_text(&text) };
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

#[cfg(feature = "tesseract")]
fn engine_factory(config: &OcrConfig) -> impl EngineFactory {
    billscan_ocr::TesseractFactory::new(config.tessdata_path.clone(), &config.languages)
}

#[cfg(not(feature = "tesseract"))]
fn engine_factory(_config: &OcrConfig) -> impl EngineFactory {
    tracing::warn!("Built without the `tesseract` feature; every image will fail");
    billscan_ocr::UnavailableFactory
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {e}"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}
