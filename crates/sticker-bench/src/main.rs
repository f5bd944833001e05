//! sticker-bench: CLI tool for making stickers from files and measuring them.
//!
//! Runs the sticker pipeline on an image plus a matte (a grayscale image
//! whose luminance is the foreground probability) and prints per-stage
//! diagnostics. Useful for:
//!
//! - Comparing the native and portable backends
//! - Tuning the smoothing kernel and border width
//! - Measuring per-stage durations to identify bottlenecks
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin sticker-bench -- --matte <MATTE> [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sticker_pipeline::{
    BackendPreference, MatteImage, NoCheckpoint, PipelineConfig, StickerDiagnostics,
    StickerOptions, StickerPipeline,
};
use tracing::{error, info};

/// Sticker making and diagnostics.
///
/// Cuts the subject out of an image using a matte, adds an optional
/// border, and prints detailed per-stage timing and pixel counts.
#[derive(Parser)]
#[command(name = "sticker-bench", version)]
struct Cli {
    /// Path to the input image (PNG or JPEG).
    image_path: PathBuf,

    /// Path to the matte (PNG or JPEG, any resolution).
    #[arg(long)]
    matte: PathBuf,

    /// Write the sticker PNG to this file (first run only).
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Disable the border.
    #[arg(long)]
    no_border: bool,

    /// Border color as #RRGGBB.
    #[arg(long, default_value = StickerOptions::DEFAULT_BORDER_COLOR)]
    border_color: String,

    /// Border width in pixels (0-50).
    #[arg(long, default_value_t = StickerOptions::DEFAULT_BORDER_WIDTH)]
    border_width: f64,

    /// Box blur kernel size (odd).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SMOOTHING_KERNEL)]
    kernel_size: u32,

    /// Backend to try first.
    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// Rows processed between checkpoints.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_CHUNK_ROWS, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    chunk_rows: u32,

    /// Time budget per run in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, `--kernel-size`, `--backend`, `--chunk-rows` and
    /// `--timeout-ms` are ignored. The JSON must be a valid
    /// `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,
}

/// Backend preference selection.
#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Multi-threaded when the machine has more than one hardware thread.
    Auto,
    /// Always sequential.
    Portable,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual config flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        smoothing_kernel: cli.kernel_size,
        backend: match cli.backend {
            Backend::Auto => BackendPreference::Auto,
            Backend::Portable => BackendPreference::Portable,
        },
        chunk_rows: cli.chunk_rows,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        ..PipelineConfig::default()
    })
}

fn options_from_cli(cli: &Cli) -> StickerOptions {
    StickerOptions {
        add_border: !cli.no_border,
        border_color: cli.border_color.clone(),
        border_width: cli.border_width,
    }
}

fn read(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn write_sticker(path: &Path, png: &[u8]) -> Result<(), String> {
    std::fs::write(path, png)
        .map_err(|e| format!("Error writing sticker to {}: {e}", path.display()))?;
    info!(path = %path.display(), bytes = png.len(), "sticker written");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = config_from_cli(cli)?;
    let options = options_from_cli(cli);
    let image_bytes = read(&cli.image_path)?;
    let matte = MatteImage::from_bytes(&read(&cli.matte)?)
        .map_err(|e| format!("Error decoding matte {}: {e}", cli.matte.display()))?;

    info!(
        image = %cli.image_path.display(),
        bytes = image_bytes.len(),
        runs = cli.runs,
        "starting"
    );
    info!("Config: {config:?}");
    info!("Options: {options:?}");

    let pipeline = StickerPipeline::new(config).map_err(|e| format!("Invalid config: {e}"))?;
    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let (output, diagnostics) = pipeline
            .make_sticker_with_diagnostics(&image_bytes, &options, &matte, &mut NoCheckpoint)
            .map_err(|e| format!("Pipeline error ({:?}): {e}", e.kind()))?;

        if cli.json {
            let json = serde_json::to_string_pretty(&diagnostics)
                .map_err(|e| format!("Error serializing diagnostics: {e}"))?;
            println!("{json}");
        } else {
            println!("{}", diagnostics.report());
        }

        // Write the PNG on the first run only.
        if run == 0
            && let Some(ref path) = cli.output
        {
            write_sticker(path, &output.png)?;
        }

        all_diagnostics.push(diagnostics);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    Ok(())
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&StickerDiagnostics) -> Option<Duration>;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[StickerDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Decode", |d| Some(d.decode.duration)),
        ("Segment", |d| Some(d.segment.duration)),
        ("Resample", |d| d.resample.as_ref().map(|s| s.duration)),
        ("Smooth", |d| Some(d.smooth.duration)),
        ("Expand", |d| d.expand.as_ref().map(|s| s.duration)),
        ("Composite", |d| Some(d.composite.duration)),
        ("Encode", |d| Some(d.encode.duration)),
    ];

    for (name, extractor) in stage_extractors {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(extractor)
            .map(|dur| dur.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }

    let fell_back = all_diagnostics.iter().filter(|d| d.fell_back).count();
    if fell_back > 0 {
        println!();
        println!("Fallback to portable backend in {fell_back} run(s)");
    }
}
