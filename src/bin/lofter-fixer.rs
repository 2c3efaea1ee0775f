use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::Level;

use lofter_fixer::{
    AlbumStorage, BatchRequest, ModelService, OnnxDetector, RepairEngine, TaskEntry,
    DEFAULT_CONFIDENCE, DEFAULT_INPUT_SIZE, DEFAULT_PADDING,
};

#[derive(Parser)]
#[command(
    name = "lofter-fixer",
    about = "Detect a watermark and patch it from a clean reference image",
    version,
    after_help = "Single pair:  lofter-fixer -m best.onnx --target a.jpg --reference b.jpg\n\
                  Directories:  lofter-fixer -m best.onnx --targets-dir wm/ --references-dir clean/\n\
                  Batch file:   lofter-fixer -m best.onnx --config tasks.json\n\n\
                  Repaired images are written to <output-dir>/LofterFixed/Fixed_<name>."
)]
struct Cli {
    /// ONNX detector model
    #[arg(short, long)]
    model: PathBuf,

    /// JSON batch request ({"tasks": [...], "confidence": .., "padding": ..})
    #[arg(short, long, conflicts_with_all = ["target", "targets_dir"])]
    config: Option<PathBuf>,

    /// Watermarked image
    #[arg(long, requires = "reference", conflicts_with = "targets_dir")]
    target: Option<PathBuf>,

    /// Clean reference image for --target
    #[arg(long, requires = "target")]
    reference: Option<PathBuf>,

    /// Directory of watermarked images
    #[arg(long, requires = "references_dir")]
    targets_dir: Option<PathBuf>,

    /// Directory of reference images with matching file names
    #[arg(long, requires = "targets_dir")]
    references_dir: Option<PathBuf>,

    /// Root directory for the output album
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Detection confidence threshold (0.0-1.0), overrides the batch file
    #[arg(long)]
    confidence: Option<f64>,

    /// Padding ratio added on each side of the box, overrides the batch file
    #[arg(long)]
    padding: Option<f64>,

    /// Square model input resolution
    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut request = match build_request(&cli) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    if let Some(confidence) = cli.confidence {
        request.confidence = confidence;
    }
    if let Some(padding) = cli.padding {
        request.padding = padding;
    }

    let model = ModelService::new(OnnxDetector::loader(cli.model.clone(), cli.input_size));
    let engine = RepairEngine::new(model, AlbumStorage::new(&cli.output_dir));

    let result = engine.run(&request);
    engine.shutdown();

    let payload = match &result {
        Ok(summary) => serde_json::to_string(summary),
        Err(failure) => serde_json::to_string(failure),
    };
    match payload {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: failed to encode result: {e}"),
    }

    if let Err(failure) = result {
        if !cli.quiet {
            eprintln!("{}", failure.message.trim_end());
        }
        process::exit(1);
    }
}

fn build_request(cli: &Cli) -> lofter_fixer::Result<BatchRequest> {
    if let Some(config) = &cli.config {
        let json = std::fs::read_to_string(config)?;
        return BatchRequest::from_json(&json);
    }

    let tasks = match (&cli.target, &cli.reference, &cli.targets_dir, &cli.references_dir) {
        (Some(target), Some(reference), _, _) => vec![TaskEntry {
            target_path: target.clone(),
            reference_path: reference.clone(),
        }],
        (_, _, Some(targets), Some(references)) => {
            BatchRequest::from_directories(targets, references)?
        }
        _ => {
            return Err(lofter_fixer::Error::InvalidRequest(
                "expected --config, --target/--reference or --targets-dir/--references-dir"
                    .to_string(),
            ))
        }
    };

    Ok(BatchRequest {
        tasks,
        confidence: DEFAULT_CONFIDENCE,
        padding: DEFAULT_PADDING,
    })
}
