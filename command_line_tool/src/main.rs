use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, warn};

use stackalign::{
    AlignmentError, AlignmentParams, FeatureStore, IntensityBounds, PairwiseAligner,
};

mod dataset;

use dataset::FileDataset;

/// Command line arguments structure.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Pairwise alignment of two channels of a 3-D microscopy stack via DoG landmarks."
)]
struct Args {
    /// Dataset root directory (contains metadata.json and slice images)
    #[arg(long)]
    dataset: PathBuf,

    /// Stack key, e.g. Pos012
    #[arg(long)]
    id: String,

    /// Channel A key, e.g. Ch488+561+647nm
    #[arg(long)]
    channel_a: String,

    /// Channel B key, e.g. Ch405nm
    #[arg(long)]
    channel_b: String,

    /// CamA key, e.g. cam1
    #[arg(long)]
    cam_a: String,

    /// CamB key, e.g. cam1
    #[arg(long)]
    cam_b: String,

    /// Blocksize in z for point extraction
    #[arg(short = 'b', long, default_value_t = 20)]
    blocksize: i64,

    /// First slice index
    #[arg(long, default_value_t = 0)]
    first: i64,

    /// Last slice index (clamped to the shortest stack involved)
    #[arg(long, default_value_t = i64::MAX)]
    last: i64,

    /// Min intensity; if equal to --max-intensity, min/max are determined
    /// per slice
    #[arg(long, default_value_t = 0.0)]
    min_intensity: f64,

    /// Max intensity; if equal to --min-intensity, min/max are determined
    /// per slice
    #[arg(long, default_value_t = 4096.0)]
    max_intensity: f64,

    /// Try to load previously saved points before extracting
    #[arg(long, default_value_t = false)]
    try_loading_points: bool,

    /// Seed of the consensus filter's random sampling
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> ExitCode {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")
        .and_then(|logger| logger.start());

    let args = Args::parse();

    let dataset = match FileDataset::open(&args.dataset, &args.id) {
        Ok(dataset) => dataset,
        Err(message) => {
            error!("{message}");
            eprintln!("Err: {message}");
            return ExitCode::FAILURE;
        }
    };
    let store = FeatureStore::new(&args.dataset);

    let mut params = AlignmentParams::new(
        &args.id,
        &args.channel_a,
        &args.cam_a,
        &args.channel_b,
        &args.cam_b,
    );
    params.first_slice = args.first;
    params.last_slice = args.last;
    params.block_size = args.blocksize;
    params.try_loading_points = args.try_loading_points;
    params.consensus.seed = args.seed;
    // equal bounds select per-slice auto contrast
    params.intensity = if args.min_intensity == args.max_intensity {
        IntensityBounds::AutoPerSlice
    } else {
        IntensityBounds::Fixed {
            min: args.min_intensity,
            max: args.max_intensity,
        }
    };

    let aligner = PairwiseAligner::new(&dataset, &dataset).with_store(&store);
    match aligner.align(&params) {
        Ok(result) => {
            println!(
                "accepted matches: {} (mean residual {:.4})",
                result.matches.len(),
                result.mean_residual
            );
            println!("transform: {:?}", result.model);
            ExitCode::SUCCESS
        }
        Err(e @ (AlignmentError::UnknownChannelCam { .. } | AlignmentError::EmptySliceRange { .. })) => {
            error!("{e}");
            eprintln!("Err: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            // low-confidence or missing-data outcomes abandon this pair
            // only; a batch over many stacks keeps going
            warn!("alignment abandoned: {e}");
            println!("alignment abandoned: {e}");
            ExitCode::SUCCESS
        }
    }
}
