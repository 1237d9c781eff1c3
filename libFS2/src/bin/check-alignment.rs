use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fs2::{dataloader::DataLoader, DatasetConfig, FsDataset};

/// Checks that the durations of a preprocessed corpus add up to the mel frame counts
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dataset configuration file (json)
    cfg: PathBuf,
    /// Index file to check, defaults to the validation index of the config
    #[arg(long)]
    index: Option<String>,
    /// Number of loader threads
    #[arg(short = 'j', long)]
    num_threads: Option<usize>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        true => log::LevelFilter::max(),
        _ => log::LevelFilter::Info,
    };
    env_logger::builder().filter_level(level).init();

    let cfg = DatasetConfig::open(&args.cfg)?;
    let index = args.index.unwrap_or_else(|| cfg.valid_index.clone());
    let ds = FsDataset::new(&cfg, &index, true)?;
    log::info!("Loaded {} utterances from {:?}", ds.len(), cfg.preprocessed_path.join(&index));

    let mut builder = DataLoader::builder(ds).batch_size(1).drop_last(true);
    if let Some(n) = args.num_threads {
        builder = builder.num_threads(n);
    }
    let mut loader = builder.build()?;
    log::info!("Estimated total steps: {}", loader.total_steps(cfg.epochs));

    loader.start_epoch(0)?;
    let (mut n_batches, mut n_aligned) = (0, 0);
    while let Some(batches) = loader.get_batch()? {
        for batch in batches {
            n_batches += 1;
            let n_frames = batch.max_mel_len() as i64;
            if n_frames == batch.duration.sum() {
                n_aligned += 1;
            } else {
                log::debug!(
                    "{:?}: {} mel frames, durations sum up to {}",
                    batch.ids,
                    n_frames,
                    batch.duration.sum()
                );
            }
        }
    }
    log::info!("{} of {} batches have matching durations", n_aligned, n_batches);
    Ok(())
}
