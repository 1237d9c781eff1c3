//! Data-plane for FastSpeech2 style acoustic model training.
//!
//! Reads precomputed per-utterance features (mel, durations, f0, energy), normalizes them with
//! corpus statistics and assembles length-bucketed, zero-padded batches.
//!
//! Diagnostics go through the `log` facade. Processes without a logger of their own can install
//! [`logging::init_logger`] and drain its receiver.

pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod logging;
pub mod text;
pub mod util;

pub use config::DatasetConfig;
pub use dataset::{Batch, FsDataset, Sample};

/// Name of the per-feature statistics files below the preprocessed root.
pub const MEL_STAT_FILE: &str = "mel_stat.npy";
pub const F0_STAT_FILE: &str = "f0_stat.npy";
pub const ENERGY_STAT_FILE: &str = "energy_stat.npy";
