use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dataset::{FsDatasetError, Result};

fn default_dataset() -> String {
    "kss".to_string()
}
fn default_log_offset() -> f32 {
    1.
}
fn default_batch_size() -> usize {
    16
}
fn default_epochs() -> usize {
    1000
}
fn default_train_index() -> String {
    "train.txt".to_string()
}
fn default_valid_index() -> String {
    "val.txt".to_string()
}

/// Settings read once when a dataset is constructed.
#[derive(Deserialize, Debug, Clone)]
pub struct DatasetConfig {
    /// Root directory of the preprocessed corpus.
    pub preprocessed_path: PathBuf,
    /// Dataset tag used in the feature file names, e.g. `kss-mel-<id>.npy`.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Added to the durations before taking the log.
    #[serde(default = "default_log_offset")]
    pub log_offset: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Only used to estimate the total number of training steps.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_train_index")]
    pub train_index: String,
    #[serde(default = "default_valid_index")]
    pub valid_index: String,
    #[serde(default)]
    pub num_workers: Option<usize>,
}

impl DatasetConfig {
    pub fn new<P: AsRef<Path>>(preprocessed_path: P) -> Self {
        DatasetConfig {
            preprocessed_path: preprocessed_path.as_ref().to_path_buf(),
            dataset: default_dataset(),
            log_offset: default_log_offset(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            train_index: default_train_index(),
            valid_index: default_valid_index(),
            num_workers: None,
        }
    }
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let cfg: DatasetConfig = serde_json::from_reader(reader)?;
        cfg.validate()?;
        Ok(cfg)
    }
    pub fn validate(&self) -> Result<()> {
        if self.log_offset.is_nan() || self.log_offset <= 0. {
            return Err(FsDatasetError::ConfigError(format!(
                "log_offset must be positive, got {}",
                self.log_offset
            )));
        }
        if self.batch_size == 0 {
            return Err(FsDatasetError::ConfigError("batch_size must be at least 1".into()));
        }
        Ok(())
    }
    pub fn dataset(mut self, dataset: &str) -> Self {
        self.dataset = dataset.to_string();
        self
    }
    pub fn log_offset(mut self, log_offset: f32) -> Self {
        self.log_offset = log_offset;
        self
    }
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Path of one per-utterance feature file, `<root>/<dir>/<dataset>-<kind>-<id>.npy`.
    pub fn feature_path(&self, dir: &str, kind: &str, id: &str) -> PathBuf {
        self.preprocessed_path.join(dir).join(format!("{}-{}-{}.npy", self.dataset, kind, id))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_open_applies_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dataset.json");
        let mut f = fs::File::create(&path)?;
        write!(f, r#"{{"preprocessed_path": "/data/kss", "batch_size": 4}}"#)?;
        let cfg = DatasetConfig::open(&path)?;
        assert_eq!(cfg.preprocessed_path, PathBuf::from("/data/kss"));
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.dataset, "kss");
        assert_eq!(cfg.log_offset, 1.);
        assert_eq!(cfg.valid_index, "val.txt");
        assert!(cfg.num_workers.is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_non_positive_log_offset() {
        let cfg = DatasetConfig::new("/data").log_offset(0.);
        assert!(matches!(cfg.validate(), Err(FsDatasetError::ConfigError(_))));
    }

    #[test]
    fn test_feature_path() {
        let cfg = DatasetConfig::new("/data").dataset("kss");
        assert_eq!(
            cfg.feature_path("alignment", "ali", "1_0001"),
            PathBuf::from("/data/alignment/kss-ali-1_0001.npy")
        );
    }
}
