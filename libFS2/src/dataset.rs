use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use thiserror::Error;

use crate::{config::DatasetConfig, text::*, util::*};
use crate::{ENERGY_STAT_FILE, F0_STAT_FILE, MEL_STAT_FILE};

pub type Result<T> = std::result::Result<T, FsDatasetError>;

#[derive(Error, Debug)]
pub enum FsDatasetError {
    #[error("Dataset Drained")]
    DatasetDrained,
    #[error("Sample index {idx} out of range for dataset of size {len}")]
    IndexOutOfRange { idx: usize, len: usize },
    #[error("Malformed index file {path:?}, line {line}: expected '<id>|<transcript>'")]
    MalformedIndex { path: PathBuf, line: usize },
    #[error("Malformed statistics file {path:?}: expected [mean, std], got {len} values")]
    MalformedStat { path: PathBuf, len: usize },
    #[error("Could not read statistics file {path:?}")]
    StatError { source: UtilsError, path: PathBuf },
    #[error("Could not load sample '{id}' from {path:?}")]
    SampleLoad {
        id: String,
        path: PathBuf,
        source: UtilsError,
    },
    #[error("Data Processing Error: {0:?}")]
    DataProcessingError(String),
    #[error("Config Error: {0}")]
    ConfigError(String),
    #[error("FS2 Utils Error")]
    UtilsError(#[from] UtilsError),
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Json Decoding Error")]
    JsonDecode(#[from] serde_json::Error),
    #[error("Index Parsing Error")]
    CsvError(#[from] csv::Error),
}

// (sub directory, file name kind)
const MEL: (&str, &str) = ("mel", "mel");
const ALIGNMENT: (&str, &str) = ("alignment", "ali");
const F0: (&str, &str) = ("f0", "f0");
const ENERGY: (&str, &str) = ("energy", "energy");

/// One utterance as stored on disk, not yet normalized.
pub struct Sample {
    pub id: String,
    pub idx: usize,
    pub text: Array1<i64>,
    pub mel_target: Array2<f32>,
    pub duration: Array1<i64>,
    pub f0: Array1<f32>,
    pub energy: Array1<f32>,
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Dataset Sample {} ('{}') with text len: '{}', mel frames: '{}')",
            self.idx,
            self.id,
            self.text.len(),
            self.mel_target.len_of(Axis(0)),
        ))
    }
}

/// A normalized and zero padded sub-batch. All arrays share the batch size as first axis.
pub struct Batch {
    pub ids: Vec<String>,
    pub text: Array2<i64>,
    pub mel_target: Array3<f32>,
    pub duration: Array2<i64>,
    pub log_duration: Array2<f32>,
    pub f0: Array2<f32>,
    pub energy: Array2<f32>,
    pub src_len: Array1<usize>,
    pub mel_len: Array1<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }
    pub fn max_src_len(&self) -> usize {
        self.text.len_of(Axis(1))
    }
    pub fn max_mel_len(&self) -> usize {
        self.mel_target.len_of(Axis(1))
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Dataset Batch with batch_size: '{}', src_len: '{:?}', mel_len: '{:?}')",
            self.batch_size(),
            self.src_len,
            self.mel_len
        ))
    }
}

/// Reads `<id>|<transcript>` lines. Additional `|` separated fields are ignored, quotes are
/// part of the transcript.
pub fn process_meta<P: AsRef<Path>>(path: P) -> Result<(Vec<String>, Vec<String>)> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'|')
        .flexible(true)
        .quoting(false)
        .from_reader(BufReader::new(fs::File::open(path)?));
    let mut names = Vec::new();
    let mut texts = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.len() == 1 && record[0].trim().is_empty() {
            continue;
        }
        match (record.get(0), record.get(1)) {
            (Some(n), Some(t)) if !n.is_empty() => {
                names.push(n.to_string());
                texts.push(t.to_string());
            }
            _ => {
                return Err(FsDatasetError::MalformedIndex {
                    path: path.to_path_buf(),
                    line: record.position().map_or(0, |p| p.line() as usize),
                })
            }
        }
    }
    Ok((names, texts))
}

/// Reads a `[mean, std]` statistics file.
pub fn load_stat<P: AsRef<Path>>(path: P) -> Result<NormStat> {
    let path = path.as_ref();
    let stat: Array1<f32> = read_f32_npy(path).map_err(|source| FsDatasetError::StatError {
        source,
        path: path.to_path_buf(),
    })?;
    if stat.len() != 2 {
        return Err(FsDatasetError::MalformedStat {
            path: path.to_path_buf(),
            len: stat.len(),
        });
    }
    Ok(NormStat::new(stat[0], stat[1]))
}

fn floor_sqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r > n {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    r
}

/// Splits `lengths.len()` samples into `n = floor(sqrt(len))` groups of `n` samples.
///
/// With `sort`, groups are consecutive slices of the samples ordered by descending length (ties
/// keep their input order), i.e. each group holds samples of similar length. Otherwise groups are
/// consecutive slices of the input order. The trailing `len - n * n` samples are not part of any
/// group.
pub fn bucket_indices(lengths: &[usize], sort: bool) -> Vec<Vec<usize>> {
    let n = floor_sqrt(lengths.len());
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    if sort {
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    }
    order.chunks_exact(n.max(1)).take(n).map(|c| c.to_vec()).collect()
}

/// Dataset over one index file of a preprocessed corpus.
///
/// Only the index and the normalization statistics are held in memory; features are read from
/// disk on every access. All state is immutable after construction.
pub struct FsDataset {
    config: DatasetConfig,
    basenames: Vec<String>,
    texts: Vec<String>,
    mel_stat: NormStat,
    f0_stat: NormStat,
    energy_stat: NormStat,
    sort: bool,
}

impl FsDataset {
    pub fn new(config: &DatasetConfig, index_file: &str, sort: bool) -> Result<Self> {
        config.validate()?;
        let root = &config.preprocessed_path;
        let (basenames, texts) = process_meta(root.join(index_file))?;
        let mel_stat = load_stat(root.join(MEL_STAT_FILE))?;
        let f0_stat = load_stat(root.join(F0_STAT_FILE))?;
        let energy_stat = load_stat(root.join(ENERGY_STAT_FILE))?;
        log::debug!(
            "Loaded index '{}' with {} utterances from {:?}",
            index_file,
            basenames.len(),
            root
        );
        Ok(FsDataset {
            config: config.clone(),
            basenames,
            texts,
            mel_stat,
            f0_stat,
            energy_stat,
            sort,
        })
    }

    pub fn len(&self) -> usize {
        self.basenames.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }
    pub fn id(&self, idx: usize) -> Option<&str> {
        self.basenames.get(idx).map(|s| s.as_str())
    }
    pub fn transcript(&self, idx: usize) -> Option<&str> {
        self.texts.get(idx).map(|s| s.as_str())
    }
    /// Mel, f0 and energy statistics.
    pub fn stats(&self) -> (NormStat, NormStat, NormStat) {
        (self.mel_stat, self.f0_stat, self.energy_stat)
    }
    pub fn sort(&self) -> bool {
        self.sort
    }

    fn read_feature<T, F>(&self, id: &str, (dir, kind): (&str, &str), read: F) -> Result<T>
    where
        F: FnOnce(&Path) -> std::result::Result<T, UtilsError>,
    {
        let path = self.config.feature_path(dir, kind, id);
        read(&path).map_err(|source| FsDatasetError::SampleLoad {
            id: id.to_string(),
            path,
            source,
        })
    }

    /// Loads sample `idx` from disk.
    pub fn get_sample(&self, idx: usize) -> Result<Sample> {
        let (id, transcript) = match (self.basenames.get(idx), self.texts.get(idx)) {
            (Some(id), Some(t)) => (id, t),
            _ => {
                return Err(FsDatasetError::IndexOutOfRange {
                    idx,
                    len: self.len(),
                })
            }
        };
        let text = Array1::from(text_to_sequence(transcript));
        let mel_target = self.read_feature(id, MEL, |p| read_f32_npy::<Ix2, _>(p))?;
        let duration = self.read_feature(id, ALIGNMENT, |p| read_i64_npy(p))?;
        let f0 = self.read_feature(id, F0, |p| read_f32_npy::<Ix1, _>(p))?;
        let energy = self.read_feature(id, ENERGY, |p| read_f32_npy::<Ix1, _>(p))?;
        Ok(Sample {
            id: id.clone(),
            idx,
            text,
            mel_target,
            duration,
            f0,
            energy,
        })
    }

    /// Like [`FsDataset::get_sample`], but logs failures and returns `None` instead.
    pub fn get_item(&self, idx: usize) -> Option<Sample> {
        match self.get_sample(idx) {
            Ok(s) => Some(s),
            Err(e) => {
                log::warn!("Dataset error, basename: {:?} ({})", self.id(idx), e);
                None
            }
        }
    }

    /// Normalizes and pads the samples `cut_list` of `batch` into one [`Batch`].
    pub fn reprocess(&self, batch: &[Sample], cut_list: &[usize]) -> Result<Batch> {
        let mut samples = Vec::with_capacity(cut_list.len());
        for &i in cut_list {
            samples.push(batch.get(i).ok_or_else(|| {
                FsDatasetError::DataProcessingError(format!(
                    "Cut index {} out of range for batch of size {}",
                    i,
                    batch.len()
                ))
            })?);
        }
        let ids = samples.iter().map(|s| s.id.clone()).collect();
        let mels: Vec<Array2<f32>> =
            samples.iter().map(|s| self.mel_stat.normalize(s.mel_target.view())).collect();
        let f0s: Vec<Array1<f32>> =
            samples.iter().map(|s| self.f0_stat.normalize(s.f0.view())).collect();
        let energies: Vec<Array1<f32>> =
            samples.iter().map(|s| self.energy_stat.normalize(s.energy.view())).collect();

        // Mismatching samples are kept in the batch.
        for s in samples.iter() {
            if s.text.len() != s.duration.len() {
                log::warn!(
                    "Text and duration lengths differ for '{}': text {:?} (len {}), duration {:?} (len {}), text: '{}'",
                    s.id,
                    s.text.to_vec(),
                    s.text.len(),
                    s.duration.to_vec(),
                    s.duration.len(),
                    sequence_to_text(&s.text.to_vec()),
                );
            }
        }
        let src_len = samples.iter().map(|s| s.text.len()).collect();
        let mel_len = mels.iter().map(|m| m.len_of(Axis(0))).collect();

        let text = pad_1d(&samples.iter().map(|s| s.text.view()).collect::<Vec<_>>());
        let duration = pad_1d(&samples.iter().map(|s| s.duration.view()).collect::<Vec<_>>());
        let mel_target = pad_2d(&mels.iter().map(|m| m.view()).collect::<Vec<_>>())?;
        let f0 = pad_1d(&f0s.iter().map(|x| x.view()).collect::<Vec<_>>());
        let energy = pad_1d(&energies.iter().map(|x| x.view()).collect::<Vec<_>>());
        let log_duration = log_durations(duration.view(), self.config.log_offset);
        Ok(Batch {
            ids,
            text,
            mel_target,
            duration,
            log_duration,
            f0,
            energy,
            src_len,
            mel_len,
        })
    }

    /// Drops failed samples and splits the rest into length bucketed sub-batches.
    pub fn collate(&self, batch: Vec<Result<Sample>>) -> Result<Vec<Batch>> {
        let samples = batch
            .into_iter()
            .filter_map(|s| match s {
                Ok(s) => Some(s),
                Err(e) => {
                    log::warn!("Dropping sample from batch: {}", e);
                    None
                }
            })
            .collect();
        self.collate_samples(samples)
    }

    /// [`FsDataset::collate`] for the output of [`FsDataset::get_item`].
    pub fn collate_items(&self, batch: Vec<Option<Sample>>) -> Result<Vec<Batch>> {
        self.collate_samples(batch.into_iter().flatten().collect())
    }

    fn collate_samples(&self, samples: Vec<Sample>) -> Result<Vec<Batch>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let lengths: Vec<usize> = samples.iter().map(|s| s.text.len()).collect();
        let cut_list = bucket_indices(&lengths, self.sort);
        log::trace!(
            "Collating {} samples into {} sub-batches",
            samples.len(),
            cut_list.len()
        );
        cut_list.iter().map(|cut| self.reprocess(&samples, cut)).collect()
    }
}
