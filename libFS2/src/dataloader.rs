use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use rand::seq::SliceRandom;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::{current_num_threads, prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;

use crate::dataset::{Batch, FsDataset, FsDatasetError, Sample};

type Result<T> = std::result::Result<T, FsDataloaderError>;
type SampleResult = std::result::Result<Sample, FsDatasetError>;

#[derive(Error, Debug)]
pub enum FsDataloaderError {
    #[error("Dataloading Timeout")]
    TimeoutError,
    #[error("Channels not initialized. Have you already called start_epoch()?")]
    ChannelsNotInitializedError,
    #[error("Multithreading Send Error: {0:?}")]
    SendError(String),
    #[error("Thread Join Error: {0:?}")]
    ThreadJoinError(String),
    #[error("Threadpool Builder Error")]
    ThreadPoolBuildError(#[from] ThreadPoolBuildError),
    #[error("FS2 Dataset Error")]
    DatasetError(#[from] FsDatasetError),
}

impl<T> From<std::sync::mpsc::SendError<T>> for FsDataloaderError {
    fn from(error: std::sync::mpsc::SendError<T>) -> Self {
        FsDataloaderError::SendError(error.to_string())
    }
}

/// Prefetching loader over an [`FsDataset`].
///
/// Every pull takes `batch_size` consecutive indices of the epoch order, loads them on a rayon
/// worker pool and hands the results, failed samples included, to [`FsDataset::collate`].
pub struct DataLoader {
    ds: Arc<FsDataset>,
    batch_size: usize,
    num_workers: usize,
    num_prefech: usize,
    shuffle: bool,
    drop_last: bool,
    idcs: Arc<Mutex<VecDeque<(usize, isize)>>>,
    fill_thread: Option<thread::JoinHandle<Result<()>>>,
    out_receiver: Option<Receiver<(usize, SampleResult)>>,
    out_buf: BTreeMap<usize, SampleResult>,
    cur_out_idx: usize,
    drained: bool,
    finished: bool,
}

pub struct DataLoaderBuilder {
    _ds: FsDataset,
    _batch_size: Option<usize>,
    _prefetch: Option<usize>,
    _num_threads: Option<usize>,
    _shuffle: bool,
    _drop_last: bool,
}

impl DataLoaderBuilder {
    pub fn new(ds: FsDataset) -> Self {
        DataLoaderBuilder {
            _ds: ds,
            _batch_size: None,
            _prefetch: None,
            _num_threads: None,
            _shuffle: false,
            _drop_last: false,
        }
    }
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self._batch_size = Some(batch_size);
        self
    }
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self._prefetch = Some(prefetch);
        self
    }
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self._num_threads = Some(num_threads);
        self
    }
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self._shuffle = shuffle;
        self
    }
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self._drop_last = drop_last;
        self
    }
    pub fn build(self) -> Result<DataLoader> {
        let bs = self._batch_size.unwrap_or_else(|| self._ds.config().batch_size).max(1);
        let num_threads = self._num_threads.or(self._ds.config().num_workers);
        let prefetch = self._prefetch.unwrap_or(bs * num_threads.unwrap_or(4) * 2);
        let mut loader = DataLoader::new(self._ds, bs, prefetch, num_threads)?;
        loader.shuffle = self._shuffle;
        loader.drop_last = self._drop_last;
        Ok(loader)
    }
}

impl DataLoader {
    pub fn builder(ds: FsDataset) -> DataLoaderBuilder {
        DataLoaderBuilder::new(ds)
    }
    pub fn new(
        ds: FsDataset,
        batch_size: usize,
        num_prefech: usize,
        num_threads: Option<usize>,
    ) -> Result<Self> {
        // Register global rayon threadpool. It will only be used for data loader workers.
        let num_workers = num_threads.unwrap_or_else(current_num_threads).max(1);
        if let Err(e) = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|idx| format!("DataLoader Worker {idx}"))
            .build_global()
        {
            // Already initialized, e.g. by a previous loader.
            log::debug!("Using existing global thread pool ({})", e);
        }
        Ok(DataLoader {
            ds: Arc::new(ds),
            batch_size: batch_size.max(1),
            num_workers,
            num_prefech,
            shuffle: false,
            drop_last: false,
            idcs: Arc::new(Mutex::new(VecDeque::new())),
            fill_thread: None,
            out_receiver: None,
            out_buf: BTreeMap::new(),
            cur_out_idx: 0,
            drained: false,
            finished: false,
        })
    }

    pub fn dataset(&self) -> Arc<FsDataset> {
        self.ds.clone()
    }

    pub fn dataset_len(&self) -> usize {
        self.ds.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of pulls per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset_len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated number of training steps, `epochs * len() * batch_size`.
    pub fn total_steps(&self, epochs: usize) -> usize {
        epochs * self.len() * self.batch_size
    }

    fn start_idx_worker(&mut self) -> Result<thread::JoinHandle<Result<()>>> {
        if self.num_prefech < self.batch_size {
            log::warn!(
                "Prefetch size ({}) is smaller then batch size ({}).",
                self.num_prefech,
                self.batch_size
            )
        }
        let (out_sender, out_receiver) = sync_channel(self.num_prefech.max(1));
        self.out_receiver = Some(out_receiver);
        let ds = self.ds.clone();
        let (in_sender, in_receiver) = unbounded();
        let idcs: Vec<(usize, isize)> = self.idcs.lock().unwrap().drain(..).collect();
        for idx in idcs {
            in_sender.send(idx).expect("Could not send index");
        }
        in_sender.send((0, -1)).expect("Could not send index");

        let worker_recievers: Vec<_> = (0..self.num_workers).map(|_| in_receiver.clone()).collect();
        let handle = thread::spawn(move || -> Result<()> {
            worker_recievers.par_iter().try_for_each(|r| {
                while let Ok((sample_idx, ordering_idx)) = r.recv() {
                    if ordering_idx == -1 {
                        out_sender.send((0, Err(FsDatasetError::DatasetDrained)))?;
                        return Ok(());
                    }
                    log::trace!("Worker: Getting sample {}", sample_idx);
                    let sample = ds.get_sample(sample_idx);
                    out_sender.send((ordering_idx as usize, sample))?;
                }
                Ok(())
            })
        });
        Ok(handle)
    }

    /// Prepares the index order of a new epoch and starts the workers. With shuffling enabled
    /// the order only depends on `seed`.
    pub fn start_epoch(&mut self, seed: u64) -> Result<()> {
        // Drop fill thread if exits
        if self.fill_thread.is_some() {
            self.join_fill_thread()?;
        }
        log::trace!("Start epoch with seed {}", seed);
        // Output buffers for ordering analogue to self.idcs
        self.out_buf = BTreeMap::new();
        self.cur_out_idx = 0;
        {
            let mut sample_idcs: Vec<usize> = (0..self.dataset_len()).collect();
            if self.shuffle {
                sample_idcs.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(seed));
            }
            // Concatenate an ordering index
            let idcs: VecDeque<(usize, isize)> = sample_idcs.into_iter().zip(0..).collect();
            self.idcs.lock().unwrap().clone_from(&idcs);
        }
        self.fill_thread = Some(self.start_idx_worker()?);
        self.drained = false;
        self.finished = false;
        Ok(())
    }

    fn next_samples(&mut self) -> Result<Vec<SampleResult>> {
        let target_idx = self.dataset_len().min(self.cur_out_idx + self.batch_size);
        if self.cur_out_idx >= self.dataset_len() {
            self.drained = true;
        }
        let mut samples = Vec::with_capacity(self.batch_size);
        let mut tries = 0;
        let reciever = match self.out_receiver.as_ref() {
            None => {
                return Err(FsDataloaderError::ChannelsNotInitializedError);
            }
            Some(r) => r,
        };
        'outer: while self.cur_out_idx < target_idx {
            // Check if we have some buffered samples
            if let Some(s) = self.out_buf.remove(&self.cur_out_idx) {
                samples.push(s);
                self.cur_out_idx += 1;
            } else {
                // Or check worker threads
                match reciever.recv_timeout(Duration::from_millis(100)) {
                    Err(_e) => {
                        log::trace!("Dataloader worker timeout. Retrying ({})", tries);
                        if tries > 1000 {
                            return Err(FsDataloaderError::TimeoutError);
                        }
                        tries += 1;
                        continue 'outer;
                    }
                    Ok((_, Err(FsDatasetError::DatasetDrained))) => {
                        self.drained = true;
                    }
                    Ok((o_idx, s)) => {
                        if o_idx == self.cur_out_idx {
                            samples.push(s);
                            self.cur_out_idx += 1;
                        } else {
                            assert!(self.out_buf.insert(o_idx, s).is_none());
                        }
                    }
                }
            }
            tries = 0;
        }
        if self.cur_out_idx >= self.dataset_len() {
            self.drained = true;
        }
        Ok(samples)
    }

    /// Returns the sub-batches of the next pull, or `None` once the epoch is exhausted.
    ///
    /// A pull in which every sample failed to load yields `Some(vec![])`. After the end of an
    /// epoch, `None` is returned until the next call to [`DataLoader::start_epoch`].
    pub fn get_batch(&mut self) -> Result<Option<Vec<Batch>>> {
        if self.finished {
            return Ok(None);
        }
        let samples = self.next_samples()?;
        let incomplete = samples.len() < self.batch_size;
        if samples.is_empty() || (self.drained && self.drop_last && incomplete) {
            self.join_fill_thread()?;
            self.finished = true;
            return Ok(None);
        }
        let batches = self.ds.collate(samples)?;
        Ok(Some(batches))
    }

    pub fn join_fill_thread(&mut self) -> Result<()> {
        // Drop out_receiver so that parallel iter in fill thread will return
        drop(self.out_receiver.take());
        if let Some(thread) = self.fill_thread.take() {
            if let Err(e) = thread
                .join()
                .map_err(|e| FsDataloaderError::ThreadJoinError(format!("{:?}", e)))?
            {
                match e {
                    FsDataloaderError::SendError(_) => (),
                    // Not expected send error due to out_channel closing
                    e => {
                        log::error!("Error during worker shutdown: {:?}", e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Iterator for DataLoader {
    type Item = Result<Vec<Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_batch().transpose()
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        if let Err(e) = self.join_fill_thread() {
            log::error!("Could not stop dataloader worker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::dataset::tests::write_corpus;

    fn loader(lengths: &[usize], bs: usize) -> (tempfile::TempDir, DataLoaderBuilder) {
        let (dir, cfg) = write_corpus(lengths);
        let ds = FsDataset::new(&cfg, "train.txt", true).unwrap();
        (dir, DataLoader::builder(ds).batch_size(bs).num_threads(2))
    }

    #[test]
    fn test_len_and_total_steps() -> Result<()> {
        let (_dir, builder) = loader(&[1, 2, 3, 4, 5, 6, 7], 3);
        let l = builder.build()?;
        assert_eq!(l.len(), 3);
        assert_eq!(l.total_steps(10), 90);
        let (_dir, builder) = loader(&[1, 2, 3, 4, 5, 6, 7], 3);
        let l = builder.drop_last(true).build()?;
        assert_eq!(l.len(), 2);
        Ok(())
    }

    #[test]
    fn test_get_batch_requires_epoch() -> Result<()> {
        let (_dir, builder) = loader(&[1, 2], 1);
        let mut l = builder.build()?;
        assert!(matches!(l.get_batch(), Err(FsDataloaderError::ChannelsNotInitializedError)));
        Ok(())
    }

    #[test]
    fn test_epoch_in_order() -> Result<()> {
        let lengths = [3, 5, 2, 8, 4, 6, 1, 7, 9, 2, 4];
        let (_dir, builder) = loader(&lengths, 10);
        let mut l = builder.build()?;
        for epoch in 0..2 {
            l.start_epoch(epoch)?;
            let first = l.get_batch()?.expect("first pull");
            assert_eq!(first.len(), 3);
            let src_lens: Vec<Vec<usize>> = first.iter().map(|b| b.src_len.to_vec()).collect();
            assert_eq!(src_lens, vec![vec![9, 8, 7], vec![6, 5, 4], vec![3, 2, 2]]);
            // Tail of a single sample still forms one sub-batch
            let tail = l.get_batch()?.expect("tail pull");
            assert_eq!(tail.len(), 1);
            assert_eq!(tail[0].ids, vec!["u10"]);
            assert!(l.get_batch()?.is_none());
        }
        Ok(())
    }

    #[test]
    fn test_drop_last() -> Result<()> {
        let (_dir, builder) = loader(&[1, 2, 3, 4, 5], 4);
        let mut l = builder.drop_last(true).build()?;
        l.start_epoch(0)?;
        let n_pulls = l.by_ref().map(|b| b.map(|b| b.len())).collect::<Result<Vec<_>>>()?;
        assert_eq!(n_pulls, vec![2]);
        Ok(())
    }

    #[test]
    fn test_exhausted_epoch_stays_exhausted() -> Result<()> {
        let (_dir, builder) = loader(&[1, 2, 3], 2);
        let mut l = builder.build()?;
        l.start_epoch(0)?;
        assert_eq!(l.by_ref().count(), 2);
        assert!(l.get_batch()?.is_none());
        assert!(l.next().is_none());
        assert!(l.next().is_none());
        // A new epoch starts over
        l.start_epoch(1)?;
        let first = l.get_batch()?.expect("first pull of second epoch");
        assert_eq!(first[0].ids, vec!["u1"]);
        Ok(())
    }

    #[test]
    fn test_shuffle_is_seeded() -> Result<()> {
        let lengths: Vec<usize> = (1..=16).collect();
        let ids = |seed: u64| -> Result<Vec<String>> {
            let (_dir, builder) = loader(&lengths, 1);
            let mut l = builder.shuffle(true).build()?;
            l.start_epoch(seed)?;
            let mut ids = Vec::new();
            while let Some(b) = l.get_batch()? {
                ids.extend(b.into_iter().flat_map(|b| b.ids));
            }
            Ok(ids)
        };
        let a = ids(3)?;
        assert_eq!(a.len(), 16);
        assert_eq!(a, ids(3)?);
        let mut sorted = a.clone();
        sorted.sort();
        let mut expected: Vec<String> = (0..16).map(|i| format!("u{i}")).collect();
        expected.sort();
        assert_eq!(sorted, expected);
        Ok(())
    }

    #[test]
    fn test_failed_samples_are_skipped() -> Result<()> {
        let (dir, builder) = loader(&[1, 2, 3, 4, 5], 5);
        let cfg = crate::DatasetConfig::new(dir.path());
        fs::remove_file(cfg.feature_path("f0", "f0", "u2")).unwrap();
        let mut l = builder.build()?;
        l.start_epoch(0)?;
        let b = l.get_batch()?.expect("one pull");
        assert_eq!(b.len(), 2);
        assert!(b.iter().all(|b| b.batch_size() == 2 && !b.ids.contains(&"u2".to_string())));
        assert!(l.get_batch()?.is_none());
        Ok(())
    }
}
