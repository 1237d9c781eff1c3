use std::path::Path;

use ndarray::{prelude::*, Zip};
use ndarray_npy::{read_npy, ReadNpyError};
use thiserror::Error;

type Result<T> = std::result::Result<T, UtilsError>;

#[derive(Error, Debug)]
pub enum UtilsError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Npy Read Error")]
    NpyReadError(#[from] ReadNpyError),
    #[error("Feature dimension mismatch: expected {expected}, got {got}")]
    FeatureDimMismatch { expected: usize, got: usize },
}

/// Element types that can be zero padded.
pub trait Data: Copy + Default + Send + Sync + 'static {}
impl Data for f32 {}
impl Data for i64 {}

/// Corpus-wide mean and standard deviation of one feature family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormStat {
    pub mean: f32,
    pub std: f32,
}

impl NormStat {
    pub fn new(mean: f32, std: f32) -> Self {
        NormStat { mean, std }
    }
    /// Z-score normalization `(x - mean) / std`.
    pub fn normalize<D: Dimension>(&self, x: ArrayView<f32, D>) -> Array<f32, D> {
        x.mapv(|v| (v - self.mean) / self.std)
    }
    pub fn denormalize<D: Dimension>(&self, x: ArrayView<f32, D>) -> Array<f32, D> {
        x.mapv(|v| v * self.std + self.mean)
    }
}

/// Stacks 1-D sequences into a `[B, T_max]` array, zero padded at the end.
pub fn pad_1d<T: Data>(xs: &[ArrayView1<T>]) -> Array2<T> {
    let max_len = xs.iter().map(|x| x.len()).max().unwrap_or(0);
    let mut out = Array2::<T>::default((xs.len(), max_len));
    for (mut row, x) in out.outer_iter_mut().zip(xs) {
        row.slice_mut(s![..x.len()]).assign(x);
    }
    out
}

/// Stacks `[T, F]` matrices into a `[B, T_max, F]` array, zero padded along time.
pub fn pad_2d<T: Data>(xs: &[ArrayView2<T>]) -> Result<Array3<T>> {
    let max_len = xs.iter().map(|x| x.len_of(Axis(0))).max().unwrap_or(0);
    let n_feat = xs.first().map(|x| x.len_of(Axis(1))).unwrap_or(0);
    if let Some(x) = xs.iter().find(|x| x.len_of(Axis(1)) != n_feat) {
        return Err(UtilsError::FeatureDimMismatch {
            expected: n_feat,
            got: x.len_of(Axis(1)),
        });
    }
    let mut out = Array3::<T>::default((xs.len(), max_len, n_feat));
    for (mut o, x) in out.outer_iter_mut().zip(xs) {
        o.slice_mut(s![..x.len_of(Axis(0)), ..]).assign(x);
    }
    Ok(out)
}

/// `ln(d + offset)` for every element.
pub fn log_durations(d: ArrayView2<i64>, offset: f32) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(d.raw_dim());
    Zip::from(&mut out).and(&d).for_each(|o, &d| *o = (d as f32 + offset).ln());
    out
}

/// Reads a float array stored either as `<f4` or `<f8`.
pub fn read_f32_npy<D, P>(path: P) -> Result<Array<f32, D>>
where
    D: Dimension,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    match read_npy::<_, Array<f32, D>>(path) {
        Ok(x) => Ok(x),
        Err(ReadNpyError::Io(e)) => Err(e.into()),
        Err(_) => Ok(read_npy::<_, Array<f64, D>>(path)?.mapv(|x| x as f32)),
    }
}

/// Reads an integer sequence stored as `<i8`, `<i4` or as whole floats.
pub fn read_i64_npy<P: AsRef<Path>>(path: P) -> Result<Array1<i64>> {
    let path = path.as_ref();
    match read_npy::<_, Array1<i64>>(path) {
        Ok(x) => Ok(x),
        Err(ReadNpyError::Io(e)) => Err(e.into()),
        Err(_) => match read_npy::<_, Array1<i32>>(path) {
            Ok(x) => Ok(x.mapv(i64::from)),
            Err(_) => Ok(read_f32_npy::<Ix1, _>(path)?.mapv(|x| x.round() as i64)),
        },
    }
}
