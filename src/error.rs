//! エラー定義
//!
//! 起動時に致命的なもの（マニフェスト読み込み）と、タイル単位・バッチ単位で
//! 隔離されるもの（画像読み込み、評価指標の計算不能）を区別します。

use std::path::PathBuf;

use thiserror::Error;

use crate::ml::training::EpochPhase;

pub type MilResult<T> = Result<T, MilError>;

/// マニフェスト読み込みエラー（起動時に致命的）
#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("manifest {path:?} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("manifest {path:?} is missing column '{column}'")]
    MissingColumn { path: PathBuf, column: String },
    #[error("manifest {0:?} contains no tiles")]
    Empty(PathBuf),
    #[error("row {row}: unrecognized label '{value}' (expected '{positive}' or '{negative}')")]
    UnknownLabel {
        row: usize,
        value: String,
        positive: String,
        negative: String,
    },
    #[error("slide '{slide_id}' has conflicting labels across its tiles")]
    ConflictingLabel { slide_id: String },
    #[error("subset rate must be in (0, 1], got {0}")]
    InvalidSubsetRate(f64),
}

/// タイル画像の読み込みエラー（タイル単位）
#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("tile image {path:?} could not be decoded: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("tile image {path:?} is {width}x{height}, expected {expected}x{expected}")]
    Size {
        path: PathBuf,
        width: u32,
        height: u32,
        expected: usize,
    },
}

impl ImageLoadError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ImageLoadError::Decode { path, .. } | ImageLoadError::Size { path, .. } => path,
        }
    }
}

/// 評価指標の分母がゼロになるケース
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DegenerateBatchError {
    #[error("evaluation set is empty")]
    Empty,
    #[error("no negative samples: false-positive rate is undefined")]
    NoNegatives,
    #[error("no positive samples: false-negative rate is undefined")]
    NoPositives,
}

/// 損失が有限値でなくなった場合のエラー
#[derive(Debug, Error, Clone, PartialEq)]
#[error("loss diverged to {loss} at epoch {epoch}, batch {batch} (last good checkpoint: {last_good_checkpoint:?})")]
pub struct OptimizerDivergenceError {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
    pub last_good_checkpoint: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum MilError {
    #[error(transparent)]
    DataLoad(#[from] DataLoadError),
    #[error(transparent)]
    ImageLoad(#[from] ImageLoadError),
    #[error(transparent)]
    Divergence(#[from] OptimizerDivergenceError),
    #[error(transparent)]
    Degenerate(#[from] DegenerateBatchError),
    #[error("flat tile index {index} is out of range (tile count {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("length mismatch: {left} slide indices vs {right} probabilities")]
    LengthMismatch { left: usize, right: usize },
    #[error("illegal epoch transition {from:?} -> {to:?}")]
    InvalidTransition { from: EpochPhase, to: EpochPhase },
    #[error("class weights must be positive and finite, got {0:?}")]
    InvalidClassWeights([f32; 2]),
    #[error("worker pool could not be created: {0}")]
    WorkerPool(String),
    #[error("tensor data error: {0}")]
    TensorData(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("metrics sink error: {0}")]
    MetricsSink(String),
}
