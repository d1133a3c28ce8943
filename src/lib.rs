//! スライド単位のラベルからタイル分類器を学習するMIL（Multiple-Instance Learning）トレーナー
//!
//! - `ml::tile_index`: マニフェストからスライド → タイルの索引を構築
//! - `ml::inference`: 全タイルの陽性確率を推論
//! - `ml::top_k`: スライドごとに確率上位kタイルを選択
//! - `ml::training`: エポックごとの推論 → 選択 → 学習の状態機械
//! - `ml::evaluation`: 検証データの評価指標

pub mod csv_loader;
pub mod error;
pub mod logging;
pub mod metrics_sink;
pub mod ml;
pub mod model;
pub mod types;

pub use error::{DataLoadError, DegenerateBatchError, ImageLoadError, MilError, MilResult, OptimizerDivergenceError};
pub use types::{ClassLabel, LabelScheme, Slide, TrainingTriple};
