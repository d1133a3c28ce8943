pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod ml_model;
pub mod schedule;
pub mod tile_index;
pub mod top_k;
pub mod training;

pub use dataset::{ImageLayout, ImageLoadPolicy, TileLoader};
pub use evaluation::{evaluate, ClassificationMetrics, EvaluationReport, MetricValue};
pub use inference::{InferenceOutput, InferenceRunner};
pub use ml_model::{
    load_and_normalize_image_with_size, weighted_cross_entropy, MilClassifier, ModelConfig, TileClassifier, NUM_CLASSES,
};
pub use tile_index::{EnumerationMode, TileIndex, TileIndexOptions, TileView};
pub use top_k::{select_top_k, slide_max_probability};
pub use training::{EpochPhase, EpochStats, FitSummary, MilTrainer, SelectionSummary};
