pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{
    DataSettings, DeviceType, MilConfig, ModelSettings, OptimizerKind, OutputSettings, TrainingSettings,
};
pub use model_metadata::CheckpointMetadata;
pub use model_storage::{
    encode_model, load_checkpoint, load_classifier, load_metadata, log_metadata_info, save_checkpoint,
    BEST_CHECKPOINT_NAME,
};
