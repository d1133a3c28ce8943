//! MIL学習の実行
//!
//! 使い方: `mil_train [config.json]`
//!
//! 引数を省略した場合はカレントディレクトリの `config.json`、
//! それも無ければデフォルト設定を使用します。

use std::path::Path;

use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamWConfig, Optimizer, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::{NdArray, NdArrayDevice};
use tracing::{error, info};

use mil_trainer_lib::logging::init_tracing;
use mil_trainer_lib::metrics_sink::{CsvSink, LogSink, MultiSink};
use mil_trainer_lib::ml::{MilClassifier, MilTrainer, TileIndex, TileLoader};
use mil_trainer_lib::model::{load_metadata, log_metadata_info, DeviceType, MilConfig, OptimizerKind};

fn main() {
    init_tracing();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => MilConfig::load(&path)?,
        None => MilConfig::load_or_default(),
    };
    config.validate().context("設定が不正です")?;
    config.display();

    match config.device_type {
        DeviceType::Cpu => train::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu),
        DeviceType::Wgpu => train_wgpu(&config),
    }
}

#[cfg(feature = "wgpu")]
fn train_wgpu(config: &MilConfig) -> Result<()> {
    use burn_wgpu::{Wgpu, WgpuDevice};
    train::<Autodiff<Wgpu>>(config, WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn train_wgpu(_config: &MilConfig) -> Result<()> {
    anyhow::bail!("wgpu 機能を有効にせずにビルドされています。device_type を Cpu にしてください")
}

fn train<B: AutodiffBackend>(config: &MilConfig, device: B::Device) -> Result<()> {
    let data = &config.data;
    let options = data.index_options();

    let train_index = TileIndex::load(
        &data.manifest_path(&data.train_split),
        data.layout(&data.train_split),
        &options,
    )
    .context("学習データのマニフェストを読み込めません")?;

    let val_index = data
        .val_split
        .as_deref()
        .map(|split| TileIndex::load(&data.manifest_path(split), data.layout(split), &options))
        .transpose()
        .context("検証データのマニフェストを読み込めません")?;

    let training = &config.training;
    let loader = TileLoader::new(config.model.tile_size, training.num_workers, training.image_load_policy)?;

    let model = config.model.model_config().init::<B>(&device);

    match training.optimizer {
        OptimizerKind::Adam => {
            let optimizer = AdamWConfig::new()
                .with_weight_decay(training.weight_decay)
                .init::<B, MilClassifier<B>>();
            fit(config, MilTrainer::new(model, optimizer, train_index, loader, training.clone(), device), val_index)
        }
        OptimizerKind::Sgd { momentum } => {
            // dampening 0 は PyTorch の SGD と同じ更新式
            let optimizer = SgdConfig::new()
                .with_momentum(Some(MomentumConfig::new().with_momentum(momentum).with_dampening(0.0)))
                .with_weight_decay(Some(WeightDecayConfig::new(training.weight_decay)))
                .init::<B, MilClassifier<B>>();
            fit(config, MilTrainer::new(model, optimizer, train_index, loader, training.clone(), device), val_index)
        }
    }
}

fn fit<B, O>(
    config: &MilConfig,
    mut trainer: MilTrainer<B, MilClassifier<B>, O>,
    val_index: Option<TileIndex>,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<MilClassifier<B>, B>,
{
    if let Some(dir) = &config.output.checkpoint_dir {
        trainer = trainer.with_checkpoints(dir, config.model.model_config(), config.data.label_scheme());
    }

    let mut sink = MultiSink::new().with(LogSink);
    if let Some(path) = &config.output.metrics_csv {
        sink = sink.with(CsvSink::create(Path::new(path))?);
    }

    let summary = trainer.fit(val_index.as_ref(), &mut sink)?;

    info!(
        epochs = summary.epochs.len(),
        best_epoch = ?summary.best_epoch,
        best_val_accuracy = ?summary.best_val_accuracy,
        "学習が完了しました"
    );
    if let Some(path) = &summary.last_good_checkpoint {
        log_metadata_info(&load_metadata(path)?);
    }

    Ok(())
}
