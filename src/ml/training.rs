//! MIL学習ループ
//!
//! 各エポックは次の状態を順に遷移します。
//!
//! `Idle → InferencePass → SelectionPass → SubsetBuilt → ShuffleDone → TrainingPass → Idle`
//!
//! 推論パスで全タイルの陽性確率を求め、スライドごとに上位kタイルを選び、
//! その集合をシャッフルして通常の教師あり学習を1周します。分類器が更新されるたびに
//! 選ばれるタイルが変わるため、学習対象はエポックごとに入れ替わります。

use std::path::PathBuf;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::{debug, info, warn};

use crate::error::{MilError, MilResult, OptimizerDivergenceError};
use crate::metrics_sink::MetricsSink;
use crate::ml::dataset::{for_each_batch, TileLoader};
use crate::ml::evaluation::{evaluate, EvaluationReport, MetricValue};
use crate::ml::inference::InferenceRunner;
use crate::ml::schedule::learning_rate_at;
use crate::ml::tile_index::TileIndex;
use crate::ml::top_k::select_top_k;
use crate::ml::{weighted_cross_entropy, ModelConfig, TileClassifier};
use crate::model::{encode_model, save_checkpoint, CheckpointMetadata, TrainingSettings, BEST_CHECKPOINT_NAME};
use crate::types::LabelScheme;

/// エポック内の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Idle,
    InferencePass,
    SelectionPass,
    SubsetBuilt,
    ShuffleDone,
    TrainingPass,
}

impl EpochPhase {
    /// 唯一許される次の状態
    pub fn next(self) -> Self {
        match self {
            EpochPhase::Idle => EpochPhase::InferencePass,
            EpochPhase::InferencePass => EpochPhase::SelectionPass,
            EpochPhase::SelectionPass => EpochPhase::SubsetBuilt,
            EpochPhase::SubsetBuilt => EpochPhase::ShuffleDone,
            EpochPhase::ShuffleDone => EpochPhase::TrainingPass,
            EpochPhase::TrainingPass => EpochPhase::Idle,
        }
    }
}

impl std::fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// 推論と選択の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionSummary {
    /// 確率が得られたタイル数
    pub scored: usize,
    /// 画像を読み込めず選択から除外したタイル数
    pub skipped: usize,
    /// 学習対象として選ばれたタイル数
    pub selected: usize,
}

/// 1エポックの学習結果
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub learning_rate: f64,
    pub selection: SelectionSummary,
    pub train_accuracy: MetricValue,
    pub train_loss: MetricValue,
}

/// `fit` の結果
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub epochs: Vec<EpochStats>,
    pub evaluations: Vec<(usize, EvaluationReport)>,
    pub best_epoch: Option<usize>,
    pub best_val_accuracy: Option<f64>,
    pub last_good_checkpoint: Option<PathBuf>,
}

struct CheckpointTarget {
    dir: PathBuf,
    model: ModelConfig,
    labels: LabelScheme,
}

/// MIL学習器
///
/// 分類器の重みはこの構造体だけが保持し、学習パスのオプティマイザ更新でのみ変更されます。
pub struct MilTrainer<B: AutodiffBackend, M, O> {
    model: M,
    optimizer: O,
    index: TileIndex,
    runner: InferenceRunner,
    settings: TrainingSettings,
    device: B::Device,
    phase: EpochPhase,
    epoch: usize,
    checkpoint: Option<CheckpointTarget>,
    last_good_checkpoint: Option<PathBuf>,
}

impl<B, M, O> MilTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TileClassifier<B>,
    M::InnerModule: TileClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        model: M,
        optimizer: O,
        index: TileIndex,
        loader: TileLoader,
        settings: TrainingSettings,
        device: B::Device,
    ) -> Self {
        let runner = InferenceRunner::new(loader, settings.batch_size, settings.prefetch_batches);
        Self {
            model,
            optimizer,
            index,
            runner,
            settings,
            device,
            phase: EpochPhase::Idle,
            epoch: 0,
            checkpoint: None,
            last_good_checkpoint: None,
        }
    }

    /// 検証精度が更新されるたびに `dir` へチェックポイントを保存する
    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>, model: ModelConfig, labels: LabelScheme) -> Self {
        self.checkpoint = Some(CheckpointTarget {
            dir: dir.into(),
            model,
            labels,
        });
        self
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    /// 完了したエポック数
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn index(&self) -> &TileIndex {
        &self.index
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn last_good_checkpoint(&self) -> Option<&PathBuf> {
        self.last_good_checkpoint.as_ref()
    }

    fn transition(&mut self, to: EpochPhase) -> MilResult<()> {
        if self.phase.next() != to {
            return Err(MilError::InvalidTransition { from: self.phase, to });
        }
        debug!(epoch = self.epoch, from = %self.phase, to = %to, "状態遷移");
        self.phase = to;
        Ok(())
    }

    /// 推論 → 上位k選択 → サブセット構築 → シャッフル
    ///
    /// 終了時の状態は `ShuffleDone`。
    pub fn prepare_epoch(&mut self) -> MilResult<SelectionSummary> {
        self.transition(EpochPhase::InferencePass)?;
        let classifier = self.model.valid();
        let output = self.runner.run::<B::InnerBackend, M::InnerModule, _>(
            &classifier,
            &self.index.full_enumeration(),
            &self.device,
        )?;

        self.transition(EpochPhase::SelectionPass)?;
        let slide_index = self.index.slide_index_per_tile();
        let (flat, probabilities): (Vec<usize>, Vec<f32>) = output.scored().unzip();
        let non_finite = probabilities.iter().filter(|p| !p.is_finite()).count();
        if non_finite > 0 {
            warn!(epoch = self.epoch, non_finite, "有限でない確率のタイルを最下位として扱います");
        }
        let slides: Vec<usize> = flat.iter().map(|&i| slide_index[i]).collect();
        let selected: Vec<usize> = select_top_k(&slides, &probabilities, self.settings.top_k)?
            .into_iter()
            .map(|j| flat[j])
            .collect();

        self.transition(EpochPhase::SubsetBuilt)?;
        self.index.build_subset(&selected)?;

        self.transition(EpochPhase::ShuffleDone)?;
        self.index.shuffle_subset();

        let summary = SelectionSummary {
            scored: flat.len(),
            skipped: output.skipped.len(),
            selected: selected.len(),
        };
        info!(
            epoch = self.epoch,
            scored = summary.scored,
            skipped = summary.skipped,
            selected = summary.selected,
            "学習タイルを選択しました"
        );
        Ok(summary)
    }

    /// 選択済みサブセットで教師あり学習を1周する
    ///
    /// `ShuffleDone` から開始し、終了時の状態は `Idle`。
    pub fn train_pass(&mut self, selection: SelectionSummary) -> MilResult<EpochStats> {
        self.transition(EpochPhase::TrainingPass)?;

        let epoch = self.epoch;
        let learning_rate = learning_rate_at(
            self.settings.learning_rate,
            epoch,
            &self.settings.lr_milestones,
            self.settings.lr_gamma,
        );
        let loss_fn = weighted_cross_entropy::<B>(self.settings.class_weights(), &self.device)?;
        let horizontal_flip = self.settings.horizontal_flip;
        let mut rng = rand::thread_rng();

        let device = &self.device;
        let last_good = &self.last_good_checkpoint;
        let model = &mut self.model;
        let optimizer = &mut self.optimizer;

        let mut batch_no = 0usize;
        let mut seen = 0usize;
        let mut correct = 0usize;
        let mut loss_sum = 0.0f64;

        for_each_batch(
            &self.index.selected_enumeration(),
            self.settings.batch_size,
            self.settings.prefetch_batches,
            self.runner.loader(),
            |mut batch| {
                if horizontal_flip {
                    batch.random_horizontal_flip(&mut rng);
                }
                let labels = batch.labels.clone();
                let batch = batch.into_tensors::<B>(device);
                let output = model.classify(batch.images, batch.targets, &loss_fn);

                let loss = output.loss.clone().into_scalar().elem::<f64>();
                ensure_finite(loss, epoch, batch_no, last_good)?;

                let logits = output
                    .output
                    .clone()
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| MilError::TensorData(format!("{:?}", e)))?;
                correct += count_correct(&logits, &labels);
                seen += labels.len();
                loss_sum += loss * labels.len() as f64;

                let grads = GradientsParams::from_grads(output.loss.backward(), &*model);
                *model = optimizer.step(learning_rate, model.clone(), grads);

                batch_no += 1;
                Ok(())
            },
        )?;

        self.transition(EpochPhase::Idle)?;
        self.epoch += 1;

        let (train_accuracy, train_loss) = if seen == 0 {
            warn!(epoch, "学習対象のタイルがありません");
            (MetricValue::NotComputable, MetricValue::NotComputable)
        } else {
            (
                MetricValue::Scalar(correct as f64 / seen as f64),
                MetricValue::Scalar(loss_sum / seen as f64),
            )
        };

        info!(
            epoch,
            batches = batch_no,
            lr = learning_rate,
            train_acc = %train_accuracy,
            train_loss = %train_loss,
            "学習パス完了"
        );

        Ok(EpochStats {
            epoch,
            learning_rate,
            selection,
            train_accuracy,
            train_loss,
        })
    }

    /// 1エポックを実行。途中で失敗した場合は `Idle` に戻す
    pub fn run_epoch(&mut self) -> MilResult<EpochStats> {
        let result = self
            .prepare_epoch()
            .and_then(|selection| self.train_pass(selection));
        if result.is_err() && self.phase != EpochPhase::Idle {
            warn!(epoch = self.epoch, phase = %self.phase, "エポックを中断しました");
            self.phase = EpochPhase::Idle;
        }
        result
    }

    /// 現在の重みで検証データを評価
    pub fn evaluate(&self, validation: &TileIndex) -> MilResult<EvaluationReport> {
        let classifier = self.model.valid();
        evaluate::<B::InnerBackend, M::InnerModule>(&classifier, validation, &self.runner, &self.device)
    }

    fn save_best(&mut self, epoch: usize, val_accuracy: f64) -> MilResult<()> {
        let Some(target) = &self.checkpoint else {
            return Ok(());
        };
        let metadata = CheckpointMetadata::new(
            epoch,
            val_accuracy,
            self.settings.top_k,
            &target.model,
            target.labels.clone(),
        );
        let path = encode_model::<B::InnerBackend, M::InnerModule>(self.model.valid())
            .and_then(|binary| save_checkpoint(&target.dir.join(BEST_CHECKPOINT_NAME), &metadata, &binary))
            .map_err(|e| MilError::Checkpoint(format!("{:#}", e)))?;

        info!(epoch, val_accuracy, path = %path.display(), "チェックポイントを保存しました");
        self.last_good_checkpoint = Some(path);
        Ok(())
    }

    /// 設定されたエポック数だけ学習する
    ///
    /// `validation` があれば `test_every` エポックごとと最終エポックで評価し、
    /// タイル単位の検証精度が最良になったときにチェックポイントを保存します。
    pub fn fit(&mut self, validation: Option<&TileIndex>, sink: &mut dyn MetricsSink) -> MilResult<FitSummary> {
        let mut summary = FitSummary::default();

        while self.epoch < self.settings.num_epochs {
            let stats = self.run_epoch()?;
            let epoch = stats.epoch;

            sink.record(epoch, "train_acc", stats.train_accuracy)?;
            sink.record(epoch, "train_loss", stats.train_loss)?;
            sink.record(epoch, "lr", MetricValue::Scalar(stats.learning_rate))?;
            summary.epochs.push(stats);

            let Some(validation) = validation else {
                continue;
            };
            if !self.settings.is_evaluation_epoch(epoch) {
                continue;
            }

            match self.evaluate(validation) {
                Ok(report) => {
                    record_report(sink, epoch, &report)?;
                    let accuracy = report.tiles.accuracy;
                    if summary.best_val_accuracy.map_or(true, |best| accuracy > best) {
                        summary.best_val_accuracy = Some(accuracy);
                        summary.best_epoch = Some(epoch);
                        self.save_best(epoch, accuracy)?;
                    }
                    summary.evaluations.push((epoch, report));
                }
                Err(MilError::Degenerate(e)) => {
                    warn!(epoch, error = %e, "検証指標を計算できません");
                    for name in VALIDATION_METRICS {
                        sink.record(epoch, name, MetricValue::NotComputable)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        sink.flush()?;
        summary.last_good_checkpoint = self.last_good_checkpoint.clone();
        info!(
            epochs = summary.epochs.len(),
            best_epoch = ?summary.best_epoch,
            best_val_accuracy = ?summary.best_val_accuracy,
            "学習完了"
        );
        Ok(summary)
    }
}

const VALIDATION_METRICS: [&str; 7] = [
    "val_acc",
    "val_err",
    "fpr",
    "fnr",
    "auroc_score",
    "slide_acc",
    "slide_auroc",
];

fn record_report(sink: &mut dyn MetricsSink, epoch: usize, report: &EvaluationReport) -> MilResult<()> {
    let tiles = &report.tiles;
    sink.record(epoch, "val_acc", tiles.accuracy.into())?;
    sink.record(epoch, "val_err", tiles.error.into())?;
    sink.record(epoch, "fpr", tiles.false_positive_rate)?;
    sink.record(epoch, "fnr", tiles.false_negative_rate)?;
    sink.record(epoch, "auroc_score", tiles.auroc)?;

    let (slide_acc, slide_auroc) = match &report.slides {
        Some(slides) => (slides.accuracy.into(), slides.auroc),
        None => (MetricValue::NotComputable, MetricValue::NotComputable),
    };
    sink.record(epoch, "slide_acc", slide_acc)?;
    sink.record(epoch, "slide_auroc", slide_auroc)
}

fn ensure_finite(
    loss: f64,
    epoch: usize,
    batch: usize,
    last_good_checkpoint: &Option<PathBuf>,
) -> Result<(), OptimizerDivergenceError> {
    if loss.is_finite() {
        return Ok(());
    }
    Err(OptimizerDivergenceError {
        epoch,
        batch,
        loss,
        last_good_checkpoint: last_good_checkpoint.clone(),
    })
}

/// ロジット [n, 2] とラベルから正解数を数える（同値は陰性）
fn count_correct(logits: &[f32], labels: &[i64]) -> usize {
    logits
        .chunks_exact(2)
        .zip(labels)
        .filter(|(pair, label)| i64::from(pair[1] > pair[0]) == **label)
        .count()
}
