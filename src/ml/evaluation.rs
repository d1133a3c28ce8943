//! 検証データでの評価
//!
//! 陽性確率を0.5で閾値処理して正解率・誤り率・偽陽性率・偽陰性率を計算し、
//! 確率そのものからAUROCを計算します。分母がゼロになる指標は
//! `MetricValue::NotComputable` として報告し、学習は継続します。

use burn::tensor::backend::Backend;
use tracing::{info, warn};

use crate::error::{DegenerateBatchError, MilError, MilResult};
use crate::ml::inference::InferenceRunner;
use crate::ml::tile_index::TileIndex;
use crate::ml::top_k::slide_max_probability;
use crate::ml::TileClassifier;
use crate::types::ClassLabel;

/// 陽性と判定する確率の閾値
pub const DECISION_THRESHOLD: f32 = 0.5;

/// 計算できない場合を明示する指標値
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    NotComputable,
}

impl MetricValue {
    pub fn value(self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(v),
            MetricValue::NotComputable => None,
        }
    }

    fn reported(metric: &str, result: Result<f64, DegenerateBatchError>) -> Self {
        match result {
            Ok(v) => MetricValue::Scalar(v),
            Err(e) => {
                warn!(metric, error = %e, "評価指標を計算できません");
                MetricValue::NotComputable
            }
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Scalar(v) => write!(f, "{:.4}", v),
            MetricValue::NotComputable => write!(f, "n/a"),
        }
    }
}

/// 混同行列ベースの指標
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub error: f64,
    pub false_positive_rate: MetricValue,
    pub false_negative_rate: MetricValue,
    pub auroc: MetricValue,
    pub positives: usize,
    pub negatives: usize,
}

impl ClassificationMetrics {
    /// 確率とラベルから計算
    pub fn from_probabilities(
        probabilities: &[f32],
        labels: &[ClassLabel],
    ) -> Result<Self, DegenerateBatchError> {
        let predictions = threshold(probabilities);
        let (accuracy, error) = accuracy_and_error(&predictions, labels)?;
        let positives = labels.iter().filter(|&&l| l == ClassLabel::Positive).count();

        Ok(Self {
            accuracy,
            error,
            false_positive_rate: MetricValue::reported("fpr", false_positive_rate(&predictions, labels)),
            false_negative_rate: MetricValue::reported("fnr", false_negative_rate(&predictions, labels)),
            auroc: MetricValue::reported("auroc_score", auroc(probabilities, labels)),
            positives,
            negatives: labels.len() - positives,
        })
    }
}

impl std::fmt::Display for ClassificationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc={:.4} err={:.4} fpr={} fnr={} auroc={} (pos={} neg={})",
            self.accuracy,
            self.error,
            self.false_positive_rate,
            self.false_negative_rate,
            self.auroc,
            self.positives,
            self.negatives,
        )
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    /// タイル単位
    pub tiles: ClassificationMetrics,
    /// スライド単位（タイル確率の最大値で判定）
    pub slides: Option<ClassificationMetrics>,
    /// 画像を読み込めず評価から除外したタイル数
    pub skipped: usize,
}

pub fn threshold(probabilities: &[f32]) -> Vec<ClassLabel> {
    probabilities
        .iter()
        .map(|&p| {
            if p >= DECISION_THRESHOLD {
                ClassLabel::Positive
            } else {
                ClassLabel::Negative
            }
        })
        .collect()
}

pub fn accuracy_and_error(
    predictions: &[ClassLabel],
    labels: &[ClassLabel],
) -> Result<(f64, f64), DegenerateBatchError> {
    if labels.is_empty() {
        return Err(DegenerateBatchError::Empty);
    }
    let n = labels.len() as f64;
    let correct = predictions.iter().zip(labels).filter(|(p, r)| p == r).count();
    let wrong = labels.len() - correct;
    Ok((correct as f64 / n, wrong as f64 / n))
}

/// 偽陽性数 / 実際の陰性数
pub fn false_positive_rate(
    predictions: &[ClassLabel],
    labels: &[ClassLabel],
) -> Result<f64, DegenerateBatchError> {
    rate_within(predictions, labels, ClassLabel::Negative).ok_or(DegenerateBatchError::NoNegatives)
}

/// 偽陰性数 / 実際の陽性数
pub fn false_negative_rate(
    predictions: &[ClassLabel],
    labels: &[ClassLabel],
) -> Result<f64, DegenerateBatchError> {
    rate_within(predictions, labels, ClassLabel::Positive).ok_or(DegenerateBatchError::NoPositives)
}

/// `actual` クラスのうち誤判定された割合
fn rate_within(predictions: &[ClassLabel], labels: &[ClassLabel], actual: ClassLabel) -> Option<f64> {
    let (total, wrong) = predictions
        .iter()
        .zip(labels)
        .filter(|(_, r)| **r == actual)
        .fold((0usize, 0usize), |(total, wrong), (p, r)| {
            (total + 1, wrong + usize::from(p != r))
        });
    (total > 0).then(|| wrong as f64 / total as f64)
}

/// ROC曲線下面積（同順位は平均順位で扱う）
pub fn auroc(probabilities: &[f32], labels: &[ClassLabel]) -> Result<f64, DegenerateBatchError> {
    let positives = labels.iter().filter(|&&l| l == ClassLabel::Positive).count();
    let negatives = labels.len() - positives;
    if labels.is_empty() {
        return Err(DegenerateBatchError::Empty);
    }
    if positives == 0 {
        return Err(DegenerateBatchError::NoPositives);
    }
    if negatives == 0 {
        return Err(DegenerateBatchError::NoNegatives);
    }

    let mut pairs: Vec<(f32, ClassLabel)> = probabilities.iter().copied().zip(labels.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positive_rank_sum = 0.0f64;
    let mut start = 0;
    while start < pairs.len() {
        let mut end = start + 1;
        while end < pairs.len() && pairs[end].0 == pairs[start].0 {
            end += 1;
        }
        // 1始まりの順位 start+1 ..= end の平均
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = pairs[start..end]
            .iter()
            .filter(|(_, l)| *l == ClassLabel::Positive)
            .count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// 検証データ全体を評価
pub fn evaluate<B, C>(
    classifier: &C,
    index: &TileIndex,
    runner: &InferenceRunner,
    device: &B::Device,
) -> MilResult<EvaluationReport>
where
    B: Backend,
    C: TileClassifier<B>,
{
    let output = runner.run::<B, C, _>(classifier, &index.full_enumeration(), device)?;

    let slide_index = index.slide_index_per_tile();
    let mut probabilities = Vec::with_capacity(output.len());
    let mut labels = Vec::with_capacity(output.len());
    let mut slides = Vec::with_capacity(output.len());
    for (i, p) in output.scored() {
        probabilities.push(p);
        labels.push(index.tile_label(i));
        slides.push(slide_index[i]);
    }

    let tiles = ClassificationMetrics::from_probabilities(&probabilities, &labels)
        .map_err(MilError::Degenerate)?;

    let slide_labels = index.slide_labels();
    let (slide_probs, slide_truth): (Vec<f32>, Vec<ClassLabel>) =
        slide_max_probability(&slides, &probabilities, index.num_slides())?
            .into_iter()
            .zip(slide_labels)
            .filter_map(|(p, label)| p.map(|p| (p, label)))
            .unzip();
    let slides = ClassificationMetrics::from_probabilities(&slide_probs, &slide_truth).ok();

    info!(tiles = %tiles, "タイル単位の評価");
    if let Some(slides) = &slides {
        info!(slides = %slides, "スライド単位の評価");
    }

    Ok(EvaluationReport {
        tiles,
        slides,
        skipped: output.skipped.len(),
    })
}
