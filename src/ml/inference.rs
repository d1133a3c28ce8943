//! タイル単位の推論
//!
//! 全タイルに分類器を適用し、陽性クラスの確率をタイルのフラット位置に揃えて返します。
//! 自動微分を持たないバックエンド上で実行するため勾配は記録されず、
//! Dropoutも無効になります（学習中のモデルは `valid()` で渡します）。

use burn::{
    data::dataset::Dataset,
    tensor::{activation::softmax, backend::Backend},
};
use tracing::{debug, info};

use crate::error::{MilError, MilResult};
use crate::ml::dataset::{for_each_batch, TileItem, TileLoader};
use crate::ml::TileClassifier;

/// 読み込めなかったタイルの確率（選択で常に最下位になる）
pub const SKIPPED_PROBABILITY: f32 = f32::NEG_INFINITY;

/// 推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// 入力順に並んだ陽性クラスの確率
    pub probabilities: Vec<f32>,
    /// 画像を読み込めなかった位置（昇順）
    pub skipped: Vec<usize>,
}

impl InferenceOutput {
    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// 推論できた (位置, 確率) の組
    pub fn scored(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.probabilities
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.skipped.binary_search(i).is_err())
            .map(|(i, &p)| (i, p))
    }
}

/// 推論ランナー
pub struct InferenceRunner {
    loader: TileLoader,
    batch_size: usize,
    prefetch: usize,
}

impl InferenceRunner {
    pub fn new(loader: TileLoader, batch_size: usize, prefetch: usize) -> Self {
        Self {
            loader,
            batch_size,
            prefetch,
        }
    }

    pub fn loader(&self) -> &TileLoader {
        &self.loader
    }

    /// データセット全体を推論
    ///
    /// 出力ベクトルはデータセット長で確保し、各バッチの結果を
    /// アイテムのビュー内位置へ書き込むため、入力順が保たれます。
    pub fn run<B, C, D>(&self, classifier: &C, dataset: &D, device: &B::Device) -> MilResult<InferenceOutput>
    where
        B: Backend,
        C: TileClassifier<B>,
        D: Dataset<TileItem>,
    {
        let len = dataset.len();
        let mut probabilities = vec![SKIPPED_PROBABILITY; len];

        let stats = for_each_batch(dataset, self.batch_size, self.prefetch, &self.loader, |batch| {
            let batch = batch.into_tensors::<B>(device);
            let logits = classifier.logits(batch.images);
            let values = softmax(logits, 1)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| MilError::TensorData(format!("{:?}", e)))?;

            for (&position, pair) in batch.positions.iter().zip(values.chunks_exact(2)) {
                probabilities[position] = pair[1];
            }
            debug!(batch_len = batch.positions.len(), "推論バッチ完了");
            Ok(())
        })?;

        let mut skipped = stats.skipped;
        skipped.sort_unstable();

        info!(tiles = len, batches = stats.batches, skipped = skipped.len(), "推論パス完了");

        Ok(InferenceOutput {
            probabilities,
            skipped,
        })
    }
}
