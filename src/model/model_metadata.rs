//! チェックポイントのメタデータ
//!
//! tar.gz形式でモデルと一緒に保存され、重みを復元する際の
//! モデル設定の再構築に使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;
use crate::types::LabelScheme;

/// チェックポイントのメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 保存時のエポック（0始まり）
    pub epoch: usize,

    /// 保存時の検証精度（タイル単位）
    pub val_accuracy: f64,

    /// スライドごとの選択タイル数
    pub top_k: usize,

    /// モデル入力サイズ（正方形）
    pub tile_size: usize,

    pub num_classes: usize,

    pub dropout: f64,

    /// マニフェスト上のラベル文字列
    pub labels: LabelScheme,

    /// 保存時刻（RFC 3339）
    pub trained_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        epoch: usize,
        val_accuracy: f64,
        top_k: usize,
        model: &ModelConfig,
        labels: LabelScheme,
    ) -> Self {
        Self {
            epoch,
            val_accuracy,
            top_k,
            tile_size: model.image_size,
            num_classes: model.num_classes,
            dropout: model.dropout,
            labels,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 重みを読み込む先のモデル設定
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_num_classes(self.num_classes)
            .with_image_size(self.tile_size)
            .with_dropout(self.dropout)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_roundtrip() {
        let model = ModelConfig::new().with_image_size(64).with_dropout(0.25);
        let metadata = CheckpointMetadata::new(4, 0.8, 2, &model, LabelScheme::default());

        let restored = metadata.model_config();
        assert_eq!(restored.image_size, 64);
        assert_eq!(restored.num_classes, 2);
        assert_eq!(restored.dropout, 0.25);

        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"top_k\": 2"));
        assert_eq!(CheckpointMetadata::from_json_string(&json).unwrap(), metadata);
    }

    #[test]
    fn test_invalid_json() {
        assert!(CheckpointMetadata::from_json_string("{").is_err());
    }
}
