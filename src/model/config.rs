//! 学習設定管理モジュール
//!
//! 計算デバイス、データセット配置、モデル、学習ハイパーパラメータを
//! JSON形式で保存・読み込みします。

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::csv_loader::ManifestColumns;
use crate::ml::dataset::{ImageLayout, ImageLoadPolicy};
use crate::ml::ml_model::MIN_IMAGE_SIZE;
use crate::ml::tile_index::TileIndexOptions;
use crate::ml::ModelConfig;
use crate::types::LabelScheme;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット配置
///
/// マニフェストは `<manifest_dir>/<manifest_pattern>`、タイル画像は
/// `<dataset_root>/<image_dir_pattern>/<class_folder>/` に置かれます。
/// パターン中の `{split}` は分割名（"Train" / "Val"）に置換されます。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub dataset_root: String,
    /// 未指定なら `dataset_root`
    pub manifest_dir: Option<String>,
    pub train_split: String,
    /// 未指定なら評価しない
    pub val_split: Option<String>,
    pub manifest_pattern: String,
    pub image_dir_pattern: String,
    pub columns: ManifestColumns,
    /// 陽性（クラス1）のラベル文字列
    pub positive_label: String,
    /// 陰性（クラス0）のラベル文字列
    pub negative_label: String,
    /// クラス0, クラス1 の画像サブフォルダ
    pub class_folders: [String; 2],
    /// スライドの抽出割合 (0, 1]
    pub subset_rate: Option<f64>,
    pub seed: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            dataset_root: "data".to_string(),
            manifest_dir: None,
            train_split: "Train".to_string(),
            val_split: Some("Val".to_string()),
            manifest_pattern: "CRC_DX_{split}_ALL.csv".to_string(),
            image_dir_pattern: "CRC_DX_{split}".to_string(),
            columns: ManifestColumns::default(),
            positive_label: "MSI".to_string(),
            negative_label: "MSS".to_string(),
            class_folders: ["CRC_DX_MSIMUT".to_string(), "CRC_DX_MSS".to_string()],
            subset_rate: None,
            seed: 2022,
        }
    }
}

impl DataSettings {
    pub fn manifest_path(&self, split: &str) -> PathBuf {
        let dir = self.manifest_dir.as_deref().unwrap_or(&self.dataset_root);
        Path::new(dir).join(self.manifest_pattern.replace("{split}", split))
    }

    pub fn image_dir(&self, split: &str) -> PathBuf {
        Path::new(&self.dataset_root).join(self.image_dir_pattern.replace("{split}", split))
    }

    pub fn layout(&self, split: &str) -> ImageLayout {
        ImageLayout::new(self.image_dir(split), self.class_folders.clone())
    }

    pub fn label_scheme(&self) -> LabelScheme {
        LabelScheme {
            positive: self.positive_label.clone(),
            negative: self.negative_label.clone(),
        }
    }

    pub fn index_options(&self) -> TileIndexOptions {
        TileIndexOptions {
            columns: self.columns.clone(),
            labels: self.label_scheme(),
            subset_rate: self.subset_rate,
            seed: self.seed,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// タイル画像サイズ（正方形）
    pub tile_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            tile_size: 224,
            dropout: 0.5,
        }
    }
}

impl ModelSettings {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_image_size(self.tile_size)
            .with_dropout(self.dropout)
    }
}

/// オプティマイザの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OptimizerKind {
    /// AdamW（重み減衰を分離したAdam）
    Adam,
    /// モーメンタム付きSGD
    Sgd { momentum: f64 },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam
    }
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "AdamW"),
            OptimizerKind::Sgd { momentum } => write!(f, "SGD (momentum {})", momentum),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 画像デコードのワーカー数（0 = 呼び出しスレッド）
    pub num_workers: usize,
    /// 先読みするバッチ数
    pub prefetch_batches: usize,
    pub optimizer: OptimizerKind,
    /// 学習率
    pub learning_rate: f64,
    pub weight_decay: f32,
    /// 学習率を減衰させるエポック
    pub lr_milestones: Vec<usize>,
    pub lr_gamma: f64,
    /// 陽性クラスの損失重み (0, 1)。0.5で均等
    pub positive_class_weight: f32,
    /// 学習パスでタイルをランダムに左右反転する
    pub horizontal_flip: bool,
    /// スライドごとに選ぶタイル数
    pub top_k: usize,
    /// 評価間隔（エポック）
    pub test_every: usize,
    pub image_load_policy: ImageLoadPolicy,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            batch_size: 128,
            num_workers: 0,
            prefetch_batches: 2,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            lr_milestones: vec![50, 100],
            lr_gamma: 0.1,
            positive_class_weight: 0.5,
            horizontal_flip: true,
            top_k: 1,
            test_every: 10,
            image_load_policy: ImageLoadPolicy::Skip,
        }
    }
}

impl TrainingSettings {
    /// 交差エントロピーのクラス重み [陰性, 陽性]
    pub fn class_weights(&self) -> [f32; 2] {
        [1.0 - self.positive_class_weight, self.positive_class_weight]
    }

    /// `epoch`（0始まり）の終わりに評価するか
    pub fn is_evaluation_epoch(&self, epoch: usize) -> bool {
        let completed = epoch + 1;
        completed == self.num_epochs || (self.test_every > 0 && completed % self.test_every == 0)
    }
}

/// 出力先
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// 検証精度が最良のモデルを保存するディレクトリ
    pub checkpoint_dir: Option<String>,
    /// エポックごとの指標を書き出すCSV
    pub metrics_csv: Option<String>,
}

/// 学習設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MilConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub data: DataSettings,
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub output: OutputSettings,
}

impl MilConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: MilConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの形式が不正です: {}", path.display()))?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    info!(path = %path.display(), "設定ファイルを読み込みました");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の範囲を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        if t.num_epochs == 0 {
            bail!("num_epochs は1以上が必要です");
        }
        if t.batch_size == 0 {
            bail!("batch_size は1以上が必要です");
        }
        if t.top_k == 0 {
            bail!("top_k は1以上が必要です");
        }
        if !(t.positive_class_weight > 0.0 && t.positive_class_weight < 1.0) {
            bail!("positive_class_weight は (0, 1) の範囲が必要です: {}", t.positive_class_weight);
        }
        if let OptimizerKind::Sgd { momentum } = t.optimizer {
            if !(0.0..1.0).contains(&momentum) {
                bail!("momentum は [0, 1) の範囲が必要です: {}", momentum);
            }
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            bail!("learning_rate は正の値が必要です: {}", t.learning_rate);
        }
        if self.model.tile_size < MIN_IMAGE_SIZE {
            bail!(
                "tile_size が小さすぎます: {} (最小{}x{}が必要)",
                self.model.tile_size,
                MIN_IMAGE_SIZE,
                MIN_IMAGE_SIZE
            );
        }
        if let Some(rate) = self.data.subset_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                bail!("subset_rate は (0, 1] の範囲が必要です: {}", rate);
            }
        }
        if self.data.positive_label == self.data.negative_label {
            bail!("positive_label と negative_label が同じです: {}", self.data.positive_label);
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== 学習設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- データ ---");
        println!("学習マニフェスト: {}", self.data.manifest_path(&self.data.train_split).display());
        if let Some(ref val) = self.data.val_split {
            println!("検証マニフェスト: {}", self.data.manifest_path(val).display());
        }
        println!(
            "ラベル: 陽性={} 陰性={}",
            self.data.positive_label, self.data.negative_label
        );
        if let Some(rate) = self.data.subset_rate {
            println!("スライド抽出: {} (シード {})", rate, self.data.seed);
        }
        println!("\n--- モデル ---");
        println!("タイルサイズ: {}x{}", self.model.tile_size, self.model.tile_size);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("ワーカー数: {}", self.training.num_workers);
        println!("オプティマイザ: {}", self.training.optimizer);
        println!("学習率: {} (減衰 {:?} x{})", self.training.learning_rate, self.training.lr_milestones, self.training.lr_gamma);
        println!("陽性クラス重み: {}", self.training.positive_class_weight);
        println!("左右反転: {}", self.training.horizontal_flip);
        println!("top-k: {}", self.training.top_k);
        println!("評価間隔: {} エポック", self.training.test_every);

        if let Some(ref dir) = self.output.checkpoint_dir {
            println!("\nチェックポイント: {}", dir);
        }
        if let Some(ref csv) = self.output.metrics_csv {
            println!("指標CSV: {}", csv);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MilConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.num_epochs, 50);
        assert_eq!(config.training.top_k, 1);
        assert_eq!(config.training.class_weights(), [0.5, 0.5]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = MilConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: MilConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.data.class_folders, deserialized.data.class_folders);
        assert_eq!(config.training.lr_milestones, deserialized.training.lr_milestones);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": { "top_k": 3 } }"#;
        let config: MilConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.top_k, 3);
        assert_eq!(config.training.batch_size, 128);
        assert_eq!(config.data.seed, 2022);
        assert_eq!(config.training.optimizer, OptimizerKind::Adam);
        assert!(config.training.horizontal_flip);

        let json = r#"{ "training": { "optimizer": { "Sgd": { "momentum": 0.9 } }, "horizontal_flip": false } }"#;
        let config: MilConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.optimizer, OptimizerKind::Sgd { momentum: 0.9 });
        assert!(!config.training.horizontal_flip);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths() {
        let data = DataSettings {
            dataset_root: "/data".to_string(),
            ..Default::default()
        };
        assert_eq!(data.manifest_path("Train"), PathBuf::from("/data/CRC_DX_Train_ALL.csv"));
        assert_eq!(data.image_dir("Val"), PathBuf::from("/data/CRC_DX_Val"));

        let data = DataSettings {
            manifest_dir: Some("/lists".to_string()),
            ..data
        };
        assert_eq!(data.manifest_path("Val"), PathBuf::from("/lists/CRC_DX_Val_ALL.csv"));
    }

    #[test]
    fn test_evaluation_cadence() {
        let training = TrainingSettings {
            num_epochs: 25,
            test_every: 10,
            ..Default::default()
        };
        let epochs: Vec<usize> = (0..25).filter(|&e| training.is_evaluation_epoch(e)).collect();
        assert_eq!(epochs, vec![9, 19, 24]);

        let training = TrainingSettings {
            num_epochs: 3,
            test_every: 0,
            ..Default::default()
        };
        assert!(!training.is_evaluation_epoch(0));
        assert!(training.is_evaluation_epoch(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MilConfig::default();
        config.training.positive_class_weight = 1.5;
        assert!(config.validate().is_err());

        // 片方のクラス重みが0になる境界も不可
        for w in [0.0, 1.0] {
            let mut config = MilConfig::default();
            config.training.positive_class_weight = w;
            assert!(config.validate().is_err());
        }

        let mut config = MilConfig::default();
        config.training.positive_class_weight = 0.8;
        assert!(config.validate().is_ok());
        assert_eq!(config.training.class_weights(), [1.0 - 0.8, 0.8]);

        let mut config = MilConfig::default();
        config.training.optimizer = OptimizerKind::Sgd { momentum: 1.0 };
        assert!(config.validate().is_err());

        let mut config = MilConfig::default();
        config.model.tile_size = MIN_IMAGE_SIZE - 1;
        assert!(config.validate().is_err());

        let mut config = MilConfig::default();
        config.data.subset_rate = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = MilConfig::default();
        config.training.num_epochs = 7;
        config.save(&path).unwrap();

        let loaded = MilConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 7);
        assert!(MilConfig::load(dir.path().join("missing.json")).is_err());
    }
}
