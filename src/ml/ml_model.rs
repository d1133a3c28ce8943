//! 機械学習モデルの共通定義
//!
//! タイル分類器の境界（`TileClassifier`）と、デフォルトで使用する小型CNNを提供します。
//! 学習ループは `TileClassifier` を実装する任意のモジュールで動作します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{CrossEntropyLoss, CrossEntropyLossConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::debug;

use crate::error::{ImageLoadError, MilError, MilResult};

/// クラス数（陰性 / 陽性）
pub const NUM_CLASSES: usize = 2;

/// 入力画像の最小サイズ
pub const MIN_IMAGE_SIZE: usize = 18;

/// ImageNetの平均と標準偏差
const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 画像バッチ → 2クラスのロジット
///
/// 分類器のアーキテクチャや重みの保存形式には関与しません。
pub trait TileClassifier<B: Backend> {
    /// - `images`: [batch_size, 3, size, size]
    /// - 戻り値: [batch_size, 2]
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// 順伝播と損失計算（学習用）
    fn classify(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        loss: &CrossEntropyLoss<B>,
    ) -> ClassificationOutput<B> {
        let output = self.logits(images);
        let loss = loss.forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// クラス重み付きの交差エントロピー
///
/// - `class_weights`: [陰性の重み, 陽性の重み]。どちらも正の有限値が必要です。
pub fn weighted_cross_entropy<B: Backend>(
    class_weights: [f32; 2],
    device: &B::Device,
) -> MilResult<CrossEntropyLoss<B>> {
    if !class_weights.iter().all(|w| w.is_finite() && *w > 0.0) {
        return Err(MilError::InvalidClassWeights(class_weights));
    }
    Ok(CrossEntropyLossConfig::new()
        .with_weights(Some(class_weights.to_vec()))
        .init(device))
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = 2)]
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 畳み込み3層後の特徴マップサイズ
    pub fn feature_map_size(&self) -> usize {
        // Conv (3x3, no padding): size -> size - 2
        // Pool (2x2): size -> size / 2
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        let after_pool2 = after_conv2 / 2;
        after_pool2.saturating_sub(2)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MilClassifier<B> {
        let feature_map_size = self.feature_map_size();
        if feature_map_size == 0 {
            panic!(
                "入力サイズが小さすぎます: {} (最小{}x{}が必要)",
                self.image_size, MIN_IMAGE_SIZE, MIN_IMAGE_SIZE
            );
        }

        debug!(
            image_size = self.image_size,
            feature_map_size,
            num_classes = self.num_classes,
            dropout = self.dropout,
            "[Model] 初期化"
        );

        MilClassifier {
            conv1: Conv2dConfig::new([3, 32], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3])
                .with_stride([1, 1])
                .init(device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(128, 64).init(device),
            fc2: LinearConfig::new(64, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// タイル分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 + ReLU + MaxPool 2x2} x 2
/// - Conv 3x3 + ReLU
/// - Global Average Pooling -> 128次元
/// - Dropout, FC: 128 -> 64 + ReLU, FC: 64 -> num_classes
///
/// Dropoutは自動微分バックエンド上でのみ有効になるため、
/// `valid()` で得た推論用モジュールは評価モードとして動作します。
#[derive(Module, Debug)]
pub struct MilClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc1: Linear<B>, // 128 -> 64
    fc2: Linear<B>, // 64 -> num_classes
    activation: Relu,
}

impl<B: Backend> MilClassifier<B> {
    /// 順伝播
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        // [batch, 128, 1, 1] -> [batch, 128]
        let x = self.global_pool.forward(x);
        let [_, c, _, _] = x.dims();
        let x = x.reshape([batch_size, c]);

        let x = self.dropout.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }
}

impl<B: Backend> TileClassifier<B> for MilClassifier<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

/// 画像を読み込んで正規化（サイズ指定版）
///
/// ImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化して返します。
pub fn load_and_normalize_image_with_size(
    path: &std::path::Path,
    expected_size: usize,
) -> Result<Vec<f32>, ImageLoadError> {
    let img = image::open(path)
        .map_err(|source| ImageLoadError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (width, height) = img.dimensions();

    if width != expected_size as u32 || height != expected_size as u32 {
        return Err(ImageLoadError::Size {
            path: path.to_path_buf(),
            width,
            height,
            expected: expected_size,
        });
    }

    let mut data = Vec::with_capacity(3 * expected_size * expected_size);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - IMAGE_MEAN[channel]) / IMAGE_STD[channel]);
            }
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_feature_map_size() {
        let config = ModelConfig::new().with_image_size(MIN_IMAGE_SIZE);
        assert_eq!(config.feature_map_size(), 1);
        let config = ModelConfig::new().with_image_size(MIN_IMAGE_SIZE - 1);
        assert_eq!(config.feature_map_size(), 0);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_image_size(24)
            .init::<NdArray>(&device);

        let images = Tensor::<NdArray, 4>::zeros([3, 3, 24, 24], &device);
        let logits = model.logits(images);
        assert_eq!(logits.dims(), [3, NUM_CLASSES]);
    }

    #[test]
    fn test_weighted_cross_entropy_rejects_non_positive_weights() {
        let device = Default::default();
        assert!(matches!(
            weighted_cross_entropy::<NdArray>([1.0, 0.0], &device),
            Err(MilError::InvalidClassWeights(w)) if w == [1.0, 0.0]
        ));
        assert!(weighted_cross_entropy::<NdArray>([0.0, 1.0], &device).is_err());
        assert!(weighted_cross_entropy::<NdArray>([f32::NAN, 0.5], &device).is_err());
    }

    #[test]
    fn test_weighted_loss() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_image_size(MIN_IMAGE_SIZE)
            .init::<NdArray>(&device);
        let weighted = weighted_cross_entropy::<NdArray>([0.2, 0.8], &device).unwrap();
        let uniform = weighted_cross_entropy::<NdArray>([0.5, 0.5], &device).unwrap();

        let images = Tensor::<NdArray, 4>::ones([2, 3, MIN_IMAGE_SIZE, MIN_IMAGE_SIZE], &device);
        let targets = Tensor::<NdArray, 1, Int>::from_ints([0, 0], &device);
        let output = model.classify(images.clone(), targets.clone(), &weighted);
        assert_eq!(output.output.dims(), [2, NUM_CLASSES]);

        let loss: f32 = output.loss.into_scalar();
        assert!(loss.is_finite() && loss >= 0.0);

        // 単一クラスのバッチでは重みは正規化で打ち消される
        let reference: f32 = model.classify(images, targets, &uniform).loss.into_scalar();
        assert!((loss - reference).abs() < 1e-5);
    }

    #[test]
    fn test_load_and_normalize_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let data = load_and_normalize_image_with_size(&path, 4).unwrap();
        assert_eq!(data.len(), 3 * 4 * 4);
        let expected_red = (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0];
        assert!((data[0] - expected_red).abs() < 1e-5);

        let err = load_and_normalize_image_with_size(&path, 8).unwrap_err();
        assert!(matches!(err, ImageLoadError::Size { width: 4, height: 4, expected: 8, .. }));

        let missing = load_and_normalize_image_with_size(&dir.path().join("none.png"), 4);
        assert!(matches!(missing, Err(ImageLoadError::Decode { .. })));
    }
}
