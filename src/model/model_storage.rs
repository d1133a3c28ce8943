//! チェックポイントの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（エポック、検証精度、モデル設定など）
//! - model.bin       - モデルの重み（バイナリ、f32精度）

use anyhow::{anyhow, Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::info;

use crate::ml::MilClassifier;
use crate::model::model_metadata::CheckpointMetadata;

/// 検証精度が最良のチェックポイントのファイル名
pub const BEST_CHECKPOINT_NAME: &str = "best.tar.gz";

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルの重みをTar.gz形式で保存
///
/// 拡張子が `.gz` でなければ `.tar.gz` を付けます。保存先のパスを返します。
pub fn save_checkpoint(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, "metadata.json", json_str.as_bytes())?;
    append_entry(&mut tar_builder, "model.bin", model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

/// Tar.gzからメタデータとモデルバイナリを読み込む
pub fn load_checkpoint(tar_gz_path: &Path) -> Result<(CheckpointMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<CheckpointMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some("metadata.json") => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(CheckpointMetadata::from_json_string(&json_str)?);
            }
            Some("model.bin") => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// Tar.gzからメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<CheckpointMetadata> {
    load_checkpoint(tar_gz_path).map(|(metadata, _)| metadata)
}

/// モデルの重みをバイト列に変換（f32精度）
pub fn encode_model<B: Backend, M: Module<B>>(model: M) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.into_record(), ())
        .map_err(|e| anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// チェックポイントから分類器を復元
pub fn load_classifier<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(CheckpointMetadata, MilClassifier<B>)> {
    let (metadata, model_binary) = load_checkpoint(tar_gz_path)?;

    let model = metadata.model_config().init::<B>(device);
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(model_binary, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((metadata, model.load_record(record)))
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &CheckpointMetadata) {
    info!(
        epoch = metadata.epoch,
        val_accuracy = metadata.val_accuracy,
        top_k = metadata.top_k,
        tile_size = metadata.tile_size,
        positive = %metadata.labels.positive,
        negative = %metadata.labels.negative,
        trained_at = %metadata.trained_at,
        "チェックポイント"
    );
}
