//! タイル画像のバッチ読み込み
//!
//! データセットのビューは画像パスとラベルのみを返し、画像の読み込みは
//! `TileLoader` がバッチ単位でまとめて行います。

use std::path::PathBuf;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;

use burn::{
    data::dataset::Dataset,
    tensor::{backend::Backend, Int, Tensor},
};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ImageLoadError, MilError, MilResult};
use crate::ml::load_and_normalize_image_with_size;
use crate::types::ClassLabel;

/// 画像読み込み失敗時の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageLoadPolicy {
    /// 警告を出してそのタイルを除外する
    Skip,
    /// パス全体を中断する
    Abort,
}

impl Default for ImageLoadPolicy {
    fn default() -> Self {
        ImageLoadPolicy::Skip
    }
}

/// タイル画像の配置
///
/// `<root>/<class_folder>/blk-<tile_id>-<slide_id>.png`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub root: PathBuf,
    /// クラス0, クラス1 のサブフォルダ名
    pub class_folders: [String; 2],
}

impl ImageLayout {
    pub fn new(root: impl Into<PathBuf>, class_folders: [String; 2]) -> Self {
        Self {
            root: root.into(),
            class_folders,
        }
    }

    pub fn tile_path(&self, slide_id: &str, tile_id: &str, label: ClassLabel) -> PathBuf {
        self.root
            .join(&self.class_folders[label.index()])
            .join(format!("blk-{}-{}.png", tile_id, slide_id))
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileItem {
    /// ビュー内での位置
    pub position: usize,
    /// フラットなタイル配列上の位置
    pub flat_index: usize,
    pub slide_index: usize,
    pub tile_id: String,
    pub label: ClassLabel,
    pub path: PathBuf,
}

/// CPUメモリ上のバッチ
#[derive(Debug, Clone, Default)]
pub struct HostBatch {
    pub pixels: Vec<f32>,
    pub labels: Vec<i64>,
    /// 読み込めたタイルのビュー内位置（入力順）
    pub positions: Vec<usize>,
    /// 読み込みに失敗して除外したタイルのビュー内位置
    pub skipped: Vec<usize>,
    pub tile_size: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// タイルごとに確率1/2で左右反転する
    ///
    /// 反転したタイル数を返します。
    pub fn random_horizontal_flip<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let tile_len = 3 * self.tile_size * self.tile_size;
        if tile_len == 0 {
            return 0;
        }
        let mut flipped = 0;
        for tile in self.pixels.chunks_exact_mut(tile_len) {
            if rng.gen_bool(0.5) {
                flip_horizontal(tile, self.tile_size);
                flipped += 1;
            }
        }
        flipped
    }

    /// 1回の転送でバッチ全体をデバイスへ
    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> TileBatch<B> {
        let batch_size = self.len();
        let images = Tensor::<B, 1>::from_floats(self.pixels.as_slice(), device).reshape([
            batch_size,
            3,
            self.tile_size,
            self.tile_size,
        ]);
        let targets = Tensor::<B, 1, Int>::from_ints(self.labels.as_slice(), device);

        TileBatch {
            images,
            targets,
            positions: self.positions,
        }
    }
}

/// (C, H, W) で平坦化されたタイルを左右反転
pub fn flip_horizontal(tile: &mut [f32], tile_size: usize) {
    if tile_size == 0 {
        return;
    }
    for row in tile.chunks_exact_mut(tile_size) {
        row.reverse();
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct TileBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub positions: Vec<usize>,
}

/// バッチ単位の画像ローダー
///
/// `num_workers > 0` の場合は専用のスレッドプールで並列に読み込みます。
/// 結果は常に入力順に並びます。
#[derive(Clone)]
pub struct TileLoader {
    tile_size: usize,
    policy: ImageLoadPolicy,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl TileLoader {
    pub fn new(tile_size: usize, num_workers: usize, policy: ImageLoadPolicy) -> MilResult<Self> {
        let pool = if num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|i| format!("tile-loader-{i}"))
                .build()
                .map_err(|e| MilError::WorkerPool(e.to_string()))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            tile_size,
            policy,
            pool,
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn policy(&self) -> ImageLoadPolicy {
        self.policy
    }

    fn read_all(&self, items: &[TileItem]) -> Vec<Result<Vec<f32>, ImageLoadError>> {
        let read = |item: &TileItem| load_and_normalize_image_with_size(&item.path, self.tile_size);
        match &self.pool {
            Some(pool) => pool.install(|| items.par_iter().map(read).collect()),
            None => items.iter().map(read).collect(),
        }
    }

    /// アイテムの画像を読み込んでバッチを作る
    pub fn load(&self, items: Vec<TileItem>) -> MilResult<HostBatch> {
        let results = self.read_all(&items);

        let mut batch = HostBatch {
            pixels: Vec::with_capacity(items.len() * 3 * self.tile_size * self.tile_size),
            labels: Vec::with_capacity(items.len()),
            positions: Vec::with_capacity(items.len()),
            skipped: Vec::new(),
            tile_size: self.tile_size,
        };

        for (item, result) in items.into_iter().zip(results) {
            match result {
                Ok(image_data) => {
                    batch.pixels.extend_from_slice(&image_data);
                    batch.labels.push(item.label.index() as i64);
                    batch.positions.push(item.position);
                }
                Err(e) => match self.policy {
                    ImageLoadPolicy::Skip => {
                        warn!(
                            slide_index = item.slide_index,
                            tile_id = %item.tile_id,
                            error = %e,
                            "タイル画像の読み込みに失敗したためスキップします"
                        );
                        batch.skipped.push(item.position);
                    }
                    ImageLoadPolicy::Abort => return Err(e.into()),
                },
            }
        }

        Ok(batch)
    }
}

/// 1回のデータセット走査の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub batches: usize,
    pub tiles: usize,
    pub skipped: Vec<usize>,
}

/// データセットを先頭から順にバッチ化して `consume` に渡す
///
/// 読み込みは別スレッドで最大 `prefetch` バッチ先行します。バッチの順序は
/// 入力順のまま保たれ、`consume` がエラーを返すと読み込みも停止します。
pub fn for_each_batch<D, F>(
    dataset: &D,
    batch_size: usize,
    prefetch: usize,
    loader: &TileLoader,
    mut consume: F,
) -> MilResult<PassStats>
where
    D: Dataset<TileItem>,
    F: FnMut(HostBatch) -> MilResult<()>,
{
    let batch_size = batch_size.max(1);

    std::thread::scope(|scope| {
        let (tx, rx) = sync_channel::<MilResult<HostBatch>>(prefetch.max(1));

        scope.spawn(move || {
            let len = dataset.len();
            let mut start = 0;
            while start < len {
                let end = (start + batch_size).min(len);
                let items: Vec<TileItem> = (start..end).filter_map(|i| dataset.get(i)).collect();
                let batch = loader.load(items);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
                start = end;
            }
        });

        let mut stats = PassStats::default();
        for batch in rx {
            let batch = batch?;
            stats.batches += 1;
            stats.tiles += batch.len();
            stats.skipped.extend_from_slice(&batch.skipped);
            if batch.is_empty() {
                continue;
            }
            consume(batch)?;
        }
        Ok(stats)
    })
}

/// テスト用: 指定色のタイル画像を書き出す
#[cfg(test)]
pub(crate) fn write_tile(path: &std::path::Path, size: u32, value: u8) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image::RgbImage::from_pixel(size, size, image::Rgb([value, value, value]))
        .save(path)
        .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::Path;

    struct VecDataset(Vec<TileItem>);

    impl Dataset<TileItem> for VecDataset {
        fn get(&self, index: usize) -> Option<TileItem> {
            self.0.get(index).cloned()
        }

        fn len(&self) -> usize {
            self.0.len()
        }
    }

    fn items(dir: &Path, count: usize, broken: &[usize]) -> Vec<TileItem> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("tile_{i}.png"));
                if !broken.contains(&i) {
                    write_tile(&path, 4, (i * 10) as u8);
                }
                TileItem {
                    position: i,
                    flat_index: i,
                    slide_index: 0,
                    tile_id: i.to_string(),
                    label: ClassLabel::Positive,
                    path,
                }
            })
            .collect()
    }

    #[test]
    fn test_tile_path_layout() {
        let layout = ImageLayout::new(
            "/data/CRC_DX_Train",
            ["CRC_DX_MSIMUT".to_string(), "CRC_DX_MSS".to_string()],
        );
        assert_eq!(
            layout.tile_path("P7", "12", ClassLabel::Positive),
            PathBuf::from("/data/CRC_DX_Train/CRC_DX_MSS/blk-12-P7.png")
        );
        assert_eq!(
            layout.tile_path("P7", "12", ClassLabel::Negative),
            PathBuf::from("/data/CRC_DX_Train/CRC_DX_MSIMUT/blk-12-P7.png")
        );
    }

    #[test]
    fn test_batches_preserve_order_with_workers() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = VecDataset(items(dir.path(), 7, &[]));
        let loader = TileLoader::new(4, 3, ImageLoadPolicy::Abort).unwrap();

        let mut seen = Vec::new();
        let stats = for_each_batch(&dataset, 3, 2, &loader, |batch| {
            assert_eq!(batch.pixels.len(), batch.len() * 3 * 16);
            seen.extend(batch.positions);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.tiles, 7);
        assert!(stats.skipped.is_empty());
    }

    #[test]
    fn test_skip_policy_drops_broken_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = VecDataset(items(dir.path(), 5, &[1, 4]));
        let loader = TileLoader::new(4, 0, ImageLoadPolicy::Skip).unwrap();

        let mut seen = Vec::new();
        let stats = for_each_batch(&dataset, 2, 1, &loader, |batch| {
            seen.extend(batch.positions);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec![0, 2, 3]);
        assert_eq!(stats.skipped, vec![1, 4]);
    }

    #[test]
    fn test_abort_policy_fails_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = VecDataset(items(dir.path(), 4, &[2]));
        let loader = TileLoader::new(4, 0, ImageLoadPolicy::Abort).unwrap();

        let result = for_each_batch(&dataset, 1, 1, &loader, |_| Ok(()));
        assert!(matches!(result, Err(MilError::ImageLoad(_))));
    }

    #[test]
    fn test_consumer_error_stops_pass() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = VecDataset(items(dir.path(), 6, &[]));
        let loader = TileLoader::new(4, 0, ImageLoadPolicy::Abort).unwrap();

        let mut calls = 0;
        let result = for_each_batch(&dataset, 1, 1, &loader, |_| {
            calls += 1;
            Err(MilError::TensorData("stop".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_flip_horizontal_mirrors_each_row() {
        // 3チャネル x 2x2
        let mut tile: Vec<f32> = (0..12).map(|v| v as f32).collect();
        flip_horizontal(&mut tile, 2);
        assert_eq!(
            tile,
            vec![1.0, 0.0, 3.0, 2.0, 5.0, 4.0, 7.0, 6.0, 9.0, 8.0, 11.0, 10.0]
        );
    }

    #[test]
    fn test_random_flip_yields_original_or_mirror() {
        let tile_size = 3;
        let tile_len = 3 * tile_size * tile_size;
        let original: Vec<f32> = (0..tile_len * 16).map(|v| v as f32).collect();
        let mut batch = HostBatch {
            pixels: original.clone(),
            labels: vec![0; 16],
            positions: (0..16).collect(),
            skipped: Vec::new(),
            tile_size,
        };

        let flipped = batch.random_horizontal_flip(&mut StdRng::seed_from_u64(7));
        assert_eq!(batch.pixels.len(), original.len());

        let mut mirrored = 0;
        for (after, before) in batch.pixels.chunks(tile_len).zip(original.chunks(tile_len)) {
            let mut mirror = before.to_vec();
            flip_horizontal(&mut mirror, tile_size);
            if after == before {
                continue;
            }
            assert_eq!(after, mirror.as_slice());
            mirrored += 1;
        }
        assert_eq!(mirrored, flipped);
        assert!(flipped > 0 && flipped < 16);
    }
}
