//! スライド → タイルの索引
//!
//! マニフェストを読み込み、フラットなタイル配列と、それと同じ長さの
//! スライド番号配列を構築します。推論時は全タイル、学習時は選択済みの
//! サブセットを列挙する2種類のビューを提供します。

use std::collections::HashSet;
use std::path::Path;

use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::csv_loader::{load_manifest, ManifestColumns, ManifestRow};
use crate::error::{DataLoadError, MilError, MilResult};
use crate::ml::dataset::{ImageLayout, TileItem};
use crate::types::{ClassLabel, LabelScheme, Slide, TrainingTriple};

/// 列挙モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationMode {
    /// 全タイル（推論用）
    AllTiles,
    /// 選択済みサブセット（学習用）
    SelectedSubset,
}

/// マニフェスト読み込みのオプション
#[derive(Debug, Clone)]
pub struct TileIndexOptions {
    pub columns: ManifestColumns,
    pub labels: LabelScheme,
    /// スライドをこの割合だけ抽出する
    pub subset_rate: Option<f64>,
    /// スライド抽出用のシード
    pub seed: u64,
}

impl Default for TileIndexOptions {
    fn default() -> Self {
        Self {
            columns: ManifestColumns::default(),
            labels: LabelScheme::default(),
            subset_rate: None,
            seed: 2022,
        }
    }
}

pub struct TileIndex {
    slides: Vec<Slide>,
    tile_ids: Vec<String>,
    slide_index: Vec<usize>,
    layout: ImageLayout,
    subset: Vec<TrainingTriple>,
}

impl TileIndex {
    /// マニフェストファイルから索引を構築
    pub fn load(
        manifest_path: &Path,
        layout: ImageLayout,
        options: &TileIndexOptions,
    ) -> Result<Self, DataLoadError> {
        let rows = load_manifest(manifest_path, &options.columns, &options.labels)?;
        let index = Self::from_rows(rows, layout, options.subset_rate, options.seed)?;

        info!(
            manifest = %manifest_path.display(),
            slides = index.num_slides(),
            tiles = index.num_tiles(),
            "タイル索引を読み込みました"
        );
        Ok(index)
    }

    /// 読み込み済みの行から索引を構築
    ///
    /// スライドIDで安定ソートするため、同一スライド内のタイル順はマニフェスト順のままです。
    pub fn from_rows(
        mut rows: Vec<ManifestRow>,
        layout: ImageLayout,
        subset_rate: Option<f64>,
        seed: u64,
    ) -> Result<Self, DataLoadError> {
        if let Some(rate) = subset_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(DataLoadError::InvalidSubsetRate(rate));
            }
            rows = sample_slides(rows, rate, seed);
        }

        rows.sort_by(|a, b| a.slide_id.cmp(&b.slide_id));

        let mut slides: Vec<Slide> = Vec::new();
        let mut tile_ids = Vec::with_capacity(rows.len());
        let mut slide_index = Vec::with_capacity(rows.len());

        for (flat, row) in rows.into_iter().enumerate() {
            match slides.last_mut() {
                Some(slide) if slide.slide_id == row.slide_id => {
                    if slide.label != row.label {
                        return Err(DataLoadError::ConflictingLabel {
                            slide_id: row.slide_id,
                        });
                    }
                    slide.tiles.end = flat + 1;
                }
                _ => slides.push(Slide {
                    slide_id: row.slide_id,
                    label: row.label,
                    tiles: flat..flat + 1,
                }),
            }
            slide_index.push(slides.len() - 1);
            tile_ids.push(row.tile_id);
        }

        Ok(Self {
            slides,
            tile_ids,
            slide_index,
            layout,
            subset: Vec::new(),
        })
    }

    pub fn num_slides(&self) -> usize {
        self.slides.len()
    }

    pub fn num_tiles(&self) -> usize {
        self.tile_ids.len()
    }

    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    pub fn slide_ids(&self) -> impl Iterator<Item = &str> {
        self.slides.iter().map(|s| s.slide_id.as_str())
    }

    /// スライドごとのラベル
    pub fn slide_labels(&self) -> Vec<ClassLabel> {
        self.slides.iter().map(|s| s.label).collect()
    }

    pub fn tile_ids(&self) -> &[String] {
        &self.tile_ids
    }

    /// フラットなタイル位置 → スライド番号
    pub fn slide_index_per_tile(&self) -> &[usize] {
        &self.slide_index
    }

    pub fn tile_label(&self, flat_index: usize) -> ClassLabel {
        self.slides[self.slide_index[flat_index]].label
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// 選択されたフラット位置から学習用サブセットを作る
    pub fn build_subset(&mut self, selected: &[usize]) -> MilResult<()> {
        let len = self.num_tiles();
        let mut subset = Vec::with_capacity(selected.len());
        for &index in selected {
            if index >= len {
                return Err(MilError::IndexOutOfRange { index, len });
            }
            let slide_index = self.slide_index[index];
            subset.push(TrainingTriple {
                flat_index: index,
                slide_index,
                tile_id: self.tile_ids[index].clone(),
                label: self.slides[slide_index].label,
            });
        }
        self.subset = subset;
        Ok(())
    }

    /// サブセットを並べ替える（毎回新しい乱数）
    pub fn shuffle_subset(&mut self) {
        self.shuffle_subset_with(&mut rand::thread_rng());
    }

    pub fn shuffle_subset_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.subset.shuffle(rng);
    }

    pub fn subset(&self) -> &[TrainingTriple] {
        &self.subset
    }

    /// モードに応じたビュー
    pub fn view(&self, mode: EnumerationMode) -> TileView<'_> {
        match mode {
            EnumerationMode::AllTiles => TileView::Full(self.full_enumeration()),
            EnumerationMode::SelectedSubset => TileView::Selected(self.selected_enumeration()),
        }
    }

    pub fn full_enumeration(&self) -> FullEnumeration<'_> {
        FullEnumeration { index: self }
    }

    pub fn selected_enumeration(&self) -> SelectedEnumeration<'_> {
        SelectedEnumeration { index: self }
    }

    fn item(&self, position: usize, flat_index: usize) -> TileItem {
        let slide_index = self.slide_index[flat_index];
        let slide = &self.slides[slide_index];
        let tile_id = &self.tile_ids[flat_index];
        TileItem {
            position,
            flat_index,
            slide_index,
            tile_id: tile_id.clone(),
            label: slide.label,
            path: self.layout.tile_path(&slide.slide_id, tile_id, slide.label),
        }
    }
}

/// スライド単位で決定的に抽出
fn sample_slides(rows: Vec<ManifestRow>, rate: f64, seed: u64) -> Vec<ManifestRow> {
    let mut slide_ids: Vec<&str> = rows.iter().map(|r| r.slide_id.as_str()).collect();
    slide_ids.sort_unstable();
    slide_ids.dedup();

    let keep_count = ((slide_ids.len() as f64 * rate).round() as usize).max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    slide_ids.shuffle(&mut rng);

    let keep: HashSet<String> = slide_ids
        .into_iter()
        .take(keep_count)
        .map(str::to_string)
        .collect();

    rows.into_iter()
        .filter(|r| keep.contains(&r.slide_id))
        .collect()
}

/// 全タイルの列挙（推論・評価用）
#[derive(Clone, Copy)]
pub struct FullEnumeration<'a> {
    index: &'a TileIndex,
}

impl Dataset<TileItem> for FullEnumeration<'_> {
    fn get(&self, index: usize) -> Option<TileItem> {
        (index < self.index.num_tiles()).then(|| self.index.item(index, index))
    }

    fn len(&self) -> usize {
        self.index.num_tiles()
    }
}

/// 選択済みサブセットの列挙（学習用）
#[derive(Clone, Copy)]
pub struct SelectedEnumeration<'a> {
    index: &'a TileIndex,
}

impl Dataset<TileItem> for SelectedEnumeration<'_> {
    fn get(&self, index: usize) -> Option<TileItem> {
        let triple = self.index.subset.get(index)?;
        Some(self.index.item(index, triple.flat_index))
    }

    fn len(&self) -> usize {
        self.index.subset.len()
    }
}

/// どちらかのビュー
#[derive(Clone, Copy)]
pub enum TileView<'a> {
    Full(FullEnumeration<'a>),
    Selected(SelectedEnumeration<'a>),
}

impl TileView<'_> {
    pub fn mode(&self) -> EnumerationMode {
        match self {
            TileView::Full(_) => EnumerationMode::AllTiles,
            TileView::Selected(_) => EnumerationMode::SelectedSubset,
        }
    }
}

impl Dataset<TileItem> for TileView<'_> {
    fn get(&self, index: usize) -> Option<TileItem> {
        match self {
            TileView::Full(view) => view.get(index),
            TileView::Selected(view) => view.get(index),
        }
    }

    fn len(&self) -> usize {
        match self {
            TileView::Full(view) => view.len(),
            TileView::Selected(view) => view.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(slide: &str, tile: &str, label: ClassLabel) -> ManifestRow {
        ManifestRow {
            slide_id: slide.to_string(),
            tile_id: tile.to_string(),
            label,
        }
    }

    fn layout() -> ImageLayout {
        ImageLayout::new("/data", ["neg".to_string(), "pos".to_string()])
    }

    fn sample_index() -> TileIndex {
        let rows = vec![
            row("B", "b1", ClassLabel::Negative),
            row("A", "a1", ClassLabel::Positive),
            row("A", "a2", ClassLabel::Positive),
            row("B", "b2", ClassLabel::Negative),
            row("A", "a3", ClassLabel::Positive),
        ];
        TileIndex::from_rows(rows, layout(), None, 0).unwrap()
    }

    #[test]
    fn test_grouping_is_stable_and_contiguous() {
        let index = sample_index();
        assert_eq!(index.slide_ids().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(index.tile_ids(), &["a1", "a2", "a3", "b1", "b2"]);
        assert_eq!(index.slide_index_per_tile(), &[0, 0, 0, 1, 1]);
        assert_eq!(index.slide_labels(), vec![ClassLabel::Positive, ClassLabel::Negative]);
        assert_eq!(index.slides()[1].tiles, 3..5);
        assert_eq!(index.slide_index_per_tile().len(), index.num_tiles());
    }

    #[test]
    fn test_conflicting_label_is_rejected() {
        let rows = vec![
            row("A", "a1", ClassLabel::Positive),
            row("A", "a2", ClassLabel::Negative),
        ];
        let err = TileIndex::from_rows(rows, layout(), None, 0).err().unwrap();
        assert!(matches!(err, DataLoadError::ConflictingLabel { ref slide_id } if slide_id == "A"));
    }

    #[test]
    fn test_slide_sampling_is_deterministic() {
        let rows: Vec<ManifestRow> = (0..20)
            .flat_map(|s| {
                (0..3).map(move |t| row(&format!("S{s:02}"), &format!("t{t}"), ClassLabel::Negative))
            })
            .collect();

        let first = TileIndex::from_rows(rows.clone(), layout(), Some(0.25), 7).unwrap();
        let second = TileIndex::from_rows(rows.clone(), layout(), Some(0.25), 7).unwrap();

        assert_eq!(first.num_slides(), 5);
        // スライド単位で抽出されるのでタイルは欠けない
        assert_eq!(first.num_tiles(), 15);
        assert_eq!(
            first.slide_ids().collect::<Vec<_>>(),
            second.slide_ids().collect::<Vec<_>>()
        );

        assert!(matches!(
            TileIndex::from_rows(rows, layout(), Some(1.5), 7),
            Err(DataLoadError::InvalidSubsetRate(_))
        ));
    }

    #[test]
    fn test_views_depend_on_mode() {
        let mut index = sample_index();
        assert_eq!(index.view(EnumerationMode::AllTiles).len(), 5);
        assert_eq!(index.view(EnumerationMode::SelectedSubset).len(), 0);

        index.build_subset(&[4, 1]).unwrap();
        let selected = index.view(EnumerationMode::SelectedSubset);
        assert_eq!(selected.mode(), EnumerationMode::SelectedSubset);
        assert_eq!(selected.len(), 2);

        let item = selected.get(0).unwrap();
        assert_eq!(item.flat_index, 4);
        assert_eq!(item.tile_id, "b2");
        assert_eq!(item.label, ClassLabel::Negative);
        assert_eq!(item.path, std::path::PathBuf::from("/data/neg/blk-b2-B.png"));

        let full = index.view(EnumerationMode::AllTiles);
        assert_eq!(full.get(2).unwrap().tile_id, "a3");
        assert!(full.get(5).is_none());
    }

    #[test]
    fn test_build_subset_rejects_out_of_range() {
        let mut index = sample_index();
        let err = index.build_subset(&[0, 5]).unwrap_err();
        assert!(matches!(err, MilError::IndexOutOfRange { index: 5, len: 5 }));
    }

    #[test]
    fn test_shuffle_preserves_multiset() {
        let mut index = sample_index();
        index.build_subset(&[0, 1, 2, 3, 4]).unwrap();
        let mut before = index.subset().to_vec();

        let mut rng = StdRng::seed_from_u64(99);
        index.shuffle_subset_with(&mut rng);
        index.shuffle_subset();
        let mut after = index.subset().to_vec();

        let key = |t: &TrainingTriple| (t.slide_index, t.tile_id.clone());
        before.sort_by_key(key);
        after.sort_by_key(key);
        assert_eq!(before, after);
    }
}
