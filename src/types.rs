use serde::{Deserialize, Serialize};

/// スライド単位の二値ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassLabel {
    Negative, // クラス0
    Positive, // クラス1
}

impl ClassLabel {
    /// クラスID (0 / 1)
    pub fn index(self) -> usize {
        match self {
            ClassLabel::Negative => 0,
            ClassLabel::Positive => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(ClassLabel::Negative),
            1 => Some(ClassLabel::Positive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassLabel::Negative => write!(f, "negative"),
            ClassLabel::Positive => write!(f, "positive"),
        }
    }
}

/// マニフェスト上のラベル文字列とクラスの対応
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelScheme {
    pub positive: String,
    pub negative: String,
}

impl LabelScheme {
    pub fn parse(&self, value: &str) -> Option<ClassLabel> {
        let value = value.trim();
        if value == self.positive {
            Some(ClassLabel::Positive)
        } else if value == self.negative {
            Some(ClassLabel::Negative)
        } else {
            None
        }
    }
}

impl Default for LabelScheme {
    fn default() -> Self {
        Self {
            positive: "MSI".to_string(),
            negative: "MSS".to_string(),
        }
    }
}

/// スライド（患者）。読み込み後は不変
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slide {
    pub slide_id: String,
    pub label: ClassLabel,
    /// フラットなタイル配列上の範囲 [start, end)
    pub tiles: std::ops::Range<usize>,
}

impl Slide {
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }
}

/// エポックごとに選び直される学習対象タイル
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrainingTriple {
    /// 元のフラットなタイル位置
    pub flat_index: usize,
    pub slide_index: usize,
    pub tile_id: String,
    pub label: ClassLabel,
}
