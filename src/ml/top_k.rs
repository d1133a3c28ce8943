//! スライド単位の上位kタイル選択

use crate::error::{MilError, MilResult};

/// スライドごとに確率が高い上位 `k` タイルのフラット位置を返す
///
/// (スライド昇順, 確率昇順) で安定ソートし、各スライドの末尾 `k` 件を取ります。
/// 確率が同じ場合は元の並び順が後ろのものが優先されます。
/// NaNなど有限でない確率は最下位として扱います。
/// タイル数が `k` 未満のスライドは全タイルが選ばれます。
/// 戻り値の順序に意味はありません。
pub fn select_top_k(slide_index: &[usize], probabilities: &[f32], k: usize) -> MilResult<Vec<usize>> {
    if slide_index.len() != probabilities.len() {
        return Err(MilError::LengthMismatch {
            left: slide_index.len(),
            right: probabilities.len(),
        });
    }

    let order = lexsort(slide_index, probabilities);
    let n = order.len();

    let selected = (0..n)
        .filter(|&i| n - i <= k || slide_index[order[i + k]] != slide_index[order[i]])
        .map(|i| order[i])
        .collect();

    Ok(selected)
}

/// スライドごとの最大確率（タイルが無いスライドは `None`）
pub fn slide_max_probability(
    slide_index: &[usize],
    probabilities: &[f32],
    num_slides: usize,
) -> MilResult<Vec<Option<f32>>> {
    if slide_index.len() != probabilities.len() {
        return Err(MilError::LengthMismatch {
            left: slide_index.len(),
            right: probabilities.len(),
        });
    }

    let mut out = vec![None; num_slides];
    for (&slide, &p) in slide_index.iter().zip(probabilities) {
        if !p.is_finite() {
            continue;
        }
        if let Some(slot) = out.get_mut(slide) {
            *slot = Some(match *slot {
                Some(current) if current >= p => current,
                _ => p,
            });
        }
    }
    Ok(out)
}

fn lexsort(slide_index: &[usize], probabilities: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..slide_index.len()).collect();
    order.sort_by(|&a, &b| {
        slide_index[a]
            .cmp(&slide_index[b])
            .then(rank_key(probabilities[a]).total_cmp(&rank_key(probabilities[b])))
    });
    order
}

fn rank_key(p: f32) -> f32 {
    if p.is_finite() {
        p
    } else {
        f32::NEG_INFINITY
    }
}
