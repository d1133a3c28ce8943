//! 学習率スケジュール

/// マイルストーンを通過するたびに `gamma` 倍する多段減衰
///
/// `epoch` は0始まり。マイルストーン `m` は `epoch >= m` で適用済みとみなします。
pub fn learning_rate_at(base: f64, epoch: usize, milestones: &[usize], gamma: f64) -> f64 {
    let passed = milestones.iter().filter(|&&m| epoch >= m).count();
    base * gamma.powi(passed as i32)
}
