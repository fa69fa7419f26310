//! Coin selection.

use crate::domain::Utxo;
use crate::error::{Error, Result};

/// Picks the coins funding `target_amount` of `target_asset`.
pub trait CoinSelector: Send + Sync {
    /// Returns the selected coins and the change left over.
    fn select_utxos(
        &self,
        utxos: &[Utxo],
        target_amount: u64,
        target_asset: &str,
    ) -> Result<(Vec<Utxo>, u64)>;
}

/// Selects as few coins as possible.
///
/// Combinations of the candidate coins, sorted by descending value, are
/// visited by increasing size. The first one whose total equals the target,
/// or covers it without exceeding ten times the target, wins. If none does,
/// the first combination covering the target at all is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallestSubsetSelector;

impl SmallestSubsetSelector {
    pub fn new() -> Self {
        Self
    }
}

impl CoinSelector for SmallestSubsetSelector {
    fn select_utxos(
        &self,
        utxos: &[Utxo],
        target_amount: u64,
        target_asset: &str,
    ) -> Result<(Vec<Utxo>, u64)> {
        if utxos.iter().any(|u| u.is_confidential() && !u.is_revealed()) {
            return Err(Error::BlindedUtxos);
        }

        let mut candidates: Vec<&Utxo> =
            utxos.iter().filter(|u| u.asset == target_asset).collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        let values: Vec<u64> = candidates.iter().map(|u| u.value).collect();
        let best = best_combination(&values, target_amount);
        if best.is_empty() {
            return Err(Error::TargetAmountNotReached);
        }

        let selected: Vec<Utxo> = find_indexes(&best, &values)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect();
        let total: u64 = selected.iter().map(|u| u.value).sum();
        Ok((selected, total - target_amount))
    }
}

/// Values of the winning combination, or an empty vec if `items` can't reach
/// `target`. `items` must be sorted in descending order.
pub(crate) fn best_combination(items: &[u64], target: u64) -> Vec<u64> {
    if items.iter().sum::<u64>() < target {
        return Vec::new();
    }
    let mut fallback: Option<Vec<u64>> = None;

    let mut largest = 0u64;
    for size in 1..=items.len() {
        // No combination of this size can beat the `size` largest items.
        largest += items[size - 1];
        if largest < target {
            continue;
        }
        let mut idx: Vec<usize> = (0..size).collect();
        loop {
            let total: u64 = idx.iter().map(|&i| items[i]).sum();
            if total >= target {
                let combo: Vec<u64> = idx.iter().map(|&i| items[i]).collect();
                if total == target || total <= target.saturating_mul(10) {
                    return combo;
                }
                fallback.get_or_insert(combo);
            }
            if !next_combination(&mut idx, items.len()) {
                break;
            }
        }
    }

    fallback.unwrap_or_default()
}

/// Advances `idx` to the next k-combination of `0..n` in lexicographic order.
fn next_combination(idx: &mut [usize], n: usize) -> bool {
    let k = idx.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if idx[i] < n - k + i {
            idx[i] += 1;
            for j in i + 1..k {
                idx[j] = idx[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

/// Maps each value of `list` to the first index of `values` holding it that
/// hasn't been taken yet.
pub(crate) fn find_indexes(list: &[u64], values: &[u64]) -> Vec<usize> {
    let mut indexes: Vec<usize> = Vec::with_capacity(list.len());
    for v in list {
        if let Some(i) = values
            .iter()
            .enumerate()
            .position(|(i, value)| value == v && !indexes.contains(&i))
        {
            indexes.push(i);
        }
    }
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{UtxoKey, UtxoStatus};

    fn sorted(mut items: Vec<u64>) -> Vec<u64> {
        items.sort_by(|a, b| b.cmp(a));
        items
    }

    #[test]
    fn best_combination_vectors() {
        let cases: Vec<(Vec<u64>, u64, Vec<u64>)> = vec![
            (vec![61, 61, 61, 38, 61, 61, 61, 1, 1, 1, 3], 6, vec![38]),
            (vec![61, 61, 61, 61, 61, 61, 1, 1, 1, 3], 6, vec![3, 1, 1, 1]),
            (vec![61, 61], 6, vec![61]),
            (vec![2, 2], 6, vec![]),
            (vec![61, 1, 1, 1, 3, 56], 6, vec![56]),
        ];
        for (items, target, expected) in cases {
            assert_eq!(
                best_combination(&sorted(items.clone()), target),
                expected,
                "items {items:?}"
            );
        }
    }

    #[test]
    fn find_indexes_vectors() {
        assert_eq!(find_indexes(&[1000], &[1000, 1000, 1000]), vec![0]);
        assert_eq!(find_indexes(&[1000, 1000], &[1000, 2000, 1000]), vec![0, 2]);
        assert_eq!(
            find_indexes(&[2000, 2000], &[1000, 2000, 1000, 2000, 2000, 2000]),
            vec![1, 3]
        );
    }

    #[test]
    fn next_combination_is_lexicographic() {
        let mut idx = vec![0, 1];
        let mut seen = vec![idx.clone()];
        while next_combination(&mut idx, 4) {
            seen.push(idx.clone());
        }
        assert_eq!(
            seen,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
    }

    const ASSET: &str = "5ac9f65c0efcc4775e0baec4ec03abdde22473cd3cf33c0419ca290e0751b225";

    fn utxo(vout: u32, value: u64, asset: &str) -> Utxo {
        Utxo {
            key: UtxoKey::new("ab".repeat(32), vout),
            value,
            asset: asset.to_string(),
            confirmed_status: Some(UtxoStatus::new("", 1, 1, "00")),
            ..Default::default()
        }
    }

    #[test]
    fn selects_and_computes_change() {
        let utxos = vec![
            utxo(0, 100, ASSET),
            utxo(1, 2_000, ASSET),
            utxo(2, 50_000, "other"),
        ];
        let (selected, change) = SmallestSubsetSelector
            .select_utxos(&utxos, 1_500, ASSET)
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key.vout, 1);
        assert_eq!(change, 500);
    }

    #[test]
    fn duplicate_values_select_distinct_coins() {
        let utxos = vec![utxo(0, 1, ASSET), utxo(1, 1, ASSET), utxo(2, 1, ASSET)];
        let (selected, change) = SmallestSubsetSelector
            .select_utxos(&utxos, 3, ASSET)
            .unwrap();
        let mut vouts: Vec<u32> = selected.iter().map(|u| u.key.vout).collect();
        vouts.sort();
        assert_eq!(vouts, vec![0, 1, 2]);
        assert_eq!(change, 0);
    }

    #[test]
    fn unreachable_target() {
        let utxos = vec![utxo(0, 2, ASSET), utxo(1, 2, ASSET), utxo(2, 100, "other")];
        assert!(matches!(
            SmallestSubsetSelector.select_utxos(&utxos, 6, ASSET),
            Err(Error::TargetAmountNotReached)
        ));
    }

    #[test]
    fn insufficient_funds_fail_without_searching() {
        let utxos: Vec<Utxo> = (0..40).map(|vout| utxo(vout, 1, ASSET)).collect();
        let started = std::time::Instant::now();
        assert!(matches!(
            SmallestSubsetSelector.select_utxos(&utxos, 41, ASSET),
            Err(Error::TargetAmountNotReached)
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn sizes_too_small_to_cover_the_target_are_skipped() {
        let items = vec![1; 40];
        let started = std::time::Instant::now();
        assert_eq!(best_combination(&items, 38), vec![1; 38]);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn unrevealed_coin_is_rejected_even_if_unused() {
        let mut blinded = utxo(9, 1, "other");
        blinded.value_commitment = vec![8; 33];
        blinded.asset_commitment = vec![10; 33];
        let utxos = vec![utxo(0, 100, ASSET), blinded];
        assert!(matches!(
            SmallestSubsetSelector.select_utxos(&utxos, 10, ASSET),
            Err(Error::BlindedUtxos)
        ));
    }
}
