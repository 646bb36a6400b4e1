//! Integer apportionment helpers.
//!
//! Every proportional division in the pool goes through [`largest_remainder`], so the parts
//! always add back up to the amount being divided.

use crate::database::{Amount, Percentage};

/// Divides `total` between `weights` in proportion to each weight.
///
/// Each entry first receives the floor of its exact quota. The units left over after flooring
/// (fewer than the number of entries) go one at a time to the entries with the largest
/// remainders; equal remainders are broken by ascending key so the result is deterministic.
///
/// Returns an empty vector when the weights sum to zero. Otherwise the returned amounts sum to
/// exactly `total`, in the same order as `weights`.
pub fn largest_remainder<K: Copy + Ord>(total: Amount, weights: &[(K, u128)]) -> Vec<(K, Amount)> {
    let weights = scale_to_u64(weights);
    let total_weight: u128 = weights.iter().map(|(_, w)| *w).sum();
    if total_weight == 0 {
        return Vec::new();
    }

    let total = total as u128;
    let mut parts: Vec<(K, Amount)> = Vec::with_capacity(weights.len());
    let mut remainders: Vec<(usize, u128)> = Vec::with_capacity(weights.len());
    let mut allocated: u128 = 0;

    for (idx, (key, weight)) in weights.iter().enumerate() {
        // total and weight are both below 2^64 here, so the product fits
        let scaled = total * weight;
        let quota = scaled / total_weight;
        allocated += quota;
        parts.push((*key, quota as Amount));
        remainders.push((idx, scaled % total_weight));
    }

    let leftover = (total - allocated) as usize;
    if leftover > 0 {
        remainders.sort_by(|(a_idx, a_rem), (b_idx, b_rem)| {
            b_rem.cmp(a_rem).then_with(|| parts[*a_idx].0.cmp(&parts[*b_idx].0))
        });
        for (idx, _) in remainders.into_iter().take(leftover) {
            parts[idx].1 += 1;
        }
    }

    parts
}

/// Pool fee on `total` at `fee` (floored).
pub fn fee_amount(total: Amount, fee: Percentage) -> Amount {
    let fee = (total as u128 * fee.basis_points() as u128) / Percentage::BASIS_POINTS as u128;
    fee.min(total as u128) as Amount
}

// Shifts all weights right until their sum fits in a u64, keeping ratios approximately intact.
fn scale_to_u64<K: Copy>(weights: &[(K, u128)]) -> Vec<(K, u128)> {
    let mut scaled: Vec<(K, u128)> = weights.to_vec();
    loop {
        let sum = scaled.iter().fold(0u128, |acc, (_, w)| acc.saturating_add(*w));
        if sum <= u64::MAX as u128 {
            return scaled;
        }
        for (_, w) in scaled.iter_mut() {
            *w >>= 1;
        }
    }
}
