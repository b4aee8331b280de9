//! softmax / top-k / top-p / sample: the logits post-processing chain
//! (spec §4.6, §4.10 step 3).
//!
//! Each stage is a free function over a flat logits/probs slice so the
//! generator can compose exactly the chain spec §4.10 describes: softcap
//! → temperature scale → top-k → softmax → top-p → sample.

use std::collections::HashSet;

use fastrand::Rng;

/// `tanh(x/cap) · cap`, applied in place.
pub fn softcap(logits: &mut [f32], cap: f32) {
    for v in logits.iter_mut() {
        *v = (*v / cap).tanh() * cap;
    }
}

/// Scales by `1/temperature`. A `temperature` of exactly `0.0` is the
/// caller's signal to skip sampling and take [`argmax`] instead — this
/// function is a no-op in that case.
pub fn scale_by_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 {
        for v in logits.iter_mut() {
            *v /= temperature;
        }
    }
}

/// Index of the greatest logit; ties favor the lower index, matching the
/// top-k tie-break rule.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx
}

/// Retains the `k` greatest logits, setting the rest to `-inf`. Ties at
/// the retention boundary favor the lower index. `k == 0` disables
/// filtering (the conventional meaning of `topK: 0` in the runtime
/// config) and `k >= logits.len()` is also a no-op.
pub fn top_k_mask(logits: &mut [f32], k: usize) {
    let n = logits.len();
    if k == 0 || k >= n {
        return;
    }
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap().then(a.cmp(&b)));
    let retained: HashSet<usize> = idx[..k].iter().copied().collect();
    for (i, v) in logits.iter_mut().enumerate() {
        if !retained.contains(&i) {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Numerically stable softmax (row-max subtracted before exponentiation).
/// `-inf` entries (masked by [`top_k_mask`]) map to exactly `0.0`.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        for e in exps.iter_mut() {
            *e /= sum;
        }
    }
    exps
}

/// Retains the smallest prefix (in descending-probability order) whose
/// cumulative sum is `>= top_p`, zeroes the rest, and renormalizes the
/// survivors so they sum to `1.0`.
pub fn top_p_mask(probs: &mut [f32], top_p: f32) {
    let n = probs.len();
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap());

    let mut cumulative = 0.0f32;
    let mut retain_count = 0;
    for &i in &idx {
        cumulative += probs[i];
        retain_count += 1;
        if cumulative >= top_p {
            break;
        }
    }

    let retained: HashSet<usize> = idx[..retain_count].iter().copied().collect();
    let mut sum = 0.0f32;
    for (i, p) in probs.iter_mut().enumerate() {
        if retained.contains(&i) {
            sum += *p;
        } else {
            *p = 0.0;
        }
    }
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Inverse-CDF sampling from a discrete distribution. The caller supplies
/// the `Rng`; a seeded `Rng` makes sampling deterministic within a
/// generation, per spec §4.10.
pub fn sample(probs: &[f32], rng: &mut Rng) -> usize {
    let r = rng.f32();
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}
