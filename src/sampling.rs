//! Logits processing and token selection.
//!
//! Processing order: repetition penalty, temperature, top-k, top-p, draw.

use rand::Rng;

use crate::model::GenerationParams;

/// Penalises every token already present in `previous`, once per token.
pub fn apply_repetition_penalty(logits: &mut [f32], previous: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &id in previous {
        let idx = id as usize;
        if idx >= logits.len() || seen[idx] {
            continue;
        }
        seen[idx] = true;
        let logit = &mut logits[idx];
        if *logit < 0.0 {
            *logit *= penalty;
        } else {
            *logit /= penalty;
        }
    }
}

pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 && temperature != 1.0 {
        for logit in logits.iter_mut() {
            *logit /= temperature;
        }
    }
}

/// Masks every logit below the `top_k`-th largest. Ties at the cut are kept.
pub fn top_k_filter(logits: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    let (_, kth, _) = sorted.select_nth_unstable_by(top_k - 1, |a, b| b.total_cmp(a));
    let threshold = *kth;
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = probs.iter().sum();
    if total > 0.0 {
        for p in probs.iter_mut() {
            *p /= total;
        }
    }
    probs
}

/// Zeroes everything outside the nucleus and renormalises.
///
/// The nucleus is the smallest set of most likely tokens whose mass reaches
/// `top_p`; it always holds at least one token.
pub fn top_p_filter(probs: &mut [f32], top_p: f32) {
    if top_p >= 1.0 || probs.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0;
    let mut keep = 0;
    for &idx in &order {
        cumulative += probs[idx];
        keep += 1;
        if cumulative >= top_p {
            break;
        }
    }

    for &idx in &order[keep..] {
        probs[idx] = 0.0;
    }
    let total: f32 = order[..keep].iter().map(|&i| probs[i]).sum();
    if total > 0.0 {
        for &idx in &order[..keep] {
            probs[idx] /= total;
        }
    }
}

pub fn argmax(values: &[f32]) -> Option<u32> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx as u32)
}

fn draw<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> Option<u32> {
    let total: f32 = probs.iter().sum();
    if !(total > 0.0) {
        return argmax(probs);
    }
    let mut target = rng.r#gen::<f32>() * total;
    let mut last_nonzero = None;
    for (idx, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        last_nonzero = Some(idx as u32);
        if target < p {
            return Some(idx as u32);
        }
        target -= p;
    }
    last_nonzero
}

/// Picks the next token id. Returns `None` only for empty logits.
pub fn select_token<R: Rng + ?Sized>(
    logits: &mut [f32],
    previous: &[u32],
    params: &GenerationParams,
    rng: &mut R,
) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }
    apply_repetition_penalty(logits, previous, params.repetition_penalty);

    if !params.do_sample || params.temperature <= 0.0 {
        return argmax(logits);
    }

    apply_temperature(logits, params.temperature);
    top_k_filter(logits, params.top_k);
    let mut probs = softmax(logits);
    top_p_filter(&mut probs, params.top_p);
    draw(&probs, rng)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn greedy() -> GenerationParams {
        GenerationParams {
            do_sample: false,
            repetition_penalty: 1.0,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn repetition_penalty_pushes_seen_tokens_down() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1, 0], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn repetition_penalty_ignores_out_of_range_ids() {
        let mut logits = vec![1.0];
        apply_repetition_penalty(&mut logits, &[7], 2.0);
        assert_eq!(logits, vec![1.0]);
    }

    #[test]
    fn top_p_keeps_at_least_one_token() {
        let mut probs = vec![0.7, 0.2, 0.1];
        top_p_filter(&mut probs, 0.1);
        assert_eq!(probs, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn top_p_keeps_smallest_nucleus() {
        let mut probs = vec![0.1, 0.5, 0.4];
        top_p_filter(&mut probs, 0.85);
        assert_eq!(probs[0], 0.0);
        assert!((probs[1] - 5.0 / 9.0).abs() < 1e-6);
        assert!((probs[2] - 4.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_masks_everything_below_the_cut() {
        let mut logits = vec![0.5, 3.0, -1.0, 2.0, 2.0];
        top_k_filter(&mut logits, 2);
        assert_eq!(logits[1], 3.0);
        assert_eq!(logits[3], 2.0);
        assert_eq!(logits[4], 2.0);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);
    }

    #[test]
    fn top_k_zero_or_wide_is_a_no_op() {
        let mut logits = vec![1.0, 2.0, 3.0];
        top_k_filter(&mut logits, 0);
        top_k_filter(&mut logits, 3);
        assert_eq!(logits, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn flat_distribution_samples_only_top_fifty() {
        let mut rng = StdRng::seed_from_u64(7);
        let params = GenerationParams::default();
        let flat: Vec<f32> = (0..200).map(|i| i as f32 * 1e-3).collect();

        let mut drawn = HashSet::new();
        for _ in 0..2000 {
            let mut logits = flat.clone();
            drawn.insert(select_token(&mut logits, &[], &params, &mut rng).unwrap());
        }
        assert!(drawn.len() > 1);
        assert!(drawn.len() <= 50, "drew {} distinct tokens", drawn.len());
        assert!(drawn.iter().all(|&id| id >= 150));
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(argmax(&probs), Some(3));
    }

    #[test]
    fn greedy_selection_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = greedy();
        for _ in 0..5 {
            let mut logits = vec![0.1, 3.0, 0.2];
            assert_eq!(select_token(&mut logits, &[], &params, &mut rng), Some(1));
        }
    }

    #[test]
    fn penalty_can_change_greedy_choice() {
        let mut rng = StdRng::seed_from_u64(1);
        let params = GenerationParams {
            repetition_penalty: 2.0,
            ..greedy()
        };
        let mut logits = vec![3.0, 2.0];
        assert_eq!(select_token(&mut logits, &[0], &params, &mut rng), Some(1));
    }

    #[test]
    fn sampling_stays_inside_nucleus() {
        let mut rng = StdRng::seed_from_u64(42);
        let params = GenerationParams {
            temperature: 1.0,
            top_p: 0.5,
            repetition_penalty: 1.0,
            ..GenerationParams::default()
        };
        for _ in 0..50 {
            let mut logits = vec![5.0, 0.0, 0.0, 0.0];
            assert_eq!(select_token(&mut logits, &[], &params, &mut rng), Some(0));
        }
    }

    #[test]
    fn empty_logits_select_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            select_token(&mut [], &[], &GenerationParams::default(), &mut rng),
            None
        );
    }
}
