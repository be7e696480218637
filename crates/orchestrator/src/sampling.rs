//! Weighted and softmax sampling primitives for the scheduler.

use rand::Rng;

/// Softmax selection over weights at temperature `t`: `p_i ∝ exp(w_i / t)`.
///
/// As `t → 0` selection concentrates on the argmax; as `t → ∞` it
/// approaches uniform. Returns `None` for an empty candidate set.
pub fn softmax_select<R: Rng + ?Sized>(weights: &[f64], t: f64, rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let t = t.max(1e-6);
    // Shift by the max so exp never overflows.
    let max = weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = weights.iter().map(|w| ((w - max) / t).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Some(0);
    }
    let mut draw = rng.gen_range(0.0..sum);
    for (i, e) in exps.iter().enumerate() {
        if draw < *e {
            return Some(i);
        }
        draw -= e;
    }
    Some(exps.len() - 1)
}

/// Proportional (roulette) sampling over non-negative weights.
pub fn weighted_sample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    let sum: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if weights.is_empty() || sum <= 0.0 {
        return None;
    }
    let mut draw = rng.gen_range(0.0..sum);
    for (i, w) in weights.iter().enumerate() {
        if !w.is_finite() || *w <= 0.0 {
            continue;
        }
        if draw < *w {
            return Some(i);
        }
        draw -= w;
    }
    weights.iter().rposition(|w| w.is_finite() && *w > 0.0)
}

/// Samples up to `count` distinct indices proportionally to `weights`.
pub fn weighted_sample_distinct<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut remaining: Vec<f64> = weights.to_vec();
    let mut out = Vec::with_capacity(count.min(weights.len()));
    for _ in 0..count {
        match weighted_sample(&remaining, rng) {
            Some(i) => {
                out.push(i);
                remaining[i] = 0.0;
            }
            None => break,
        }
    }
    out
}

/// The exploration knob: with probability `mutation_rate` a weight flips to
/// its complement (`w' = 1 − w`), floored at a small positive value so a
/// flipped certainty stays selectable.
pub fn maybe_mutate<R: Rng + ?Sized>(weight: f64, mutation_rate: f64, rng: &mut R) -> f64 {
    if mutation_rate > 0.0 && rng.gen_bool(mutation_rate.clamp(0.0, 1.0)) {
        (1.0 - weight).max(0.01)
    } else {
        weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn frequencies(weights: &[f64], t: f64, draws: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = vec![0usize; weights.len()];
        for _ in 0..draws {
            let i = softmax_select(weights, t, &mut rng).unwrap();
            counts[i] += 1;
        }
        counts
    }

    #[test]
    fn low_temperature_concentrates_on_argmax() {
        let weights = [0.2, 0.9, 0.5, 0.1];
        let counts = frequencies(&weights, 0.01, 2_000);
        // Essentially everything lands on index 1.
        assert!(counts[1] > 1_990, "counts: {counts:?}");
    }

    #[test]
    fn high_temperature_approaches_uniform() {
        let weights = [0.2, 0.9, 0.5, 0.1];
        let counts = frequencies(&weights, 1_000.0, 8_000);
        for c in &counts {
            // Each of the 4 options sits near 2000 draws.
            assert!((1_700..=2_300).contains(c), "counts: {counts:?}");
        }
    }

    #[test]
    fn empty_choice_set_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(softmax_select(&[], 1.0, &mut rng), None);
        assert_eq!(weighted_sample(&[], &mut rng), None);
        assert_eq!(weighted_sample(&[0.0, 0.0], &mut rng), None);
    }

    #[test]
    fn weighted_sampling_tracks_proportions() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = [1.0, 3.0];
        let mut hits = [0usize; 2];
        for _ in 0..8_000 {
            hits[weighted_sample(&weights, &mut rng).unwrap()] += 1;
        }
        let ratio = hits[1] as f64 / hits[0] as f64;
        assert!((2.4..=3.6).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn distinct_sampling_never_repeats() {
        let mut rng = StdRng::seed_from_u64(3);
        let weights = [0.5, 0.1, 0.9, 0.3];
        let mut picked = weighted_sample_distinct(&weights, 4, &mut rng);
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1, 2, 3]);
        // Asking for more than available stops cleanly.
        assert_eq!(weighted_sample_distinct(&weights, 10, &mut rng).len(), 4);
    }

    #[test]
    fn mutation_flips_the_weight() {
        let mut rng = StdRng::seed_from_u64(9);
        // Rate 1.0 always flips.
        let flipped = maybe_mutate(0.8, 1.0, &mut rng);
        assert!((flipped - 0.2).abs() < 1e-12);
        // Rate 0.0 never flips.
        assert_eq!(maybe_mutate(0.8, 0.0, &mut rng), 0.8);
    }
}
