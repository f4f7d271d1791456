use std::cmp::Ordering;

use itertools::Itertools;

/// One surviving entry of the candidate set within a single `sample` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub logit: f32,
    pub prob: f32,
}

impl Candidate {
    /// Higher logit first; ties resolved towards the lower token id.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .logit
            .total_cmp(&self.logit)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Select the `k` highest logits without sorting the whole vocabulary.
/// `k == 0` keeps every entry. The result is ordered by [`Candidate::rank`].
pub fn top_k(logits: &[f32], k: usize) -> Vec<Candidate> {
    let mut candidates = logits
        .iter()
        .enumerate()
        .map(|(id, &logit)| Candidate {
            id: id as u32,
            logit,
            prob: 0.0,
        })
        .collect_vec();

    if k > 0 && k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, Candidate::rank);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(Candidate::rank);
    candidates
}

/// Recompute `prob` from `logit` over the current candidates.
pub fn softmax(candidates: &mut [Candidate]) {
    let max = candidates
        .iter()
        .map(|x| x.logit)
        .fold(f32::NEG_INFINITY, f32::max);

    if !max.is_finite() {
        // every candidate is masked out; fall back to a flat distribution
        let uniform = 1.0 / candidates.len().max(1) as f32;
        candidates.iter_mut().for_each(|x| x.prob = uniform);
        return;
    }

    let mut sum = 0.0;
    for candidate in candidates.iter_mut() {
        candidate.prob = (candidate.logit - max).exp();
        sum += candidate.prob;
    }
    candidates.iter_mut().for_each(|x| x.prob /= sum);
}
