use std::collections::VecDeque;

/// Penalty bookkeeping of one session: occurrence counts inside a sliding window,
/// the last position of every token, and a scratch copy of the logits.
///
/// `counts` always sums to the length of `history`.
#[derive(Debug, Clone)]
pub struct SamplerState {
    window: usize,
    counts: Vec<u32>,
    last_position: Vec<i64>,
    history: VecDeque<u32>,
    total_emitted: u64,
    logits: Vec<f32>,
}

impl SamplerState {
    pub fn new(vocab_size: usize, window: usize) -> Self {
        Self {
            window,
            counts: vec![0; vocab_size],
            last_position: vec![-1; vocab_size],
            history: VecDeque::with_capacity(window.min(4096)),
            total_emitted: 0,
            logits: Vec::with_capacity(vocab_size),
        }
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.counts.len()
    }

    #[inline]
    pub fn window(&self) -> usize {
        self.window
    }

    #[inline]
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    #[inline]
    pub fn total_emitted(&self) -> u64 {
        self.total_emitted
    }

    pub fn history(&self) -> impl Iterator<Item = u32> + '_ {
        self.history.iter().copied()
    }

    /// Position of the last occurrence of `token`, if any.
    pub fn last_position(&self, token: u32) -> Option<u64> {
        self.last_position
            .get(token as usize)
            .and_then(|&x| u64::try_from(x).ok())
    }

    /// Resize the window, evicting the oldest entries if it shrinks.
    pub fn set_window(&mut self, window: usize) {
        self.window = window;
        self.evict();
    }

    /// Record an emitted token.
    pub fn push(&mut self, token: u32) {
        let index = token as usize;
        if index >= self.counts.len() {
            log::warn!("[sampler][history] token {token} out of vocabulary");
            return;
        }

        self.history.push_back(token);
        self.counts[index] += 1;
        self.evict();

        self.last_position[index] = self.total_emitted as i64;
        self.total_emitted += 1;
    }

    /// Zero counts and positions and clear the history, keeping the allocations.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|x| *x = 0);
        self.last_position.iter_mut().for_each(|x| *x = -1);
        self.history.clear();
        self.total_emitted = 0;
    }

    /// Copy raw logits into the scratch buffer.
    pub(crate) fn load(&mut self, logits: &[f32]) {
        self.logits.clear();
        self.logits.extend_from_slice(logits);
    }

    #[inline]
    pub(crate) fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Apply repetition, frequency and presence penalties to the scratch logits.
    pub(crate) fn penalize(&mut self, repetition: f32, frequency: f32, presence: f32) {
        let Self { counts, logits, .. } = self;
        for (id, &count) in counts.iter().enumerate().filter(|(_, &count)| count > 0) {
            let logit = &mut logits[id];
            *logit = match *logit <= 0.0 {
                true => *logit * repetition,
                false => *logit / repetition,
            };
            *logit -= count as f32 * frequency + presence;
        }
    }

    fn evict(&mut self) {
        while self.history.len() > self.window {
            if let Some(token) = self.history.pop_front() {
                self.counts[token as usize] -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(state: &SamplerState) {
        let sum: u32 = state.counts().iter().sum();
        assert_eq!(sum as usize, state.history().count());
        for token in state.history() {
            assert!(state.counts()[token as usize] >= 1);
        }
    }

    #[test]
    fn window_evicts_oldest() {
        let mut state = SamplerState::new(8, 3);
        for token in [1, 2, 3, 4, 4] {
            state.push(token);
            assert_consistent(&state);
        }
        assert_eq!(state.history().collect::<Vec<_>>(), vec![3, 4, 4]);
        assert_eq!(state.counts()[1], 0);
        assert_eq!(state.counts()[2], 0);
        assert_eq!(state.counts()[4], 2);
        assert_eq!(state.last_position(4), Some(4));
        assert_eq!(state.last_position(1), Some(0));
        assert_eq!(state.total_emitted(), 5);
    }

    #[test]
    fn zero_window_keeps_nothing() {
        let mut state = SamplerState::new(4, 0);
        state.push(2);
        assert_consistent(&state);
        assert_eq!(state.counts()[2], 0);
        assert_eq!(state.total_emitted(), 1);
    }

    #[test]
    fn shrinking_window_evicts() {
        let mut state = SamplerState::new(8, 8);
        for token in 0..6 {
            state.push(token);
        }
        state.set_window(2);
        assert_consistent(&state);
        assert_eq!(state.history().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn out_of_vocab_is_ignored() {
        let mut state = SamplerState::new(4, 4);
        state.push(9);
        assert_consistent(&state);
        assert_eq!(state.total_emitted(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = SamplerState::new(4, 4);
        state.push(1);
        state.push(3);
        state.reset();
        assert_consistent(&state);
        assert!(state.counts().iter().all(|&x| x == 0));
        assert_eq!(state.last_position(1), None);
        assert_eq!(state.total_emitted(), 0);
        assert_eq!(state.window(), 4);
    }
}
