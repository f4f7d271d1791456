use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{
    history::SamplerState,
    utils::{self, Candidate},
    Sampler,
};

#[derive(Debug, Clone, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SamplerParams {
    /// Divisor applied to the surviving logits. `0` disables scaling.
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    /// Number of highest-logit candidates kept. `0` keeps the whole vocabulary.
    #[derivative(Default(value = "5"))]
    pub top_k: usize,
    /// Cumulative probability mass kept.
    #[derivative(Default(value = "0.9"))]
    pub top_p: f32,
    /// Minimum probability relative to the most likely candidate.
    #[derivative(Default(value = "0.0"))]
    pub min_p: f32,
    #[derivative(Default(value = "1.0"))]
    #[serde(alias = "rep_penalty")]
    pub repetition_penalty: f32,
    #[derivative(Default(value = "0.0"))]
    #[serde(alias = "freq_penalty")]
    pub frequency_penalty: f32,
    #[derivative(Default(value = "0.0"))]
    pub presence_penalty: f32,
    /// Size of the penalty window, in tokens.
    #[derivative(Default(value = "1024"))]
    #[serde(alias = "rep_penalty_window")]
    pub repeat_last_n: usize,
    /// Seed of the session generator. Drawn from entropy if absent.
    pub seed: Option<u64>,
}

impl SamplerParams {
    /// Whether the penalty stage would leave every logit untouched.
    pub fn penalty_neutral(&self) -> bool {
        self.repeat_last_n == 0
            || (self.repetition_penalty == 1.0
                && self.frequency_penalty == 0.0
                && self.presence_penalty == 0.0)
    }
}

#[derive(Debug, Clone)]
pub struct NucleusSampler {
    pub params: SamplerParams,
    pub state: SamplerState,
    rng: fastrand::Rng,
}

impl NucleusSampler {
    pub fn new(vocab_size: usize, params: SamplerParams) -> Self {
        let state = SamplerState::new(vocab_size, params.repeat_last_n);
        let rng = match params.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { params, state, rng }
    }

    /// Replace the shaping parameters, keeping the penalty history.
    pub fn set_params(&mut self, params: SamplerParams) {
        if params.repeat_last_n != self.state.window() {
            self.state.set_window(params.repeat_last_n);
        }
        if params.seed != self.params.seed {
            if let Some(seed) = params.seed {
                self.rng.seed(seed);
            }
        }
        self.params = params;
    }

    /// Reseed the session generator.
    pub fn reseed(&mut self, seed: u64) {
        self.params.seed = Some(seed);
        self.rng.seed(seed);
    }

    /// Zero the counts and positions and clear the history. Shaping parameters are kept.
    pub fn reset_penalties(&mut self) {
        self.state.reset();
    }

    /// Run every shaping stage and return the final candidate set, without drawing.
    pub fn shape(&mut self, logits: &[f32]) -> Vec<Candidate> {
        let NucleusSampler { params, state, .. } = self;
        assert_eq!(
            logits.len(),
            state.vocab_size(),
            "logits do not match the sampler vocabulary"
        );

        state.load(logits);
        if !params.penalty_neutral() {
            state.penalize(
                params.repetition_penalty,
                params.frequency_penalty,
                params.presence_penalty,
            );
        }

        let mut candidates = utils::top_k(state.logits(), params.top_k);
        utils::softmax(&mut candidates);

        if params.top_p < 1.0 {
            let mut cum = 0.0;
            let len = candidates
                .iter()
                .position(|x| {
                    cum += x.prob;
                    cum >= params.top_p
                })
                .map_or(candidates.len(), |index| index + 1);
            candidates.truncate(len);
        }
        utils::softmax(&mut candidates);

        if params.min_p > 0.0 && params.min_p <= 1.0 {
            let max = candidates
                .iter()
                .map(|x| x.logit)
                .fold(f32::NEG_INFINITY, f32::max);
            let cutoff = max + params.min_p.ln();
            candidates.retain(|x| x.logit >= cutoff);
        }

        if params.temperature != 0.0 {
            let temperature = params.temperature;
            candidates.iter_mut().for_each(|x| x.logit /= temperature);
        }
        utils::softmax(&mut candidates);

        candidates
    }
}

impl Sampler for NucleusSampler {
    fn init(&mut self, model_tokens: &[u32]) {
        for &token in model_tokens {
            self.state.push(token);
        }
    }

    fn sample(&mut self, logits: &[f32]) -> u32 {
        let candidates = self.shape(logits);

        let rand = self.rng.f32();
        let token = candidates
            .into_iter()
            .scan(0.0, |cum, x| {
                *cum += x.prob;
                Some((x.id, *cum))
            })
            .find_or_last(|&(_, cum)| rand <= cum)
            .map(|(id, _)| id)
            .unwrap_or_default();

        self.state.push(token);
        token
    }

    fn reset(&mut self) {
        self.reset_penalties();
    }
}
