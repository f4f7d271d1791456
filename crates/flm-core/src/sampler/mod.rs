pub mod constrained;
pub mod history;
pub mod nucleus;
pub mod utils;

pub trait Sampler {
    /// Initialize the sampler state with tokens already present in the context.
    fn init(&mut self, model_tokens: &[u32]);
    /// Select one token from the raw logits, and also update the state.
    fn sample(&mut self, logits: &[f32]) -> u32;
    /// Forget the penalty history. Shaping parameters are kept.
    fn reset(&mut self);
}

/// Restricts which tokens may be sampled next.
pub trait Formatter {
    /// Mask the logits of tokens the current state does not admit.
    fn transform(&self, output: &mut [f32]);
    /// Advance on the chosen token and its text. Returns `true` once the grammar completes.
    fn update(&mut self, token: u32, text: &str) -> bool;
}
